//! Extract SQL text from a raw generator response.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SQL_BLOCK: Regex = Regex::new(r"(?is)```\s*sql[ \t]*\r?\n(.*?)```").unwrap();
    static ref GENERIC_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").unwrap();
    static ref PREFIX: Regex = Regex::new(r"(?i)^(?:sql\s+query|sql|query)\s*:").unwrap();
    static ref MARKUP: Regex = Regex::new(r"(?i)</?(?:sql|code|s)>").unwrap();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlParser;

impl SqlParser {
    pub fn new() -> Self {
        Self
    }

    /// Prefer a ```sql block, then any fenced block, else the cleaned raw text
    pub fn parse(&self, response: &str) -> String {
        if let Some(caps) = SQL_BLOCK.captures(response) {
            return caps[1].trim().to_string();
        }
        if let Some(caps) = GENERIC_BLOCK.captures(response) {
            return caps[1].trim().to_string();
        }

        let without_markup = MARKUP.replace_all(response, "");
        let cleaned = without_markup.trim();
        PREFIX.replace(cleaned, "").trim().to_string()
    }

    /// Case-insensitive comparison against the no-query sentinel
    pub fn is_sentinel(&self, sql: &str, sentinel: &str) -> bool {
        sql.trim().eq_ignore_ascii_case(sentinel.trim())
    }
}
