//! Schema Retriever
//!
//! Ranks schema tables against a question and formats them as prompt
//! context. Ranking is lexical token overlap; embedding search lives behind
//! the same [`ContextProvider`] trait.

use crate::error::Result;
use crate::schema::{ElementKind, SchemaElement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetKind {
    Table,
    Column,
    Other,
}

/// One ranked piece of context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub id: String,
    pub kind: SnippetKind,
    pub content: String,
    pub score: f32,
}

/// Supplies ranked context for a question
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn retrieve(&self, question: &str) -> Result<Vec<ContextSnippet>>;

    fn format(&self, snippets: &[ContextSnippet]) -> String {
        format_snippets(snippets)
    }
}

/// Render snippets as a single context string, one block per snippet
pub fn format_snippets(snippets: &[ContextSnippet]) -> String {
    snippets
        .iter()
        .map(|snippet| match snippet.kind {
            SnippetKind::Table => format!("Table Schema: {}", snippet.content),
            SnippetKind::Column => format!("Column Description: {}", snippet.content),
            SnippetKind::Other => snippet.content.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Clone)]
struct TableEntry {
    name: String,
    columns: Vec<(String, Option<String>)>,
    tokens: HashSet<String>,
    name_tokens: HashSet<String>,
}

impl TableEntry {
    fn describe(&self) -> String {
        if self.columns.is_empty() {
            return self.name.clone();
        }
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, dtype)| match dtype {
                Some(dtype) => format!("{} {}", name, dtype),
                None => name.clone(),
            })
            .collect();
        format!("{} ({})", self.name, columns.join(", "))
    }
}

/// Context provider over a loaded schema
#[derive(Debug, Clone)]
pub struct SchemaContextProvider {
    tables: Vec<TableEntry>,
    top_k: usize,
}

impl SchemaContextProvider {
    pub fn new(elements: &[SchemaElement], top_k: usize) -> Self {
        let mut grouped: BTreeMap<String, TableEntry> = BTreeMap::new();

        for element in elements {
            let table = match element.kind {
                ElementKind::Table | ElementKind::View => element.name.clone(),
                ElementKind::Column => match element.owning_table() {
                    Some(table) => table.to_string(),
                    None => continue,
                },
            };
            let entry = grouped
                .entry(table.to_lowercase())
                .or_insert_with(|| TableEntry {
                    name: table.clone(),
                    columns: Vec::new(),
                    tokens: HashSet::new(),
                    name_tokens: tokenize(&table),
                });
            if element.kind == ElementKind::Column {
                let column = element.short_name().to_string();
                entry.tokens.extend(tokenize(&column));
                entry
                    .columns
                    .push((column, element.dtype().map(str::to_string)));
            }
        }

        let tables = grouped
            .into_values()
            .map(|mut entry| {
                let name_tokens = entry.name_tokens.clone();
                entry.tokens.extend(name_tokens);
                entry
            })
            .collect();

        Self { tables, top_k }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn score(&self, entry: &TableEntry, question_tokens: &HashSet<String>) -> f32 {
        let name_hits = entry.name_tokens.intersection(question_tokens).count() as f32;
        let hits = entry.tokens.intersection(question_tokens).count() as f32;
        hits + 2.0 * name_hits
    }
}

#[async_trait]
impl ContextProvider for SchemaContextProvider {
    async fn retrieve(&self, question: &str) -> Result<Vec<ContextSnippet>> {
        let question_tokens = tokenize(question);
        let mut ranked: Vec<ContextSnippet> = self
            .tables
            .iter()
            .map(|entry| ContextSnippet {
                id: format!("table:{}", entry.name),
                kind: SnippetKind::Table,
                content: entry.describe(),
                score: self.score(entry, &question_tokens),
            })
            .collect();

        // stable sort keeps alphabetical order among equal scores
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.top_k);

        debug!(
            "Retrieved {} snippets: {:?}",
            ranked.len(),
            ranked.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
        );
        Ok(ranked)
    }
}

/// Lowercase word tokens, split on anything non-alphanumeric, with a naive
/// plural strip so "patients" meets "patient".
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(|w| {
            let w = w.to_lowercase();
            match w.strip_suffix('s') {
                Some(stem) if stem.len() > 2 => stem.to_string(),
                _ => w,
            }
        })
        .collect()
}
