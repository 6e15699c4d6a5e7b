//! Schema Snapshot
//!
//! Immutable table -> columns map used by the validator and the context
//! provider. Names are lowercased on the way in so lookups are
//! case-insensitive.

use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Kind of schema element, as written by the schema export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Table,
    View,
    Column,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
}

/// One table, view or column of the data store.
/// Columns are named `table.column` with the owning table in metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaElement {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<ElementMetadata>,
}

impl SchemaElement {
    pub fn table(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ElementKind::Table,
            description: Some(format!("Table: {}", name)),
            metadata: None,
        }
    }

    pub fn column(table: &str, column: &str, dtype: &str) -> Self {
        Self {
            name: format!("{}.{}", table, column),
            kind: ElementKind::Column,
            description: Some(format!("Column: {} ({})", column, dtype)),
            metadata: Some(ElementMetadata {
                table: Some(table.to_string()),
                dtype: Some(dtype.to_string()),
            }),
        }
    }

    /// Column name without the table prefix
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn owning_table(&self) -> Option<&str> {
        match self.kind {
            ElementKind::Column => self
                .metadata
                .as_ref()
                .and_then(|m| m.table.as_deref())
                .or_else(|| self.name.rsplit_once('.').map(|(table, _)| table)),
            _ => None,
        }
    }

    pub fn dtype(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.dtype.as_deref())
    }
}

/// Immutable snapshot of known tables and their columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    tables: HashMap<String, HashSet<String>>,
}

impl SchemaSnapshot {
    /// Snapshot with no tables; disables schema and column checks
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tables<I, T, C, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (T, C)>,
        T: AsRef<str>,
        C: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tables = tables
            .into_iter()
            .map(|(table, columns)| {
                let columns = columns
                    .into_iter()
                    .map(|c| c.as_ref().to_lowercase())
                    .collect();
                (table.as_ref().to_lowercase(), columns)
            })
            .collect();
        Self { tables }
    }

    pub fn from_elements(elements: &[SchemaElement]) -> Self {
        let mut tables: HashMap<String, HashSet<String>> = HashMap::new();
        for element in elements {
            match element.kind {
                ElementKind::Table | ElementKind::View => {
                    tables.entry(element.name.to_lowercase()).or_default();
                }
                ElementKind::Column => {
                    if let Some(table) = element.owning_table() {
                        tables
                            .entry(table.to_lowercase())
                            .or_default()
                            .insert(element.short_name().to_lowercase());
                    }
                }
            }
        }
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_lowercase())
    }

    /// Columns of a known table, `None` if the table is unknown
    pub fn columns(&self, table: &str) -> Option<&HashSet<String>> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .map(|cols| cols.contains(&column.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Supplies schema elements once, when the orchestrator is built
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_schema(&self) -> Result<Vec<SchemaElement>>;
}

/// Schema read from a JSON file: either the export format (array of
/// elements) or a plain `{"table": ["column", ...]}` map.
#[derive(Debug, Clone)]
pub struct JsonSchemaSource {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Elements(Vec<SchemaElement>),
    TableMap(BTreeMap<String, Vec<String>>),
}

impl JsonSchemaSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(raw: &str) -> Result<Vec<SchemaElement>> {
        let document: SchemaDocument = serde_json::from_str(raw)?;
        Ok(match document {
            SchemaDocument::Elements(elements) => elements,
            SchemaDocument::TableMap(map) => {
                let mut elements = Vec::new();
                for (table, columns) in map {
                    elements.push(SchemaElement::table(&table));
                    for column in columns {
                        elements.push(SchemaElement::column(&table, &column, "unknown"));
                    }
                }
                elements
            }
        })
    }
}

#[async_trait]
impl SchemaSource for JsonSchemaSource {
    async fn load_schema(&self) -> Result<Vec<SchemaElement>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RagError::Configuration(format!(
                "Failed to read schema file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let elements = Self::parse(&raw)?;
        info!(
            "Loaded {} schema elements from {}",
            elements.len(),
            self.path.display()
        );
        Ok(elements)
    }
}
