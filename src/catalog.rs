//! Per-column metadata catalog.
//!
//! Built once after every data load by scanning the store; consumed
//! read-only by filter extraction (prompt context) and by the similarity
//! resolver (category lookup). Also materialized into a `_catalog` table
//! so it can be queried like any other table.

use crate::error::Result;
use crate::store::{quote_ident, TabularStore};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Distinct-count ceilings for the classification heuristic.
const ENUM_MAX_DISTINCT: i64 = 20;
const EMBEDDING_MAX_DISTINCT: i64 = 500;

/// How a column's values should be matched: fuzzily (Enum/Embedding) or
/// compared literally (Numeric/Other).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Enum,
    Embedding,
    Numeric,
    Other,
}

impl Category {
    pub fn is_fuzzy(&self) -> bool {
        matches!(self, Category::Enum | Category::Embedding)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Enum => "enum",
            Category::Embedding => "embedding",
            Category::Numeric => "numeric",
            Category::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub table: String,
    pub column: String,
    pub decl_type: String,
    pub nunique: i64,
    /// Top-5 most frequent values, joined with ", ".
    pub top5: String,
    pub category: Category,
}

/// Read-only catalog of every (table, column) pair in the store.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub columns: Vec<ColumnMetadata>,
}

impl Catalog {
    /// Scan the store and derive metadata for every user column, then
    /// materialize the result into `_catalog`.
    pub fn build(store: &TabularStore) -> Result<Self> {
        let schema = store.schema()?;
        let mut columns = Vec::new();

        for table in &schema {
            for col in &table.columns {
                let nunique = count_distinct(store, &table.name, &col.name)?;
                let top5 = top_values(store, &table.name, &col.name, 5)?;
                let category = classify(&col.decl_type, nunique);
                debug!(
                    table = %table.name,
                    column = %col.name,
                    nunique,
                    %category,
                    "cataloged column"
                );
                columns.push(ColumnMetadata {
                    table: table.name.clone(),
                    column: col.name.clone(),
                    decl_type: col.decl_type.clone(),
                    nunique,
                    top5,
                    category,
                });
            }
        }

        let catalog = Self { columns };
        catalog.materialize(store)?;
        info!(columns = catalog.columns.len(), "catalog rebuilt");
        Ok(catalog)
    }

    pub fn category_of(&self, table: &str, column: &str) -> Option<Category> {
        self.columns
            .iter()
            .find(|c| c.table == table && c.column == column)
            .map(|c| c.category)
    }

    /// Prompt context: one line per column, the shape the extractor is
    /// asked to pick tables/columns from.
    pub fn prompt_context(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                format!(
                    "{}.{} type={} distinct={} category={} top: {}",
                    c.table, c.column, c.decl_type, c.nunique, c.category, c.top5
                )
            })
            .join("\n")
    }

    /// Fingerprint of the cataloged shape, used to cache schema-derived
    /// artifacts (e.g. suggested questions) until the dataset changes.
    pub fn fingerprint(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}.{}:{}:{}", c.table, c.column, c.decl_type, c.nunique))
            .join(";")
    }

    fn materialize(&self, store: &TabularStore) -> Result<()> {
        store.execute_batch(
            "DROP TABLE IF EXISTS _catalog;\n\
             CREATE TABLE _catalog (\"table\" TEXT, \"column\" TEXT, type TEXT, nunique INTEGER, top5 TEXT, category TEXT)",
        )?;
        let columns: Vec<String> = ["table", "column", "type", "nunique", "top5", "category"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows: Vec<Vec<serde_json::Value>> = self
            .columns
            .iter()
            .map(|c| {
                vec![
                    json!(c.table),
                    json!(c.column),
                    json!(c.decl_type),
                    json!(c.nunique),
                    json!(c.top5),
                    json!(c.category.to_string()),
                ]
            })
            .collect();
        store.bulk_insert("_catalog", &columns, &rows)
    }
}

fn classify(decl_type: &str, nunique: i64) -> Category {
    let decl = decl_type.to_uppercase();
    if decl.contains("INT") || decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB")
        || decl.contains("NUM") || decl.contains("DEC")
    {
        return Category::Numeric;
    }
    if nunique <= ENUM_MAX_DISTINCT {
        Category::Enum
    } else if nunique <= EMBEDDING_MAX_DISTINCT {
        Category::Embedding
    } else {
        Category::Other
    }
}

fn count_distinct(store: &TabularStore, table: &str, column: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(DISTINCT {col}) AS n FROM {tbl}",
        col = quote_ident(column),
        tbl = quote_ident(table)
    );
    let out = store.execute_rows(&sql, &[])?;
    Ok(out
        .rows
        .first()
        .and_then(|r| r.get("n"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0))
}

fn top_values(store: &TabularStore, table: &str, column: &str, limit: usize) -> Result<String> {
    let sql = format!(
        "SELECT {col} AS v, COUNT(*) AS n FROM {tbl} WHERE {col} IS NOT NULL \
         GROUP BY {col} ORDER BY n DESC, v LIMIT {limit}",
        col = quote_ident(column),
        tbl = quote_ident(table),
        limit = limit
    );
    let out = store.execute_rows(&sql, &[])?;
    Ok(out
        .rows
        .iter()
        .filter_map(|r| r.get("v").map(crate::store::value_to_display))
        .join(", "))
}
