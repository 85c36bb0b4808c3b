//! File import: SQLite database merge and CSV/TSV ingestion.
//!
//! Dispatch is by extension only (format auto-detection is out of scope).
//! One file's failure never aborts the batch, and within a SQLite merge a
//! DDL conflict on one table is reported and the remaining tables continue.

use crate::error::{DataChatError, Result};
use crate::store::TabularStore;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SQLITE_EXTENSIONS: [&str; 5] = ["sqlite3", "sqlite", "db", "s3db", "sl3"];

#[derive(Debug, Clone)]
pub struct TableImport {
    pub table: String,
    pub rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileImport {
    pub path: PathBuf,
    pub tables: Vec<TableImport>,
    pub error: Option<String>,
}

/// Per-file, per-table outcome of one import batch.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub files: Vec<FileImport>,
}

impl ImportReport {
    pub fn has_errors(&self) -> bool {
        self.files
            .iter()
            .any(|f| f.error.is_some() || f.tables.iter().any(|t| t.error.is_some()))
    }
}

/// Import a batch of files into the store. Failures are collected in the
/// report instead of propagated, so the remaining files still load.
pub fn import_files(store: &TabularStore, paths: &[PathBuf]) -> ImportReport {
    let mut report = ImportReport::default();
    for path in paths {
        let file = match import_file(store, path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "import failed");
                FileImport {
                    path: path.clone(),
                    tables: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        report.files.push(file);
    }
    report
}

/// Import a single file, dispatching on its extension.
pub fn import_file(store: &TabularStore, path: &Path) -> Result<FileImport> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let tables = if SQLITE_EXTENSIONS.contains(&ext.as_str()) {
        merge_sqlite(store, path)?
    } else if ext == "csv" {
        vec![import_dsv(store, path, b',')?]
    } else if ext == "tsv" {
        vec![import_dsv(store, path, b'\t')?]
    } else {
        return Err(DataChatError::Import(format!(
            "Unknown file type: {}",
            path.display()
        )));
    };

    info!(path = %path.display(), tables = tables.len(), "imported file");
    Ok(FileImport {
        path: path.to_path_buf(),
        tables,
        error: None,
    })
}

/// Copy every table of an uploaded SQLite database into the session store.
fn merge_sqlite(store: &TabularStore, path: &Path) -> Result<Vec<TableImport>> {
    let conn = store.conn();
    let path_sql = path.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!("ATTACH DATABASE '{}' AS upload", path_sql))?;

    let merge = || -> Result<Vec<TableImport>> {
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM upload.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let mut rows = stmt.query([])?;
        let mut tables: Vec<(String, String)> = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let sql: Option<String> = row.get(1)?;
            tables.push((name, sql.unwrap_or_default()));
        }
        drop(rows);
        drop(stmt);

        let mut imported = Vec::new();
        for (name, ddl) in tables {
            if let Err(e) = conn.execute_batch(&ddl) {
                warn!(table = %name, error = %e, "skipping table with conflicting DDL");
                imported.push(TableImport {
                    table: name,
                    rows: 0,
                    error: Some(e.to_string()),
                });
                continue;
            }
            let quoted = crate::store::quote_ident(&name);
            let copy = format!(
                "BEGIN TRANSACTION; INSERT INTO main.{q} SELECT * FROM upload.{q}; COMMIT",
                q = quoted
            );
            match conn.execute_batch(&copy) {
                Ok(()) => {
                    let count: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM main.{}", quoted),
                        [],
                        |r| r.get(0),
                    )?;
                    imported.push(TableImport {
                        table: name,
                        rows: count as usize,
                        error: None,
                    });
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    imported.push(TableImport {
                        table: name,
                        rows: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(imported)
    };

    let result = merge();
    let _ = conn.execute_batch("DETACH DATABASE upload");
    result
}

/// Parse a delimited text file and load it as one table named after the
/// file stem.
fn import_dsv(store: &TabularStore, path: &Path, delimiter: u8) -> Result<TableImport> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(DataChatError::Import(format!(
            "No header row in {}",
            path.display()
        )));
    }

    let mut records: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        records.push(record.iter().map(|f| f.to_string()).collect());
    }
    if records.is_empty() {
        return Err(DataChatError::Import(format!(
            "No data rows in {}",
            path.display()
        )));
    }

    // Column types are inferred from the first record, as the original
    // loader does.
    let types: Vec<SqlType> = (0..headers.len())
        .map(|i| infer_type(records[0].get(i).map(String::as_str).unwrap_or("")))
        .collect();

    let table = table_name_for(path);
    let column_defs = headers
        .iter()
        .zip(&types)
        .map(|(h, t)| format!("{} {}", crate::store::quote_ident(h), t.ddl()))
        .collect::<Vec<_>>()
        .join(", ");
    store.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        crate::store::quote_ident(&table),
        column_defs
    ))?;

    let rows: Vec<Vec<Value>> = records
        .iter()
        .map(|record| {
            types
                .iter()
                .enumerate()
                .map(|(i, t)| t.coerce(record.get(i).map(String::as_str).unwrap_or("")))
                .collect()
        })
        .collect();
    store.bulk_insert(&table, &headers, &rows)?;

    Ok(TableImport {
        table,
        rows: rows.len(),
        error: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    fn ddl(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }

    fn coerce(&self, raw: &str) -> Value {
        if raw.is_empty() {
            return Value::Null;
        }
        match self {
            SqlType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            SqlType::Real => raw
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f))
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            SqlType::Text => Value::String(raw.to_string()),
        }
    }
}

fn infer_type(sample: &str) -> SqlType {
    if sample.parse::<i64>().is_ok() {
        SqlType::Integer
    } else if sample.parse::<f64>().is_ok() {
        SqlType::Real
    } else {
        SqlType::Text
    }
}

/// Table name from the file stem, sanitized to `[A-Za-z0-9_]`.
fn table_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    if let Ok(re) = Regex::new(r"[^A-Za-z0-9_]") {
        re.replace_all(stem, "_").into_owned()
    } else {
        stem.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn csv_import_infers_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chocolate bars.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name,cocoa_pct,rating").unwrap();
        writeln!(f, "Dark,72.5,4").unwrap();
        writeln!(f, "Milk,35.0,3").unwrap();
        drop(f);

        let store = TabularStore::open().unwrap();
        let imported = import_file(&store, &path).unwrap();
        assert_eq!(imported.tables[0].table, "chocolate_bars");
        assert_eq!(imported.tables[0].rows, 2);

        let out = store
            .execute_rows("SELECT * FROM chocolate_bars WHERE cocoa_pct > ?", &[json!(50)])
            .unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0]["name"], json!("Dark"));
        assert_eq!(out.rows[0]["rating"], json!(4));
    }

    #[test]
    fn tsv_uses_tab_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origins.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "origin\tcount").unwrap();
        writeln!(f, "Ecuador\t10").unwrap();
        drop(f);

        let store = TabularStore::open().unwrap();
        let imported = import_file(&store, &path).unwrap();
        assert_eq!(imported.tables[0].table, "origins");
        let out = store.execute_rows("SELECT origin FROM origins", &[]).unwrap();
        assert_eq!(out.rows[0]["origin"], json!("Ecuador"));
    }

    #[test]
    fn sqlite_merge_copies_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("upload.sqlite3");
        {
            let src = rusqlite::Connection::open(&db_path).unwrap();
            src.execute_batch(
                "CREATE TABLE suppliers (id INTEGER, name TEXT);\n\
                 INSERT INTO suppliers VALUES (1, 'Cacao Co'), (2, 'Bean Traders');",
            )
            .unwrap();
        }

        let store = TabularStore::open().unwrap();
        let imported = import_file(&store, &db_path).unwrap();
        assert_eq!(imported.tables.len(), 1);
        assert_eq!(imported.tables[0].rows, 2);

        let out = store
            .execute_rows("SELECT name FROM suppliers ORDER BY id", &[])
            .unwrap();
        assert_eq!(out.rows[0]["name"], json!("Cacao Co"));
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let store = TabularStore::open().unwrap();
        let err = import_file(&store, Path::new("notes.txt")).unwrap_err();
        assert!(matches!(err, DataChatError::Import(_)));
    }

    #[test]
    fn batch_continues_after_a_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("bars.csv");
        let mut f = std::fs::File::create(&good).unwrap();
        writeln!(f, "name,rating").unwrap();
        writeln!(f, "Dark,4").unwrap();
        drop(f);

        let store = TabularStore::open().unwrap();
        let report = import_files(
            &store,
            &[dir.path().join("missing.csv"), good.clone()],
        );
        assert_eq!(report.files.len(), 2);
        assert!(report.files[0].error.is_some());
        assert!(report.files[1].error.is_none());
        assert!(report.has_errors());
        assert!(store.execute_rows("SELECT * FROM bars", &[]).is_ok());
    }
}
