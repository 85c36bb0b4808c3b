//! In-session tabular store backed by SQLite.
//!
//! The store is a black-box relational engine to the rest of the crate:
//! DDL/DML plus ad hoc SELECT with parameter binding. One connection per
//! session; every statement is prepared, executed, and finalized as a
//! discrete scoped unit.

use crate::error::{DataChatError, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;

/// A result row keyed by column name (rowMode "object" semantics).
pub type Row = HashMap<String, Value>;

/// Rows plus the column order the statement produced them in.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub notnull: bool,
    pub pk: bool,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub sql: String,
    pub columns: Vec<ColumnInfo>,
}

pub struct TabularStore {
    conn: Connection,
}

impl TabularStore {
    /// Open a fresh in-memory store.
    pub fn open() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run one or more statements that produce no rows.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a SELECT with positional parameters, returning object rows.
    pub fn execute_rows(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let bound: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = Row::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                obj.insert(name.clone(), sql_to_json(row.get_ref(i)?));
            }
            out.push(obj);
        }
        Ok(QueryOutput { columns, rows: out })
    }

    /// Bulk insert with a prepared statement inside an explicit transaction.
    pub fn bulk_insert(&self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            column_list,
            placeholders
        );

        self.conn.execute_batch("BEGIN TRANSACTION")?;
        let insert_result = (|| -> Result<()> {
            let mut stmt = self.conn.prepare(&sql)?;
            for row in rows {
                if row.len() != columns.len() {
                    return Err(DataChatError::Import(format!(
                        "Row width {} does not match {} columns in {}",
                        row.len(),
                        columns.len(),
                        table
                    )));
                }
                let bound: Vec<rusqlite::types::Value> = row.iter().map(json_to_sql).collect();
                stmt.execute(rusqlite::params_from_iter(bound.iter()))?;
            }
            Ok(())
        })();
        match insert_result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// All user tables with their DDL and column info.
    pub fn schema(&self) -> Result<Vec<TableInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\\_%' ESCAPE '\\'",
        )?;
        let mut tables = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let sql: Option<String> = row.get(1)?;
            tables.push((name, sql.unwrap_or_default()));
        }
        drop(rows);
        drop(stmt);

        let mut out = Vec::new();
        for (name, sql) in tables {
            let columns = self.table_columns(&name)?;
            out.push(TableInfo { name, sql, columns });
        }
        Ok(out)
    }

    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let mut rows = stmt.query([])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            columns.push(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get(2)?,
                notnull: row.get::<_, i64>(3)? != 0,
                pk: row.get::<_, i64>(5)? != 0,
            });
        }
        Ok(columns)
    }

    /// Distinct non-null values of a column, stringified, in column order.
    pub fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM {tbl} WHERE {col} IS NOT NULL ORDER BY {col}",
            col = quote_ident(column),
            tbl = quote_ident(table)
        );
        let output = self.execute_rows(&sql, &[])?;
        Ok(output
            .rows
            .iter()
            .filter_map(|r| r.get(column).map(value_to_display))
            .collect())
    }
}

/// Double-quote an identifier for SQLite, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a JSON cell the way SQLite would render it as TEXT.
pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}
