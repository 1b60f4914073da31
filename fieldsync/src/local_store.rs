//! Local store adapter: bulk upserts of snapshot rows
//!
//! The engine hands the store an `INSERT OR REPLACE` statement together with a
//! flat values array; the storage technology behind it is opaque.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

/// A single stored cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StorageValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl StorageValue {
    /// Map one JSON field into a cell: booleans become 1/0, missing and null
    /// become NULL, nested values are stored as their JSON text
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        use serde_json::Value;
        match value {
            None | Some(Value::Null) => StorageValue::Null,
            Some(Value::Bool(b)) => StorageValue::Integer(i64::from(*b)),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => StorageValue::Integer(i),
                None => n.as_f64().map_or(StorageValue::Null, StorageValue::Real),
            },
            Some(Value::String(s)) => StorageValue::Text(s.clone()),
            Some(nested @ (Value::Array(_) | Value::Object(_))) => {
                StorageValue::Text(nested.to_string())
            }
        }
    }

    /// Rough in-memory footprint, used for write metrics
    pub fn estimated_size(&self) -> usize {
        match self {
            StorageValue::Null => 1,
            StorageValue::Integer(_) | StorageValue::Real(_) => 8,
            StorageValue::Text(s) => s.len(),
        }
    }
}

/// One bulk write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub sql: String,
    pub values: Vec<StorageValue>,
    /// Number of rows the values array encodes
    pub rows: usize,
}

impl WriteStatement {
    /// `INSERT OR REPLACE` covering every row in `rows`
    pub fn upsert(table: &str, columns: &[String], rows: &[Vec<StorageValue>]) -> Self {
        Self::from_values(table, columns, rows.iter().flatten().cloned().collect())
    }

    fn from_values(table: &str, columns: &[String], values: Vec<StorageValue>) -> Self {
        let width = columns.len().max(1);
        let rows = values.len() / width;
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let values_clause = vec![placeholders; rows].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES {}",
            table,
            columns.join(", "),
            values_clause
        );
        Self {
            table: table.to_string(),
            columns: columns.to_vec(),
            sql,
            values,
            rows,
        }
    }

    /// Split into statements binding at most `max_values` parameters each.
    /// A single row wider than `max_values` still gets its own statement.
    pub fn split(self, max_values: usize) -> Vec<WriteStatement> {
        if self.values.len() <= max_values {
            return vec![self];
        }
        let width = self.columns.len().max(1);
        let rows_per_statement = (max_values / width).max(1);
        self.values
            .chunks(rows_per_statement * width)
            .map(|values| Self::from_values(&self.table, &self.columns, values.to_vec()))
            .collect()
    }
}

/// On-device storage
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Prepare the table backing an entity
    async fn ensure_table(&self, table: &str, columns: &[String]) -> SyncResult<()>;

    /// Run one bulk statement; returns affected rows
    async fn execute(&self, statement: WriteStatement) -> SyncResult<u64>;
}

/// Records statements instead of persisting them
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    statements: Mutex<Vec<WriteStatement>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statements(&self) -> Vec<WriteStatement> {
        self.statements.lock().clone()
    }

    /// Every value written so far, in write order
    pub fn written_values(&self) -> Vec<StorageValue> {
        self.statements
            .lock()
            .iter()
            .flat_map(|s| s.values.iter().cloned())
            .collect()
    }

    pub fn clear(&self) {
        self.statements.lock().clear();
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn ensure_table(&self, _table: &str, _columns: &[String]) -> SyncResult<()> {
        Ok(())
    }

    async fn execute(&self, statement: WriteStatement) -> SyncResult<u64> {
        let rows = statement.rows as u64;
        self.statements.lock().push(statement);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_mapping() {
        assert_eq!(StorageValue::from_json(Some(&json!(true))), StorageValue::Integer(1));
        assert_eq!(StorageValue::from_json(Some(&json!(false))), StorageValue::Integer(0));
        assert_eq!(StorageValue::from_json(None), StorageValue::Null);
        assert_eq!(StorageValue::from_json(Some(&json!(null))), StorageValue::Null);
        assert_eq!(StorageValue::from_json(Some(&json!(42))), StorageValue::Integer(42));
        assert_eq!(StorageValue::from_json(Some(&json!(1.5))), StorageValue::Real(1.5));
        assert_eq!(
            StorageValue::from_json(Some(&json!("abc"))),
            StorageValue::Text("abc".into())
        );
        assert_eq!(
            StorageValue::from_json(Some(&json!({"a": 1}))),
            StorageValue::Text(r#"{"a":1}"#.into())
        );
    }

    #[test]
    fn test_upsert_statement_shape() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![StorageValue::Text("1".into()), StorageValue::Text("a".into())],
            vec![StorageValue::Text("2".into()), StorageValue::Null],
        ];
        let statement = WriteStatement::upsert("clients", &columns, &rows);
        assert_eq!(
            statement.sql,
            "INSERT OR REPLACE INTO clients (id, name) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(statement.values.len(), 4);
        assert_eq!(statement.rows, 2);
        assert_eq!(statement.values[3], StorageValue::Null);
    }

    #[test]
    fn test_split_respects_parameter_limit() {
        let columns = vec!["id".to_string(), "name".to_string(), "active".to_string()];
        let rows: Vec<Vec<StorageValue>> = (0..10)
            .map(|i| {
                vec![
                    StorageValue::Integer(i),
                    StorageValue::Text(format!("client {}", i)),
                    StorageValue::Integer(1),
                ]
            })
            .collect();
        let statement = WriteStatement::upsert("clients", &columns, &rows);
        let all_values = statement.values.clone();

        let parts = statement.split(12);
        let sizes: Vec<usize> = parts.iter().map(|p| p.rows).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(parts.iter().all(|p| p.values.len() <= 12));
        assert_eq!(
            parts[2].sql,
            "INSERT OR REPLACE INTO clients (id, name, active) VALUES (?, ?, ?), (?, ?, ?)"
        );

        let rejoined: Vec<StorageValue> = parts.into_iter().flat_map(|p| p.values).collect();
        assert_eq!(rejoined, all_values);
    }

    #[test]
    fn test_split_under_limit_is_unchanged() {
        let columns = vec!["id".to_string()];
        let rows = vec![vec![StorageValue::Integer(1)], vec![StorageValue::Integer(2)]];
        let statement = WriteStatement::upsert("clients", &columns, &rows);
        assert_eq!(statement.clone().split(100), vec![statement]);
    }
}
