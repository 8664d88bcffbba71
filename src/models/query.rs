//! Query-related data models.
//!
//! This module defines statement parameters, tabular results and the batch
//! request/response shapes.

use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON where the backend supports it
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Tabular query result: ordered column names plus row-major data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    /// (row_count, column_count)
    pub shape: (usize, usize),
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Build a result; the shape is derived from the data.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        let shape = (rows.len(), columns.len());
        Self {
            columns,
            rows,
            shape,
            execution_time_ms: 0,
        }
    }

    /// A result with no columns and no rows.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.shape.0
    }

    /// Check if the result has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub affected_rows: u64,
    pub execution_time_ms: u64,
}

/// One entry of a batch: a statement and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl BatchOperation {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Decode one JSON batch entry.
    ///
    /// Accepted shapes are a bare SQL string or `{"sql": "...", "params": [...]}`.
    pub fn from_json(value: &JsonValue) -> PoolResult<Self> {
        match value {
            JsonValue::String(sql) => Ok(Self::new(sql.clone())),
            JsonValue::Object(map) => {
                let sql = match map.get("sql") {
                    Some(JsonValue::String(sql)) => sql.clone(),
                    Some(other) => {
                        return Err(PoolError::validation(format!(
                            "'sql' must be a string, got {}",
                            json_type_name(other)
                        )));
                    }
                    None => return Err(PoolError::validation("missing 'sql' field")),
                };
                let params = match map.get("params") {
                    None | Some(JsonValue::Null) => Vec::new(),
                    Some(JsonValue::Array(items)) => items
                        .iter()
                        .map(|v| serde_json::from_value(v.clone()))
                        .collect::<Result<Vec<QueryParam>, _>>()
                        .map_err(|e| PoolError::validation(format!("invalid params: {}", e)))?,
                    Some(other) => {
                        return Err(PoolError::validation(format!(
                            "'params' must be an array, got {}",
                            json_type_name(other)
                        )));
                    }
                };
                Ok(Self { sql, params })
            }
            other => Err(PoolError::validation(format!(
                "batch entry must be a string or an object, got {}",
                json_type_name(other)
            ))),
        }
    }

    /// Decode a whole JSON batch. Any malformed entry rejects the batch.
    pub fn parse_batch(values: &[JsonValue]) -> PoolResult<Vec<Self>> {
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                Self::from_json(value).map_err(|e| match e {
                    PoolError::ValidationError { message } => {
                        PoolError::validation(format!("batch entry {}: {}", idx, message))
                    }
                    other => other,
                })
            })
            .collect()
    }
}

impl From<&str> for BatchOperation {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Outcome of one batch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: usize,
    pub affected_rows: u64,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    pub fn success(index: usize, affected_rows: u64, execution_time_ms: u64) -> Self {
        Self {
            index,
            affected_rows,
            execution_time_ms,
            error: None,
        }
    }

    pub fn failure(index: usize, execution_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            index,
            affected_rows: 0,
            execution_time_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
