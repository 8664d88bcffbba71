//! Column decoding for the sqlx-backed sessions.
//!
//! Rows are turned into JSON arrays in two steps: the column's type name is
//! classified into a [`TypeCategory`], then a backend-specific decoder pulls
//! the value out with the Rust types that category allows. NULLs are detected
//! up front from the raw value so decoders only see present values.

use crate::models::{BackendKind, QueryResult};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
}

/// Classify a database type name into a logical category.
pub(crate) fn categorize_type(type_name: &str, backend: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal before the float checks; SQLite's NUMERIC affinity is a float
    if lower.contains("decimal") || lower.contains("numeric") {
        return if backend == BackendKind::Sqlite {
            TypeCategory::Float
        } else {
            TypeCategory::Decimal
        };
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") || lower == "tiny" {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    // SQLite stores dates as text, so only the server backends get here
    if backend != BackendKind::Sqlite
        && (lower.starts_with("timestamp")
            || lower == "datetime"
            || lower == "date"
            || lower.starts_with("time"))
    {
        return TypeCategory::Temporal;
    }
    TypeCategory::Text
}

/// Exact DECIMAL/NUMERIC text, keeping the database's representation.
#[derive(Debug)]
pub(crate) struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        categorize_type(ty.name(), BackendKind::MySql) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        categorize_type(ty.name(), BackendKind::PostgreSql) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary columns are returned base64-encoded.
pub(crate) fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Try each Rust type in order, returning the first successful decode.
macro_rules! first_decoded {
    ($row:expr, $idx:expr; $($ty:ty => $map:expr),+ $(,)?) => {{
        let mut decoded = None;
        $(
            if decoded.is_none() {
                if let Ok(v) = $row.try_get::<$ty, _>($idx) {
                    decoded = Some(($map)(v));
                }
            }
        )+
        decoded
    }};
}

/// Rows that can be rendered as JSON arrays.
pub(crate) trait DecodeRow: Row {
    const BACKEND: BackendKind;

    /// Decode a non-NULL value of the given category.
    fn decode_present(&self, idx: usize, category: TypeCategory) -> Option<JsonValue>;

    /// Whether the value is NULL (or unreadable).
    fn is_null_at(&self, idx: usize) -> bool;

    /// Type name used for classification. Declared column type by default.
    fn type_name_at(&self, idx: usize) -> String {
        self.columns()[idx].type_info().name().to_string()
    }

    fn decode_at(&self, idx: usize) -> JsonValue {
        if self.is_null_at(idx) {
            return JsonValue::Null;
        }
        let type_name = self.type_name_at(idx);
        let category = categorize_type(&type_name, Self::BACKEND);
        self.decode_present(idx, category).unwrap_or_else(|| {
            tracing::debug!(
                column = idx,
                type_name = %type_name,
                "Column type not decodable, returning null"
            );
            JsonValue::Null
        })
    }
}

/// Convert fetched rows into a [`QueryResult`].
///
/// Column names come from the first row, so an empty result has no columns.
pub(crate) fn rows_to_result<R: DecodeRow>(rows: &[R]) -> QueryResult {
    let Some(first) = rows.first() else {
        return QueryResult::empty();
    };
    let columns: Vec<String> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let data = rows
        .iter()
        .map(|row| (0..columns.len()).map(|idx| row.decode_at(idx)).collect())
        .collect();
    QueryResult::new(columns, data)
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn text_as_json(s: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&s) {
            return json;
        }
    }
    JsonValue::String(s)
}

impl DecodeRow for MySqlRow {
    const BACKEND: BackendKind = BackendKind::MySql;

    fn is_null_at(&self, idx: usize) -> bool {
        self.try_get_raw(idx).map(|raw| raw.is_null()).unwrap_or(true)
    }

    fn decode_present(&self, idx: usize, category: TypeCategory) -> Option<JsonValue> {
        match category {
            TypeCategory::Decimal => first_decoded!(self, idx; RawDecimal => |v: RawDecimal| JsonValue::String(v.0)),
            TypeCategory::Integer => first_decoded!(self, idx;
                i64 => JsonValue::from,
                u64 => JsonValue::from,
                i32 => JsonValue::from,
                u32 => JsonValue::from,
                i16 => JsonValue::from,
                u16 => JsonValue::from,
                i8 => JsonValue::from,
                u8 => JsonValue::from,
            ),
            TypeCategory::Boolean => first_decoded!(self, idx; bool => JsonValue::Bool),
            TypeCategory::Float => first_decoded!(self, idx;
                f64 => float_value,
                f32 => |v: f32| float_value(v as f64),
            ),
            TypeCategory::Binary => first_decoded!(self, idx; Vec<u8> => |v: Vec<u8>| encode_binary(&v)),
            TypeCategory::Json => first_decoded!(self, idx; JsonValue => |v| v),
            TypeCategory::Temporal => first_decoded!(self, idx;
                chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| JsonValue::String(v.to_rfc3339()),
                chrono::NaiveDateTime => |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()),
                chrono::NaiveDate => |v: chrono::NaiveDate| JsonValue::String(v.to_string()),
                chrono::NaiveTime => |v: chrono::NaiveTime| JsonValue::String(v.to_string()),
            ),
            TypeCategory::Uuid | TypeCategory::Text => {
                let type_name = self.type_name_at(idx);
                first_decoded!(self, idx;
                    String => |v: String| text_as_json(v, &type_name),
                    Vec<u8> => |v: Vec<u8>| encode_binary(&v),
                )
            }
        }
    }
}

impl DecodeRow for PgRow {
    const BACKEND: BackendKind = BackendKind::PostgreSql;

    fn is_null_at(&self, idx: usize) -> bool {
        self.try_get_raw(idx).map(|raw| raw.is_null()).unwrap_or(true)
    }

    fn decode_present(&self, idx: usize, category: TypeCategory) -> Option<JsonValue> {
        match category {
            TypeCategory::Decimal => first_decoded!(self, idx; RawDecimal => |v: RawDecimal| JsonValue::String(v.0)),
            TypeCategory::Integer => first_decoded!(self, idx;
                i64 => JsonValue::from,
                i32 => JsonValue::from,
                i16 => JsonValue::from,
            ),
            TypeCategory::Boolean => first_decoded!(self, idx; bool => JsonValue::Bool),
            TypeCategory::Float => first_decoded!(self, idx;
                f64 => float_value,
                f32 => |v: f32| float_value(v as f64),
            ),
            TypeCategory::Binary => first_decoded!(self, idx; Vec<u8> => |v: Vec<u8>| encode_binary(&v)),
            TypeCategory::Json => first_decoded!(self, idx; JsonValue => |v| v),
            TypeCategory::Uuid => first_decoded!(self, idx; sqlx::types::Uuid => |v: sqlx::types::Uuid| JsonValue::String(v.to_string())),
            TypeCategory::Temporal => first_decoded!(self, idx;
                chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| JsonValue::String(v.to_rfc3339()),
                chrono::NaiveDateTime => |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()),
                chrono::NaiveDate => |v: chrono::NaiveDate| JsonValue::String(v.to_string()),
                chrono::NaiveTime => |v: chrono::NaiveTime| JsonValue::String(v.to_string()),
            ),
            TypeCategory::Text => first_decoded!(self, idx; String => JsonValue::String),
        }
    }
}

impl DecodeRow for SqliteRow {
    const BACKEND: BackendKind = BackendKind::Sqlite;

    fn is_null_at(&self, idx: usize) -> bool {
        self.try_get_raw(idx).map(|raw| raw.is_null()).unwrap_or(true)
    }

    /// Storage class of the actual value; SQLite columns are dynamically typed.
    fn type_name_at(&self, idx: usize) -> String {
        self.try_get_raw(idx)
            .map(|raw| raw.type_info().name().to_string())
            .unwrap_or_else(|_| self.columns()[idx].type_info().name().to_string())
    }

    fn decode_present(&self, idx: usize, category: TypeCategory) -> Option<JsonValue> {
        match category {
            TypeCategory::Integer => first_decoded!(self, idx; i64 => JsonValue::from),
            TypeCategory::Boolean => first_decoded!(self, idx; bool => JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => first_decoded!(self, idx; f64 => float_value),
            TypeCategory::Binary => first_decoded!(self, idx; Vec<u8> => |v: Vec<u8>| encode_binary(&v)),
            _ => {
                let declared = self.columns()[idx].type_info().name().to_string();
                first_decoded!(self, idx; String => |v: String| text_as_json(v, &declared))
            }
        }
    }
}
