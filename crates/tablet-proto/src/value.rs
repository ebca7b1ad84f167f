//! Value and result model.
//!
//! Pure data: typed scalars, result fields and rows, bound queries and the
//! query splits produced by the splitter.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed scalar carried in a row or bound as a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an unsigned key, if it is a non-negative integer.
    #[must_use]
    pub fn as_key(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "x'{}'", hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Describes one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Database column type tag.
    pub field_type: i64,
}

impl Field {
    /// Creates a new field.
    pub fn new(name: impl Into<String>, field_type: i64) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// One row of values, ordered like the result's fields.
pub type Row = Vec<Value>;

/// The result of a statement, or one chunk of a streamed result.
///
/// A full result always has fields. A streamed chunk has either fields
/// (the header, first chunk only) or rows, never both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result columns; empty on row-only chunks.
    pub fields: Vec<Field>,
    /// Result rows; empty on header-only chunks.
    pub rows: Vec<Row>,
    /// Rows changed by a DML statement.
    pub rows_affected: u64,
    /// Last auto-increment id generated by the statement.
    pub insert_id: u64,
}

impl QueryResult {
    /// Creates a header chunk carrying only fields.
    #[must_use]
    pub fn header(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Creates a chunk carrying only rows.
    #[must_use]
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Returns true if this chunk carries fields and no rows.
    #[must_use]
    pub fn is_header(&self) -> bool {
        !self.fields.is_empty() && self.rows.is_empty()
    }

    /// Returns true if this chunk carries no fields.
    #[must_use]
    pub fn is_rows_only(&self) -> bool {
        self.fields.is_empty()
    }
}

/// SQL text plus named parameter values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundQuery {
    /// Statement text.
    pub sql: String,
    /// Bind variables by name, without the leading colon.
    pub bind_variables: BTreeMap<String, Value>,
}

impl BoundQuery {
    /// Creates a query without bind variables.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind_variables: BTreeMap::new(),
        }
    }

    /// Adds a bind variable.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind_variables.insert(name.into(), value.into());
        self
    }
}

/// One partition of a split query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySplit {
    /// The original query restricted to one key range.
    pub query: BoundQuery,
    /// Estimated number of rows the query returns.
    pub row_count: i64,
}
