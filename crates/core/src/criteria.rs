//! Field criteria shared by catalog lookups and queue claims.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Matches when the field is present (value `true`) or absent (value `false`).
    Exists,
}

impl QueryOperator {
    /// SQL comparison operator, `None` for `Exists`.
    pub fn sql(&self) -> Option<&'static str> {
        match self {
            Self::Eq => Some("="),
            Self::Ne => Some("<>"),
            Self::Gt => Some(">"),
            Self::Gte => Some(">="),
            Self::Lt => Some("<"),
            Self::Lte => Some("<="),
            Self::Exists => None,
        }
    }
}

/// One `field <operator> value` condition over a stored document.
///
/// `field` is a dotted path into the document (`current_location.type`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryCriteria {
    pub field: String,
    pub operator: QueryOperator,
    pub value: Value,
}

impl QueryCriteria {
    pub fn new(field: impl Into<String>, operator: QueryOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, QueryOperator::Eq, value)
    }

    /// JSON path of the field, after checking it only uses identifier characters.
    pub fn json_path(&self) -> crate::Result<String> {
        json_path(&self.field)
    }
}

/// Build a `$.a.b` JSON path from a dotted field name.
pub fn json_path(field: &str) -> crate::Result<String> {
    let valid = !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(crate::Error::InvalidCriteria(format!(
            "invalid field name: {field:?}"
        )));
    }
    Ok(format!("$.{field}"))
}
