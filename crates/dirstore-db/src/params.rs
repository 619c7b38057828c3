//! Named statement parameters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use sqlx::Arguments;
use uuid::Uuid;

use crate::error::DbError;

/// A value bound to a named parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    TextArray(Vec<String>),
}

impl ParamValue {
    pub(crate) fn add_to(&self, args: &mut PgArguments) -> Result<(), sqlx::error::BoxDynError> {
        match self {
            Self::Text(value) => args.add(value.clone()),
            Self::Int(value) => args.add(*value),
            Self::Bool(value) => args.add(*value),
            Self::Uuid(value) => args.add(*value),
            Self::Timestamp(value) => args.add(*value),
            Self::Json(value) => args.add(Json(value.clone())),
            Self::TextArray(value) => args.add(value.clone()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for ParamValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

/// Parameter set for one statement execution, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    values: HashMap<String, ParamValue>,
}

impl QueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`QueryParams::set`].
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Serialize `value` and bind it as JSON.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidStatement` if `value` does not serialize.
    pub fn set_json<T: serde::Serialize>(&mut self, name: &str, value: &T) -> Result<(), DbError> {
        let json = serde_json::to_value(value)
            .map_err(|err| DbError::InvalidStatement(format!("cannot encode :{name}: {err}")))?;
        self.set(name, json);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Add every parameter of `other`; on a name clash `other` wins.
    pub fn extend(&mut self, other: QueryParams) {
        self.values.extend(other.values);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_extend() {
        let mut params = QueryParams::new().with("dnNorm", "cn=a").with("pageSize", 10i64);
        params.extend(QueryParams::new().with("pageSize", 20i64).with("offset", 0i64));
        assert_eq!(params.len(), 3);
        assert_eq!(params.get("pageSize"), Some(&ParamValue::Int(20)));
        assert_eq!(params.get("dnNorm"), Some(&ParamValue::Text("cn=a".to_string())));
    }

    #[test]
    fn test_set_json() {
        let mut params = QueryParams::new();
        params
            .set_json("attrsNorm", &serde_json::json!({ "cn": ["a"] }))
            .unwrap();
        assert!(matches!(params.get("attrsNorm"), Some(ParamValue::Json(_))));
    }
}
