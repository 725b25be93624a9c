use std::collections::BTreeMap;

use google_api_proto::google::spanner::v1::TypeCode;
use prost_types::Value;

use crate::ToSpanner;

/// A SQL statement and its named parameters.
///
/// ```
/// # use spanner_rs::Statement;
/// let statement = Statement::new("SELECT * FROM person WHERE id = @id").bind("id", 42);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub(crate) sql: String,
    pub(crate) params: BTreeMap<String, (Value, TypeCode)>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    /// Binds `value` to the `@name` parameter, replacing any previous binding.
    pub fn bind<T: ToSpanner>(mut self, name: &str, value: T) -> Self {
        self.params.insert(
            name.to_string(),
            (
                Value {
                    kind: Some(value.to_kind()),
                },
                T::spanner_type(),
            ),
        );
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}
