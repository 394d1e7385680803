//! Call-time parameter values for compiled queries.

use rusqlite::types::Value;
use std::collections::HashMap;

/// One bound parameter: a scalar or a list expanded into an IN-list.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Scalar(Value),
    List(Vec<Value>),
}

impl Arg {
    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Scalar(Value::Text(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Scalar(Value::Text(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Scalar(Value::Integer(value))
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Self::Scalar(Value::Integer(i64::from(value)))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Scalar(Value::Integer(i64::from(value)))
    }
}

impl From<Option<i64>> for Arg {
    fn from(value: Option<i64>) -> Self {
        Self::Scalar(value.map_or(Value::Null, Value::Integer))
    }
}

impl From<&[&str]> for Arg {
    fn from(values: &[&str]) -> Self {
        Self::list(values.iter().map(|value| value.to_string()))
    }
}

impl From<Vec<String>> for Arg {
    fn from(values: Vec<String>) -> Self {
        Self::list(values)
    }
}

impl From<&[i64]> for Arg {
    fn from(values: &[i64]) -> Self {
        Self::list(values.iter().copied())
    }
}

impl From<Vec<i64>> for Arg {
    fn from(values: Vec<i64>) -> Self {
        Self::list(values)
    }
}

/// Named (`:name`) and positional (`?1`, derived clauses) values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    named: HashMap<String, Arg>,
    positional: Vec<Arg>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, value: impl Into<Arg>) -> Self {
        self.named.insert(name.to_string(), value.into());
        self
    }

    /// Appends the next positional value (`?1` is the first).
    pub fn push(mut self, value: impl Into<Arg>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub(crate) fn named(&self, name: &str) -> Option<&Arg> {
        self.named.get(name)
    }

    pub(crate) fn positional(&self, index: usize) -> Option<&Arg> {
        index
            .checked_sub(1)
            .and_then(|zero_based| self.positional.get(zero_based))
    }
}
