//! Dynamically-typed task payloads.
//!
//! Task arguments and results cross worker boundaries, so they are
//! JSON values rather than native types; the registry's task functions
//! do their own downcasting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

pub use serde_json::Value;

/// Positional and keyword arguments of one task invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Args::default()
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Args { positional: values.into_iter().collect(), keyword: BTreeMap::new() }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kw(&self, key: &str) -> Option<&Value> {
        self.keyword.get(key)
    }

    /// Downcast helper for the common integer argument.
    pub fn int(&self, index: usize) -> Result<i64, TaskError> {
        self.get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskError::new("type", format!("argument {index} is not an integer")))
    }

    pub fn str(&self, index: usize) -> Result<&str, TaskError> {
        self.get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::new("type", format!("argument {index} is not a string")))
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Args { positional, keyword: BTreeMap::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn downcasts_report_the_offending_index() {
        let args = Args::new().arg(3).arg("x");
        assert_eq!(args.int(0).unwrap(), 3);
        let err = args.int(1).unwrap_err();
        assert_eq!(err.kind, "type");
        assert!(err.message.contains('1'));
    }

    #[test]
    fn keyword_arguments_are_preserved_by_encoding() {
        let args = Args::positional([json!(1), json!(2)]).kwarg("scale", 10);
        let bytes = serde_json::to_vec(&args).unwrap();
        let back: Args = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, args);
        assert_eq!(back.kw("scale"), Some(&json!(10)));
    }
}
