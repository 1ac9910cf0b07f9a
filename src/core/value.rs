//! Purpose: Typed values returned by an interpreter call.
//! Exports: `Value`.
//! Role: Shared currency between the link, the command handles and the HTTP layer.
//! Invariants: Variants are closed; interpreter errors travel as `Error`, never as a value.
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Double(f64),
    Strings(Vec<String>),
    Raw(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Double(_) => "double",
            Value::Strings(_) => "strings",
            Value::Raw(_) => "raw",
        }
    }

    /// String-vector view; `Null` reads as an empty listing.
    pub fn as_strings(&self) -> Result<Vec<String>, Error> {
        match self {
            Value::Strings(items) => Ok(items.clone()),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::new(ErrorKind::Execution).with_message(format!(
                "expected a string vector, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_raw(&self) -> Result<&[u8], Error> {
        match self {
            Value::Raw(bytes) => Ok(bytes),
            other => Err(Error::new(ErrorKind::Execution).with_message(format!(
                "expected a raw buffer, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Double(value) => serde_json::json!(value),
            Value::Strings(items) => serde_json::json!(items),
            Value::Raw(bytes) => serde_json::json!(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use crate::core::error::ErrorKind;

    #[test]
    fn null_reads_as_empty_listing() {
        assert!(Value::Null.as_strings().expect("strings").is_empty());
    }

    #[test]
    fn wrong_shape_is_execution_error() {
        let err = Value::Double(36.6).as_strings().expect_err("not strings");
        assert_eq!(err.kind(), ErrorKind::Execution);
        let err = Value::Strings(vec!["D".into()]).as_raw().expect_err("not raw");
        assert_eq!(err.kind(), ErrorKind::Execution);
    }
}
