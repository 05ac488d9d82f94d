//! Port data types and the coercion table that decides which port pairs may
//! be connected and how runtime values are converted between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The type carried by a port.
///
/// Serialized as a string: `any`, `string`, `number`, `integer`, `boolean`,
/// `object`, or `list<T>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    /// Accepts any value. Checked at runtime only.
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    List(Box<DataType>),
}

impl DataType {
    pub fn list(element: DataType) -> Self {
        DataType::List(Box::new(element))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, DataType::List(_))
    }

    /// Whether a runtime value already has this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            DataType::Any => true,
            DataType::String => value.is_string(),
            DataType::Number => value.is_number(),
            DataType::Integer => value.is_i64() || value.is_u64(),
            DataType::Boolean => value.is_boolean(),
            DataType::Object => value.is_object(),
            DataType::List(element) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| element.matches(v))),
        }
    }

    /// Whether an output of type `self` may be wired to an input of type `to`
    /// at all. Lists never feed scalar inputs.
    pub fn structurally_compatible(&self, to: &DataType) -> bool {
        match (self, to) {
            (_, DataType::Any) | (DataType::Any, _) => true,
            (DataType::List(_), other) => other.is_list(),
            _ => true,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Any => write!(f, "any"),
            DataType::String => write!(f, "string"),
            DataType::Number => write!(f, "number"),
            DataType::Integer => write!(f, "integer"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::Object => write!(f, "object"),
            DataType::List(element) => write!(f, "list<{}>", element),
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        if let Some(inner) = lower
            .strip_prefix("list<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Ok(DataType::list(inner.parse()?));
        }
        match lower.as_str() {
            "any" | "dynamic" => Ok(DataType::Any),
            "string" => Ok(DataType::String),
            "number" => Ok(DataType::Number),
            "integer" => Ok(DataType::Integer),
            "boolean" => Ok(DataType::Boolean),
            "object" => Ok(DataType::Object),
            _ => Err(format!("unknown data type '{}'", s)),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DataType> for String {
    fn from(t: DataType) -> Self {
        t.to_string()
    }
}

/// Short name of a JSON value's kind, for error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("expected {expected}, found {found}")]
pub struct CoercionError {
    pub expected: DataType,
    pub found: &'static str,
}

/// How permissive the coercion table is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionMode {
    /// Identity, `any`, list wrapping, `integer -> number`, scalar -> `string`.
    #[default]
    Lenient,
    /// Identity, `any`, and list wrapping only.
    Strict,
}

/// Declared table of permitted `(source type -> destination type)` pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoercionTable {
    mode: CoercionMode,
}

impl CoercionTable {
    pub fn new(mode: CoercionMode) -> Self {
        Self { mode }
    }

    pub fn lenient() -> Self {
        Self::new(CoercionMode::Lenient)
    }

    pub fn strict() -> Self {
        Self::new(CoercionMode::Strict)
    }

    pub fn mode(&self) -> CoercionMode {
        self.mode
    }

    /// Whether an output of type `from` may feed an input of type `to`.
    pub fn can_coerce(&self, from: &DataType, to: &DataType) -> bool {
        if from == to {
            return true;
        }
        match (from, to) {
            (_, DataType::Any) | (DataType::Any, _) => true,
            (DataType::List(a), DataType::List(b)) => self.can_coerce(a, b),
            (DataType::List(_), _) => false,
            (scalar, DataType::List(b)) => self.can_coerce(scalar, b),
            _ if self.mode == CoercionMode::Strict => false,
            (DataType::Integer, DataType::Number) => true,
            (DataType::Number | DataType::Integer | DataType::Boolean, DataType::String) => true,
            _ => false,
        }
    }

    /// Convert a runtime value to `to`, following the same rules as
    /// [`can_coerce`](Self::can_coerce).
    pub fn coerce(&self, value: Value, to: &DataType) -> Result<Value, CoercionError> {
        if to.matches(&value) {
            return Ok(value);
        }
        let mismatch = |value: &Value| CoercionError {
            expected: to.clone(),
            found: value_kind(value),
        };
        match to {
            DataType::List(element) => match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| self.coerce(item, element))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                Value::Null => Err(mismatch(&Value::Null)),
                scalar => Ok(Value::Array(vec![self.coerce(scalar, element)?])),
            },
            DataType::String if self.mode == CoercionMode::Lenient => match value {
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(mismatch(&other)),
            },
            _ => Err(mismatch(&value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("string".parse::<DataType>().unwrap(), DataType::String);
        assert_eq!("Dynamic".parse::<DataType>().unwrap(), DataType::Any);
        assert_eq!(
            "list<list<integer>>".parse::<DataType>().unwrap(),
            DataType::list(DataType::list(DataType::Integer))
        );
        assert_eq!(DataType::list(DataType::Boolean).to_string(), "list<boolean>");
        assert!("float".parse::<DataType>().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&DataType::list(DataType::String)).unwrap();
        assert_eq!(json, "\"list<string>\"");
        let parsed: DataType = serde_json::from_str("\"number\"").unwrap();
        assert_eq!(parsed, DataType::Number);
    }

    #[test]
    fn test_matches() {
        assert!(DataType::Integer.matches(&json!(3)));
        assert!(!DataType::Integer.matches(&json!(3.5)));
        assert!(DataType::Number.matches(&json!(3)));
        assert!(DataType::list(DataType::String).matches(&json!(["a", "b"])));
        assert!(!DataType::list(DataType::String).matches(&json!(["a", 1])));
        assert!(DataType::Any.matches(&Value::Null));
    }

    #[test]
    fn test_structural_compatibility() {
        let list = DataType::list(DataType::String);
        assert!(!list.structurally_compatible(&DataType::String));
        assert!(list.structurally_compatible(&DataType::Any));
        assert!(DataType::String.structurally_compatible(&list));
    }

    #[test]
    fn test_lenient_table() {
        let table = CoercionTable::lenient();
        assert!(table.can_coerce(&DataType::Integer, &DataType::Number));
        assert!(table.can_coerce(&DataType::Boolean, &DataType::String));
        assert!(table.can_coerce(&DataType::String, &DataType::list(DataType::String)));
        assert!(!table.can_coerce(&DataType::String, &DataType::Number));
        assert!(!table.can_coerce(&DataType::list(DataType::Integer), &DataType::Integer));
    }

    #[test]
    fn test_strict_table() {
        let table = CoercionTable::strict();
        assert!(table.can_coerce(&DataType::Any, &DataType::Number));
        assert!(table.can_coerce(&DataType::Integer, &DataType::list(DataType::Integer)));
        assert!(!table.can_coerce(&DataType::Integer, &DataType::Number));
        assert!(!table.can_coerce(&DataType::Number, &DataType::String));
    }

    #[test]
    fn test_coerce_values() {
        let table = CoercionTable::lenient();
        assert_eq!(table.coerce(json!(42), &DataType::String).unwrap(), json!("42"));
        assert_eq!(
            table.coerce(json!("x"), &DataType::list(DataType::String)).unwrap(),
            json!(["x"])
        );
        assert_eq!(
            table
                .coerce(json!([1, true]), &DataType::list(DataType::String))
                .unwrap(),
            json!(["1", "true"])
        );

        let err = table.coerce(json!("abc"), &DataType::Integer).unwrap_err();
        assert_eq!(err.found, "string");
        assert_eq!(err.expected, DataType::Integer);

        assert!(CoercionTable::strict()
            .coerce(json!(1), &DataType::String)
            .is_err());
    }
}
