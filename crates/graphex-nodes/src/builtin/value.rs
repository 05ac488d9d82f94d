use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use graphex_core::datatype::value_kind;
use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{CoercionTable, DataType, NodeError};

use super::{outputs, parse_config};

// ── ConstantNode ────────────────────────────────────────────────

pub struct ConstantNode;

#[derive(Deserialize)]
struct ConstantConfig {
    #[serde(rename = "type", default = "default_any")]
    data_type: DataType,
    #[serde(default)]
    value: Value,
}

fn default_any() -> DataType {
    DataType::Any
}

impl NodeType for ConstantNode {
    fn type_tag(&self) -> &str {
        "value.constant"
    }

    fn description(&self) -> &str {
        "Emit a fixed value configured on the node."
    }

    fn category(&self) -> &str {
        "Values"
    }

    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        let c: ConstantConfig = parse_config(config)?;
        if !c.data_type.matches(&c.value) {
            return Err(NodeError::InvalidConfig(format!(
                "value is a {}, not a {}",
                value_kind(&c.value),
                c.data_type
            )));
        }
        Ok(PortDeclaration::new().output(OutputPort::new("value", c.data_type)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let c: ConstantConfig = parse_config(&request.config)?;
            Ok(outputs([("value", c.value)]))
        })
    }
}

// ── CastNode ────────────────────────────────────────────────────

pub struct CastNode;

#[derive(Deserialize)]
struct CastConfig {
    #[serde(default = "default_string")]
    to: DataType,
}

fn default_string() -> DataType {
    DataType::String
}

/// Explicit conversion. Goes further than port coercion: strings are parsed.
fn cast(value: Value, to: &DataType) -> Result<Value, NodeError> {
    let fail = |value: &Value| {
        NodeError::execution(format!("cannot cast {} to {}", value_kind(value), to))
    };
    if to.matches(&value) {
        return Ok(value);
    }
    match (to, &value) {
        (DataType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| fail(&value)),
        (DataType::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Value::from(f as i64))
            .ok_or_else(|| fail(&value)),
        (DataType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| fail(&value)),
        (DataType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail(&value)),
        },
        (DataType::String, Value::Object(_) | Value::Array(_)) => Ok(Value::String(value.to_string())),
        (DataType::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => Ok(parsed),
            _ => Err(fail(&value)),
        },
        _ => CoercionTable::lenient()
            .coerce(value.clone(), to)
            .map_err(|_| fail(&value)),
    }
}

impl NodeType for CastNode {
    fn type_tag(&self) -> &str {
        "value.cast"
    }

    fn description(&self) -> &str {
        "Convert a value to another type, parsing strings where needed."
    }

    fn category(&self) -> &str {
        "Values"
    }

    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        let c: CastConfig = parse_config(config)?;
        Ok(PortDeclaration::new()
            .input(InputPort::new("value", DataType::Any))
            .output(OutputPort::new("value", c.to)))
    }

    fn execute(
        &self,
        request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let c: CastConfig = parse_config(&request.config)?;
            let value = request.inputs.get("value").cloned().unwrap_or(Value::Null);
            Ok(outputs([("value", cast(value, &c.to)?)]))
        })
    }
}
