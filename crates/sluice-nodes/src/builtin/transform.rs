use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType, TransformOperation};

use super::{aggregate, compare_values, parse_json_value, wrong_config};

/// Applies one named operation to the value under `inputKey`.
pub struct TransformExecutor;

fn fail(message: impl Into<String>) -> SluiceError {
    SluiceError::executor(NodeType::Transform.as_str(), message)
}

fn expect_array(value: Value, op: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(fail(format!("{} expects an array, got {}", op, kind_name(&other)))),
    }
}

fn kind_name(v: &Value) -> &'static str {
    sluice_core::types::ValueKind::of(v).as_str()
}

fn field_of<'a>(item: &'a Value, field: &str) -> &'a Value {
    item.get(field).unwrap_or(&Value::Null)
}

/// Group keys are strings; non-string field values use their JSON text.
fn group_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply a transform operation to a value.
pub fn apply_operation(input: Value, operation: &TransformOperation) -> Result<Value> {
    match operation {
        TransformOperation::ToJson => Ok(Value::String(serde_json::to_string(&input)?)),
        TransformOperation::JsonParse => parse_json_value(NodeType::Transform.as_str(), input),
        TransformOperation::ExtractField { field } => match input {
            Value::Object(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
            Value::Array(items) => Ok(Value::Array(
                items.iter().map(|item| field_of(item, field).clone()).collect(),
            )),
            other => Err(fail(format!("extract_field expects an object or array, got {}", kind_name(&other)))),
        },
        TransformOperation::GroupBy { field } => {
            let items = expect_array(input, "group_by")?;
            let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for item in items {
                let key = group_key(field_of(&item, field));
                groups.entry(key).or_default().push(item);
            }
            Ok(Value::Object(
                groups.into_iter().map(|(k, v)| (k, Value::Array(v))).collect(),
            ))
        }
        TransformOperation::MergeObjects => {
            let items = expect_array(input, "merge_objects")?;
            let mut merged = Map::new();
            for item in items {
                match item {
                    Value::Object(map) => merged.extend(map),
                    other => return Err(fail(format!("merge_objects expects objects, got {}", kind_name(&other)))),
                }
            }
            Ok(Value::Object(merged))
        }
        TransformOperation::Aggregate { field, function } => {
            let items = expect_array(input, "aggregate")?;
            let values: Vec<Value> = match field {
                Some(f) => items.iter().map(|item| field_of(item, f).clone()).collect(),
                None => items,
            };
            Ok(aggregate(&values, *function))
        }
        TransformOperation::Flatten => {
            let items = expect_array(input, "flatten")?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Ok(Value::Array(out))
        }
        TransformOperation::SortBy { field, descending } => {
            let mut items = expect_array(input, "sort_by")?;
            items.sort_by(|a, b| {
                let ord = compare_values(field_of(a, field), field_of(b, field));
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            Ok(Value::Array(items))
        }
        TransformOperation::Limit { count } => {
            let mut items = expect_array(input, "limit")?;
            items.truncate(*count);
            Ok(Value::Array(items))
        }
    }
}

impl NodeExecutor for TransformExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Transform
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::Transform(config) = config else {
                return Err(wrong_config(NodeType::Transform, &config));
            };
            let input = ctx.data.require(&ctx.session_id, &config.input_key).await?;
            let output = apply_operation(input, &config.operation)?;
            Ok(NodeOutput::new(output))
        })
    }
}
