use futures::future::BoxFuture;
use serde_json::{Map, Value};

use sluice_core::error::{Result, SluiceError};
use sluice_core::resolver::select_path;
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{NodeConfig, NodeType, ReshapeStep};

use super::{aggregate, parse_json_value, wrong_config};

/// Structural reshaping for `json_processing` and `data_transformation` nodes.
///
/// Both types share the step language; they differ only in their tag.
pub struct ReshapeExecutor {
    node_type: NodeType,
}

impl ReshapeExecutor {
    pub fn json_processing() -> Self {
        Self {
            node_type: NodeType::JsonProcessing,
        }
    }

    pub fn data_transformation() -> Self {
        Self {
            node_type: NodeType::DataTransformation,
        }
    }
}

/// Apply `f` to an object, or to every object of an array.
fn each_object(value: Value, node: &str, step: &str, f: &dyn Fn(&mut Map<String, Value>)) -> Result<Value> {
    match value {
        Value::Object(mut map) => {
            f(&mut map);
            Ok(Value::Object(map))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| each_object(item, node, step, f))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        _ => Err(SluiceError::executor(node, format!("{} expects an object or array of objects", step))),
    }
}

/// Values addressed by `from`: the array at that path, or the last segment
/// taken as a field of every element of the array at the parent path.
fn derive_source(current: &Value, from: &str) -> Option<Vec<Value>> {
    if let Some(Value::Array(items)) = select_path(current, from) {
        return Some(items.clone());
    }
    let (parent, field) = from.rsplit_once('.')?;
    let items = select_path(current, parent)?.as_array()?;
    Some(
        items
            .iter()
            .map(|item| item.get(field).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Run reshape steps in order.
pub fn apply_steps(input: Value, steps: &[ReshapeStep], node: &str) -> Result<Value> {
    let mut current = input;
    for step in steps {
        current = match step {
            ReshapeStep::Extract { path } => select_path(&current, path)
                .cloned()
                .ok_or_else(|| SluiceError::executor(node, format!("path not found: {}", path)))?,
            ReshapeStep::ParseJson => parse_json_value(node, current)?,
            ReshapeStep::Select { fields } => each_object(current, node, "select", &|map| {
                map.retain(|k, _| fields.contains(k));
            })?,
            ReshapeStep::Rename { from, to } => each_object(current, node, "rename", &|map| {
                if let Some(v) = map.remove(from) {
                    map.insert(to.clone(), v);
                }
            })?,
            ReshapeStep::Derive { field, from, function } => {
                let values = derive_source(&current, from)
                    .ok_or_else(|| SluiceError::executor(node, format!("derive source is not an array: {}", from)))?;
                let derived = aggregate(&values, *function);
                each_object(current, node, "derive", &|map| {
                    map.insert(field.clone(), derived.clone());
                })?
            }
            ReshapeStep::Set { field, value } => each_object(current, node, "set", &|map| {
                map.insert(field.clone(), value.clone());
            })?,
        };
    }
    Ok(current)
}

impl NodeExecutor for ReshapeExecutor {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let config = match config {
                NodeConfig::JsonProcessing(c) | NodeConfig::DataTransformation(c) => c,
                other => return Err(wrong_config(self.node_type, &other)),
            };
            let input = ctx.data.require(&ctx.session_id, &config.input_key).await?;
            let output = apply_steps(input, &config.steps, self.node_type.as_str())?;
            Ok(NodeOutput::new(output))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::workflow::{AggregateFunction, ReshapeConfig};
    use sluice_test_utils::node_context;

    fn completion() -> Value {
        json!({
            "choices": [
                {"message": {"content": "```json\n{\"items\": [{\"sku\": \"a\", \"qty\": 2, \"note\": \"x\"}, {\"sku\": \"b\", \"qty\": 3, \"note\": \"y\"}]}\n```"}}
            ]
        })
    }

    #[test]
    fn test_extract_parse_and_derive() {
        let steps = vec![
            ReshapeStep::Extract {
                path: "choices[0].message.content".into(),
            },
            ReshapeStep::ParseJson,
            ReshapeStep::Derive {
                field: "total_qty".into(),
                from: "items.qty".into(),
                function: AggregateFunction::Sum,
            },
            ReshapeStep::Set {
                field: "source".into(),
                value: json!("llm"),
            },
        ];
        let out = apply_steps(completion(), &steps, "json_processing").unwrap();
        assert_eq!(out["total_qty"], 5);
        assert_eq!(out["source"], "llm");
        assert_eq!(out["items"][1]["sku"], "b");
    }

    #[test]
    fn test_select_and_rename_over_array() {
        let steps = vec![
            ReshapeStep::Select {
                fields: vec!["sku".into(), "qty".into()],
            },
            ReshapeStep::Rename {
                from: "qty".into(),
                to: "quantity".into(),
            },
        ];
        let input = json!([{"sku": "a", "qty": 2, "note": "x"}]);
        let out = apply_steps(input, &steps, "data_transformation").unwrap();
        assert_eq!(out, json!([{"sku": "a", "quantity": 2}]));
    }

    #[test]
    fn test_missing_path_fails() {
        let steps = vec![ReshapeStep::Extract { path: "nope.deeper".into() }];
        let err = apply_steps(json!({"a": 1}), &steps, "json_processing").unwrap_err();
        assert!(err.to_string().contains("path not found"));
    }

    #[tokio::test]
    async fn test_executor_reads_input_key() {
        let ctx = node_context("s1", "shape", Default::default());
        ctx.data
            .put(&ctx.session_id, "raw", json!({"a": {"b": [1, 2, 3]}}), "fetch", None)
            .await
            .unwrap();
        let config = NodeConfig::DataTransformation(ReshapeConfig {
            input_key: "raw".into(),
            output_key: "shaped".into(),
            steps: vec![
                ReshapeStep::Extract { path: "a".into() },
                ReshapeStep::Derive {
                    field: "max".into(),
                    from: "b".into(),
                    function: AggregateFunction::Max,
                },
            ],
        });
        let out = ReshapeExecutor::data_transformation().execute(ctx, config).await.unwrap();
        assert_eq!(out.data, json!({"b": [1, 2, 3], "max": 3}));
    }
}
