pub mod anchor;
pub mod api_call;
pub mod data_source;
pub mod prompt;
pub mod python_script;
pub mod reshape;
pub mod sql;
pub mod transform;

use std::cmp::Ordering;

use serde_json::Value;

use sluice_core::error::SluiceError;
use sluice_core::workflow::{AggregateFunction, NodeConfig, NodeType};

/// Error for an executor handed a config of another node type.
pub(crate) fn wrong_config(expected: NodeType, got: &NodeConfig) -> SluiceError {
    SluiceError::executor(
        expected.as_str(),
        format!("expected {} config, got {}", expected, got.node_type()),
    )
}

/// Strip markdown code fences from model or script output.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Parse a JSON string, tolerating code fences. Non-strings pass through.
pub(crate) fn parse_json_value(node: &str, value: Value) -> Result<Value, SluiceError> {
    match value {
        Value::String(s) => serde_json::from_str(&strip_code_fences(&s))
            .map_err(|e| SluiceError::executor(node, format!("invalid JSON: {}", e))),
        other => Ok(other),
    }
}

/// Total order over JSON values: null < bool < number < string < other.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Reduce values to one number. Non-numeric values are ignored except by
/// `count`; over no numbers, `sum` is 0 and the rest are null.
pub(crate) fn aggregate(values: &[Value], function: AggregateFunction) -> Value {
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    let result = match function {
        AggregateFunction::Count => return Value::from(values.len() as u64),
        AggregateFunction::Sum => Some(numbers.iter().sum()),
        AggregateFunction::Avg if numbers.is_empty() => None,
        AggregateFunction::Avg => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
        AggregateFunction::Min => numbers.iter().copied().reduce(f64::min),
        AggregateFunction::Max => numbers.iter().copied().reduce(f64::max),
    };
    result.map(number).unwrap_or(Value::Null)
}

/// Integral results are emitted as integers.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_aggregate() {
        let values = vec![json!(1), json!(2.5), json!("x"), json!(4)];
        assert_eq!(aggregate(&values, AggregateFunction::Count), json!(4));
        assert_eq!(aggregate(&values, AggregateFunction::Sum), json!(7.5));
        assert_eq!(aggregate(&values, AggregateFunction::Min), json!(1));
        assert_eq!(aggregate(&values, AggregateFunction::Max), json!(4));
        assert_eq!(aggregate(&[json!(2), json!(4)], AggregateFunction::Avg), json!(3));
    }

    #[test]
    fn test_aggregate_empty() {
        assert_eq!(aggregate(&[], AggregateFunction::Sum), json!(0));
        assert_eq!(aggregate(&[], AggregateFunction::Avg), Value::Null);
        assert_eq!(aggregate(&[], AggregateFunction::Max), Value::Null);
    }

    #[test]
    fn test_compare_values_nulls_first() {
        let mut v = vec![json!(3), Value::Null, json!(1)];
        v.sort_by(compare_values);
        assert_eq!(v, vec![Value::Null, json!(1), json!(3)]);
    }
}
