use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use sluice_core::config::WarehouseConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{Row, WarehouseConnector};

/// Read-only warehouse reached over HTTP.
///
/// Sends `POST {base_url}/query` with `{"sql", "params"}` and expects
/// `{"rows": [{...}, ...]}` back.
pub struct HttpWarehouse {
    client: reqwest::Client,
    config: WarehouseConfig,
}

impl HttpWarehouse {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SluiceError::Config(format!("warehouse client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/query", self.config.base_url.trim_end_matches('/'))
    }
}

fn warehouse_err(msg: impl Into<String>) -> SluiceError {
    SluiceError::executor("warehouse", msg)
}

/// Pull the row objects out of a warehouse response body.
fn parse_rows(body: Value) -> Result<Vec<Row>> {
    let rows = match body {
        Value::Object(mut obj) => obj
            .remove("rows")
            .ok_or_else(|| warehouse_err("response has no `rows` field"))?,
        Value::Array(items) => Value::Array(items),
        other => return Err(warehouse_err(format!("unexpected response: {}", other))),
    };
    let Value::Array(items) = rows else {
        return Err(warehouse_err("`rows` is not an array"));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(warehouse_err(format!("row is not an object: {}", other))),
        })
        .collect()
}

impl WarehouseConnector for HttpWarehouse {
    fn query(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<Vec<Row>>> {
        let payload = json!({ "sql": sql, "params": params });
        Box::pin(async move {
            let mut req = self.client.post(self.endpoint()).json(&payload);
            if let Some(token) = &self.config.token {
                req = req.bearer_auth(token);
            }

            let resp = req.send().await.map_err(|e| warehouse_err(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(warehouse_err(format!("HTTP {}: {}", status.as_u16(), text)));
            }
            let body: Value = resp.json().await.map_err(|e| warehouse_err(e.to_string()))?;
            let rows = parse_rows(body)?;
            debug!(rows = rows.len(), "Warehouse query finished");
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows_envelope() {
        let rows = parse_rows(json!({"rows": [{"a": 1}, {"a": 2}]})).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], json!(2));
    }

    #[test]
    fn test_parse_bare_array() {
        let rows = parse_rows(json!([{"a": 1}])).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(parse_rows(json!({"data": []})).is_err());
        assert!(parse_rows(json!({"rows": [1, 2]})).is_err());
        assert!(parse_rows(json!("nope")).is_err());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let w = HttpWarehouse::new(WarehouseConfig {
            base_url: "https://wh.example/api/".into(),
            token: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(w.endpoint(), "https://wh.example/api/query");
    }
}
