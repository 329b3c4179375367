use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput};
use sluice_core::workflow::{ApiCallConfig, NodeConfig, NodeType};

use super::wrong_config;

/// Outbound HTTP call with per-attempt timeout and fixed-delay retries.
pub struct ApiCallExecutor {
    client: reqwest::Client,
}

impl ApiCallExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ApiCallExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(message: impl Into<String>) -> SluiceError {
    SluiceError::executor(NodeType::ApiCall.as_str(), message)
}

/// A request after merging the registered definition with node overrides.
#[derive(Debug, Clone, PartialEq)]
struct RequestPlan {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
}

async fn plan(ctx: &NodeContext, config: &ApiCallConfig) -> Result<RequestPlan> {
    let definition = match &config.api_id {
        Some(id) => Some(ctx.services.registry()?.get_api(id).await?),
        None => None,
    };

    let url = config
        .url
        .clone()
        .or_else(|| definition.as_ref().map(|d| d.url.clone()))
        .ok_or_else(|| fail("no url configured"))?;
    let method = config
        .method
        .clone()
        .or_else(|| definition.as_ref().map(|d| d.method.clone()))
        .unwrap_or_else(|| "GET".to_string());
    let mut headers = definition.as_ref().map(|d| d.headers.clone()).unwrap_or_default();
    headers.extend(config.headers.clone());
    let body = config.body.clone().or_else(|| definition.and_then(|d| d.body));

    let session = &ctx.session_id;
    let mut resolved_headers = BTreeMap::new();
    for (k, v) in headers {
        resolved_headers.insert(k, ctx.resolver.resolve_inline(&v, session).await?);
    }
    let body = match body {
        Some(b) => Some(ctx.resolver.resolve_value(&b, session).await?),
        None => None,
    };

    Ok(RequestPlan {
        url: ctx.resolver.resolve_inline(&url, session).await?,
        method: method.to_uppercase(),
        headers: resolved_headers,
        body,
    })
}

impl ApiCallExecutor {
    async fn attempt(&self, plan: &RequestPlan, timeout: Duration) -> Result<Value> {
        let method = plan
            .method
            .parse::<reqwest::Method>()
            .map_err(|e| fail(format!("invalid method {}: {}", plan.method, e)))?;

        let mut req = self.client.request(method, &plan.url).timeout(timeout);
        for (k, v) in &plan.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &plan.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| fail(format!("request failed: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| fail(format!("reading response failed: {}", e)))?;
        if !status.is_success() {
            let snippet: String = text.chars().take(500).collect();
            return Err(fail(format!("HTTP {}: {}", status.as_u16(), snippet)));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

impl NodeExecutor for ApiCallExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ApiCall
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::ApiCall(config) = config else {
                return Err(wrong_config(NodeType::ApiCall, &config));
            };
            let plan = plan(&ctx, &config).await?;
            let timeout = Duration::from_secs(config.timeout);
            let delay = Duration::from_millis(config.retry_delay);

            let mut attempt = 0;
            loop {
                debug!(node_id = %ctx.node_id, method = %plan.method, url = %plan.url, attempt, "Calling API");
                match self.attempt(&plan, timeout).await {
                    Ok(data) => return Ok(NodeOutput::new(data)),
                    Err(e) if attempt < config.retry_count => {
                        warn!(
                            node_id = %ctx.node_id,
                            attempt = attempt + 1,
                            retry_count = config.retry_count,
                            delay_ms = config.retry_delay,
                            error = %e,
                            "Retrying API call"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::types::ApiDefinition;
    use sluice_test_utils::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned responses on a local port; records each raw request.
    async fn serve(status: u16, body: &'static str) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (h, r) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                h.fetch_add(1, Ordering::SeqCst);
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&raw).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let len = text
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                            .unwrap_or(0);
                        if raw.len() >= end + 4 + len {
                            break;
                        }
                    }
                }
                r.lock().unwrap().push(String::from_utf8_lossy(&raw).to_string());
                let resp = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits, requests)
    }

    fn api_config(url: &str, retry_count: u32) -> ApiCallConfig {
        ApiCallConfig {
            api_id: None,
            url: Some(url.to_string()),
            method: None,
            headers: BTreeMap::new(),
            body: None,
            timeout: 5,
            retry_count,
            retry_delay: 10,
            output_key: "resp".into(),
        }
    }

    #[tokio::test]
    async fn test_successful_call_parses_json() {
        let (base, hits, _) = serve(200, r#"{"ok":true}"#).await;
        let ctx = node_context("s1", "api", Default::default());
        let config = api_config(&format!("{}/status", base), 2);
        let out = ApiCallExecutor::new()
            .execute(ctx, NodeConfig::ApiCall(config))
            .await
            .unwrap();
        assert_eq!(out.data, json!({"ok": true}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exactly_retry_count_times() {
        let (base, hits, _) = serve(500, r#"{"error":"boom"}"#).await;
        let ctx = node_context("s1", "api", Default::default());
        let err = ApiCallExecutor::new()
            .execute(ctx, NodeConfig::ApiCall(api_config(&base, 2)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_registered_api_with_resolved_body() {
        let (base, _, requests) = serve(201, "created").await;
        let mut headers = BTreeMap::new();
        headers.insert("X-Team".to_string(), "{team}".to_string());
        let store = Arc::new(InMemoryStore::new().with_api(ApiDefinition {
            id: "notify".into(),
            name: "Notify".into(),
            url: format!("{}/notify/{{team}}", base),
            method: "POST".into(),
            headers,
            body: Some(json!({"summary": "{summary}", "text": "count={summary.count}"})),
        }));
        let ctx = node_context("s1", "api", services(store, None, None, None));
        ctx.data.put(&ctx.session_id, "team", json!("ops"), "start", None).await.unwrap();
        ctx.data
            .put(&ctx.session_id, "summary", json!({"count": 3}), "agg", None)
            .await
            .unwrap();

        let mut config = api_config("", 0);
        config.url = None;
        config.api_id = Some("notify".into());
        let out = ApiCallExecutor::new()
            .execute(ctx, NodeConfig::ApiCall(config))
            .await
            .unwrap();
        assert_eq!(out.data, json!("created"));

        let raw = requests.lock().unwrap()[0].clone();
        assert!(raw.starts_with("POST /notify/ops "));
        assert!(raw.to_ascii_lowercase().contains("x-team: ops"));
        assert!(raw.contains(r#""summary":{"count":3}"#));
        assert!(raw.contains(r#""text":"count=3""#));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_after_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ctx = node_context("s1", "api", Default::default());
        let err = ApiCallExecutor::new()
            .execute(ctx, NodeConfig::ApiCall(api_config(&format!("http://{}", addr), 1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("request failed"));
    }
}
