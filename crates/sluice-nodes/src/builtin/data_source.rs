use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use sluice_core::error::Result;
use sluice_core::traits::NodeExecutor;
use sluice_core::types::{NodeContext, NodeOutput, SessionId, ValueKind};
use sluice_core::workflow::{DataSourceKind, NodeConfig, NodeType};
use sluice_core::VariableResolver;

use super::wrong_config;

/// Reads rows from the relational store or the warehouse.
pub struct DataSourceExecutor;

/// Resolve each positional parameter template into a JSON value.
pub(crate) async fn resolve_params(
    resolver: &VariableResolver,
    params: &[String],
    session: &SessionId,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(params.len());
    for p in params {
        let template = Value::String(p.clone());
        out.push(resolver.resolve_value(&template, session).await?);
    }
    Ok(out)
}

impl NodeExecutor for DataSourceExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::DataSource
    }

    fn execute(&self, ctx: NodeContext, config: NodeConfig) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let NodeConfig::DataSource(config) = config else {
                return Err(wrong_config(NodeType::DataSource, &config));
            };

            // Session data reaches the query only as bound parameters.
            let query = config.query.as_str();
            let params = resolve_params(&ctx.resolver, &config.params, &ctx.session_id).await?;
            debug!(node_id = %ctx.node_id, source = ?config.source, query = %query, "Running query");

            let rows = match config.source {
                DataSourceKind::Relational => ctx.services.relational()?.query(query, params).await?,
                DataSourceKind::Warehouse => ctx.services.warehouse()?.query(query, params).await?,
            };

            let rows: Vec<Value> = rows.into_iter().map(Value::Object).collect();
            Ok(NodeOutput::new(Value::Array(rows)).with_kind(ValueKind::Array))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::workflow::DataSourceConfig;
    use sluice_test_utils::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_rows_with_bound_params() {
        let db = Arc::new(MockRelational::with_rows(json!([{"id": 1}, {"id": 2}])));
        let ctx = node_context(
            "s1",
            "fetch",
            services(Arc::new(InMemoryStore::new()), Some(db.clone()), None, None),
        );
        ctx.data
            .put(&ctx.session_id, "filter", json!({"region": "EU", "limit": 5}), "start", None)
            .await
            .unwrap();

        let config = NodeConfig::DataSource(DataSourceConfig {
            source: DataSourceKind::Warehouse,
            query: "SELECT * FROM orders WHERE region = ?1 LIMIT ?2 -- ?3".into(),
            params: vec!["{filter.region}".into(), "{filter.limit}".into(), "plain".into()],
            output_key: "rows".into(),
        });
        let out = DataSourceExecutor.execute(ctx, config).await.unwrap();
        assert_eq!(out.data, json!([{"id": 1}, {"id": 2}]));

        let calls = db.calls();
        assert_eq!(calls[0].0, "SELECT * FROM orders WHERE region = ?1 LIMIT ?2 -- ?3");
        assert_eq!(calls[0].1, vec![json!("EU"), json!(5), json!("plain")]);
    }

    #[tokio::test]
    async fn test_query_text_is_never_substituted() {
        let db = Arc::new(MockRelational::with_rows(json!([])));
        let ctx = node_context(
            "s1",
            "fetch",
            services(Arc::new(InMemoryStore::new()), Some(db.clone()), None, None),
        );
        ctx.data
            .put(&ctx.session_id, "name", json!("x'; DROP TABLE orders; --"), "start", None)
            .await
            .unwrap();

        DataSourceExecutor
            .execute(ctx, data_source_node("SELECT * FROM orders WHERE name = '{name}'", "rows"))
            .await
            .unwrap();
        assert_eq!(db.calls()[0].0, "SELECT * FROM orders WHERE name = '{name}'");
    }

    #[tokio::test]
    async fn test_missing_store_is_config_error() {
        let ctx = node_context("s1", "fetch", Default::default());
        let err = DataSourceExecutor
            .execute(ctx, data_source_node("SELECT 1", "rows"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("relational store"));
    }
}
