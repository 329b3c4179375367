//! Definition bundles: workflows plus the prompts, APIs and scripts they use.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use sluice_core::types::{ApiDefinition, PromptTemplate, ScriptDefinition};
use sluice_core::validation::validate;
use sluice_core::workflow::Workflow;
use sluice_engine::Orchestrator;
use sluice_store::SqliteStore;

/// A JSON or TOML file holding any mix of definitions.
#[derive(Debug, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub prompts: Vec<PromptTemplate>,
    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
}

impl Bundle {
    /// Parse by extension: `.toml` as TOML, anything else as JSON.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let is_toml = path.extension().map(|e| e == "toml").unwrap_or(false);
        let bundle = if is_toml {
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        };
        Ok(bundle)
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.prompts.is_empty() && self.apis.is_empty() && self.scripts.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub workflows: usize,
    pub prompts: usize,
    pub apis: usize,
    pub scripts: usize,
    /// `(workflow id, errors)` for workflows that failed validation.
    pub rejected: Vec<(String, String)>,
}

/// Store every definition in the bundle.
///
/// Registry entries go in first so workflows that reference them are usable
/// as soon as they land. Invalid workflows are skipped and reported.
pub async fn import(bundle: Bundle, store: &SqliteStore, engine: &Orchestrator) -> anyhow::Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for prompt in &bundle.prompts {
        store.put_prompt(prompt)?;
        summary.prompts += 1;
    }
    for api in &bundle.apis {
        store.put_api(api)?;
        summary.apis += 1;
    }
    for script in &bundle.scripts {
        store.put_script(script)?;
        summary.scripts += 1;
    }
    for workflow in &bundle.workflows {
        match engine.register_workflow(workflow).await {
            Ok(report) => {
                for warning in report.warnings {
                    warn!(workflow_id = %workflow.id, warning = %warning, "Imported with warning");
                }
                summary.workflows += 1;
            }
            Err(sluice_core::SluiceError::Validation(report)) => {
                summary.rejected.push((workflow.id.clone(), report.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        workflows = summary.workflows,
        prompts = summary.prompts,
        apis = summary.apis,
        scripts = summary.scripts,
        rejected = summary.rejected.len(),
        "Bundle imported"
    );
    Ok(summary)
}

/// Validate every workflow in the bundle without storing anything.
///
/// Returns `(workflow id, report)` pairs in bundle order.
pub fn check(bundle: &Bundle) -> Vec<(String, sluice_core::ValidationReport)> {
    bundle.workflows.iter().map(|wf| (wf.id.clone(), validate(wf))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BUNDLE: &str = r#"{
        "prompts": [{"id": "p1", "name": "Summary", "template": "Summarize {rows}"}],
        "workflows": [{
            "id": "wf",
            "name": "Daily",
            "nodes": [
                {"id": "s", "name": "Start", "type": "start"},
                {"id": "q", "name": "Fetch", "order": 1, "type": "dataSource",
                 "config": {"query": "SELECT 1", "outputKey": "rows"}},
                {"id": "e", "name": "End", "order": 2, "type": "end"}
            ],
            "edges": [{"source": "s", "target": "q"}, {"source": "q", "target": "e"}]
        }]
    }"#;

    #[test]
    fn test_load_json_bundle() {
        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(BUNDLE.as_bytes()).unwrap();
        let bundle = Bundle::load(tmp.path()).unwrap();
        assert_eq!(bundle.workflows.len(), 1);
        assert_eq!(bundle.prompts[0].id, "p1");
        assert!(bundle.apis.is_empty());

        let reports = check(&bundle);
        assert_eq!(reports[0].0, "wf");
        assert!(reports[0].1.is_valid());
    }

    #[test]
    fn test_load_toml_bundle() {
        let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        tmp.write_all(
            br#"
[[scripts]]
id = "double"
name = "Double"
code = "result = data * 2"
"#,
        )
        .unwrap();
        let bundle = Bundle::load(tmp.path()).unwrap();
        assert_eq!(bundle.scripts.len(), 1);
        assert!(!bundle.is_empty());
    }

    #[tokio::test]
    async fn test_import_skips_invalid_workflow() {
        let mut bundle: Bundle = serde_json::from_str(BUNDLE).unwrap();
        bundle.workflows.push(Workflow::new("empty", "No anchors"));

        let store = std::sync::Arc::new(SqliteStore::in_memory().unwrap());
        let engine = Orchestrator::builder().store(store.clone()).build().unwrap();
        let summary = import(bundle, &store, &engine).await.unwrap();

        assert_eq!(summary.workflows, 1);
        assert_eq!(summary.prompts, 1);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].0, "empty");
    }
}
