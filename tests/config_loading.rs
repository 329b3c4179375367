use std::io::Write;

use sluice_core::config::{AppConfig, ExecutionMode, ResolverMode};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
workspace = "/tmp/sluice-test"

[engine]
resolver = "strict"
execution = "parallel"
max_parallel = 8

[store]
path = "/tmp/sluice-test/state.db"

[warehouse]
base_url = "https://warehouse.internal"
token = "wh-token"

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 2048

[model.retry]
max_retries = 5

[sandbox]
interpreter = "/usr/bin/python3"
timeout_secs = 30

[log]
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.resolver, ResolverMode::Strict);
    assert_eq!(config.engine.execution, ExecutionMode::Parallel);
    assert_eq!(config.engine.max_parallel, 8);
    assert_eq!(config.store_path().to_str(), Some("/tmp/sluice-test/state.db"));
    assert_eq!(config.relational_path().to_str(), Some("/tmp/sluice-test/analytics.db"));
    assert_eq!(config.log_dir().to_str(), Some("/tmp/sluice-test/logs"));

    let wh = config.warehouse.expect("warehouse section");
    assert_eq!(wh.timeout_secs, 60);

    let model = config.model.expect("model section");
    assert_eq!(model.provider, "anthropic");
    assert_eq!(model.max_tokens, 2048);
    let retry = model.retry.expect("retry section");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 1000);

    assert_eq!(config.sandbox.timeout_secs, 30);
    assert_eq!(config.sandbox.max_output_bytes, 10 * 1024 * 1024);

    let log = config.log.expect("log section");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = AppConfig::parse("").expect("parse empty");
    assert_eq!(config.engine.resolver, ResolverMode::Permissive);
    assert_eq!(config.engine.execution, ExecutionMode::Sequential);
    assert_eq!(config.engine.max_parallel, 4);
    assert!(config.model.is_none());
    assert!(config.warehouse.is_none());
    assert!(config.log.is_none());
    assert_eq!(config.sandbox.interpreter, "python3");
    assert_eq!(config.sandbox_dir(), std::env::temp_dir());
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("SLUICE_TEST_MODEL_KEY", "sk-from-env");
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(
        br#"
[model]
model_id = "gpt-4o"
api_key = "${SLUICE_TEST_MODEL_KEY}"
"#,
    )
    .unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    let model = config.model.unwrap();
    assert_eq!(model.provider, "openai");
    assert_eq!(model.api_key.as_deref(), Some("sk-from-env"));
}

#[test]
fn test_zero_parallelism_rejected() {
    let err = AppConfig::parse("[engine]\nmax_parallel = 0\n").unwrap_err();
    assert!(err.to_string().contains("max_parallel"));
}

#[test]
fn test_unknown_resolver_mode_rejected() {
    assert!(AppConfig::parse("[engine]\nresolver = \"lenient\"\n").is_err());
}

#[test]
fn test_missing_file_reports_path() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/sluice.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/sluice.toml"));
}
