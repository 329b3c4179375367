//! Sandboxed script runner.
//!
//! Each run gets a fresh `sluice-script-*` working directory holding
//! `input.json`, the user script and a small wrapper. The wrapper executes the
//! user code with `input_data`, `data`, `session_id` and `node_id` bound, and
//! prints a `{success, data, error}` envelope as its last stdout line. The
//! directory is removed when the run ends, whatever the outcome.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use sluice_core::config::SandboxConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::ScriptRunner;
use sluice_core::types::{ScriptInvocation, ScriptOutcome};

const DIR_PREFIX: &str = "sluice-script-";

const WRAPPER: &str = r#"import json
import sys
import traceback

with open("input.json") as f:
    payload = json.load(f)

scope = {
    "__name__": "__sluice__",
    "input_data": payload,
    "data": payload.get("data") or {},
    "session_id": payload.get("session_id"),
    "node_id": payload.get("node_id"),
    "result": None,
}

try:
    with open("user_script.py") as f:
        code = compile(f.read(), "user_script.py", "exec")
    exec(code, scope)
    envelope = {"success": True, "data": scope.get("result")}
except Exception as exc:
    envelope = {
        "success": False,
        "data": None,
        "error": "".join(traceback.format_exception(type(exc), exc, exc.__traceback__)).strip(),
    }

sys.stdout.write("\n" + json.dumps(envelope, default=str) + "\n")
sys.stdout.flush()
"#;

fn fail(message: impl Into<String>) -> SluiceError {
    SluiceError::executor("python_script", message)
}

/// Runs scripts as interpreter subprocesses.
pub struct SubprocessRunner {
    config: SandboxConfig,
    base_dir: PathBuf,
}

impl SubprocessRunner {
    pub fn new(config: SandboxConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn prepare(&self, invocation: &ScriptInvocation) -> Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir_in(&self.base_dir)?;

        let input = json!({
            "session_id": invocation.session_id.as_str(),
            "node_id": invocation.node_id,
            "data": invocation.input,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        tokio::fs::write(dir.path().join("input.json"), serde_json::to_vec(&input)?).await?;
        tokio::fs::write(dir.path().join("user_script.py"), &invocation.code).await?;
        tokio::fs::write(dir.path().join("wrapper.py"), WRAPPER).await?;
        Ok(dir)
    }

    async fn run_in(&self, dir: &Path, invocation: &ScriptInvocation) -> Result<ScriptOutcome> {
        let mut child = tokio::process::Command::new(&self.config.interpreter)
            .arg("wrapper.py")
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("failed to start {}: {}", self.config.interpreter, e)))?;

        let stdout = child.stdout.take().ok_or_else(|| fail("script stdout not captured"))?;
        let stderr = child.stderr.take().ok_or_else(|| fail("script stderr not captured"))?;
        let limit = self.config.max_output_bytes;
        let collect = async {
            tokio::try_join!(child.wait(), read_tail(stdout, limit), read_tail(stderr, limit))
        };

        let timeout = Duration::from_secs(invocation.timeout_secs);
        let (status, stdout, stderr) = match tokio::time::timeout(timeout, collect).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(fail(format!("waiting for script failed: {}", e))),
            // The child is killed when it is dropped.
            Err(_) => {
                return Err(SluiceError::Timeout {
                    node: invocation.node_id.clone(),
                    timeout_secs: invocation.timeout_secs,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            return Ok(ScriptOutcome {
                success: false,
                data: Value::Null,
                error: Some(format!("exit code {}: {}", code, detail)),
            });
        }

        Ok(parse_envelope(&stdout).unwrap_or_else(|| ScriptOutcome {
            success: false,
            data: Value::Null,
            error: Some(format!("script produced no result envelope; stderr: {}", stderr.trim())),
        }))
    }

    /// Remove `sluice-script-*` directories older than `min_age` under `dir`,
    /// left behind by a process that died mid-run. Returns how many were removed.
    pub fn sweep_stale(dir: &Path, min_age: Duration) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(DIR_PREFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            let age = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale script dir"),
            }
        }
        if removed > 0 {
            info!(dir = %dir.display(), removed, "Swept stale script directories");
        }
        Ok(removed)
    }
}

/// Drain `reader` keeping only the last `limit` bytes, where the envelope lives.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut tail = VecDeque::with_capacity(limit.min(64 * 1024));
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tail.extend(&buf[..n]);
        let excess = tail.len().saturating_sub(limit);
        tail.drain(..excess);
    }
    Ok(tail.into())
}

/// The last non-empty stdout line, parsed as the result envelope.
fn parse_envelope(stdout: &str) -> Option<ScriptOutcome> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let success = value.get("success")?.as_bool()?;
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .map(String::from)
        .filter(|e| !e.is_empty());
    Some(ScriptOutcome {
        success,
        data: value.get("data").cloned().unwrap_or(Value::Null),
        error: if success { None } else { error.or_else(|| Some("script reported failure".into())) },
    })
}

impl ScriptRunner for SubprocessRunner {
    fn run(&self, invocation: ScriptInvocation) -> BoxFuture<'_, Result<ScriptOutcome>> {
        Box::pin(async move {
            let dir = self.prepare(&invocation).await?;
            debug!(
                session_id = %invocation.session_id,
                node_id = %invocation.node_id,
                dir = %dir.path().display(),
                "Running script"
            );
            let result = self.run_in(dir.path(), &invocation).await;
            if let Err(e) = dir.close() {
                warn!(node_id = %invocation.node_id, error = %e, "Failed to remove script dir");
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::SessionId;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn invocation(code: &str, input: Value, timeout_secs: u64) -> ScriptInvocation {
        ScriptInvocation {
            session_id: SessionId::from_str("s1"),
            node_id: "py".into(),
            code: code.into(),
            input,
            timeout_secs,
        }
    }

    fn leftovers(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().starts_with(DIR_PREFIX))
                    .unwrap_or(false)
            })
            .count()
    }

    #[tokio::test]
    async fn test_sum_script() {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::new(SandboxConfig::default(), base.path());
        let code = "print('working on', node_id)\nresult = {'sum': sum(data['numbers'])}";
        let out = runner
            .run(invocation(code, json!({"numbers": [1, 2, 3, 4, 5]}), 30))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.data, json!({"sum": 15}));
        assert_eq!(leftovers(base.path()), 0);
    }

    #[tokio::test]
    async fn test_exception_reported() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::new(SandboxConfig::default(), base.path());
        let out = runner
            .run(invocation("raise ValueError('bad input')", json!({}), 30))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("ValueError: bad input"));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::new(SandboxConfig::default(), base.path());
        let out = runner
            .run(invocation("import sys\nsys.stderr.write('fatal')\nsys.exit(3)", json!({}), 30))
            .await
            .unwrap();
        assert!(!out.success);
        let error = out.error.unwrap();
        assert!(error.contains("exit code 3"));
        assert!(error.contains("fatal"));
    }

    #[tokio::test]
    async fn test_timeout_kills_script() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let runner = SubprocessRunner::new(SandboxConfig::default(), base.path());
        let started = std::time::Instant::now();
        let err = runner
            .run(invocation("import time\ntime.sleep(30)", json!({}), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Timeout { timeout_secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(leftovers(base.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let base = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            interpreter: "sluice-no-such-interpreter".into(),
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, base.path());
        let err = runner.run(invocation("result = 1", json!({}), 5)).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert_eq!(leftovers(base.path()), 0);
    }

    #[test]
    fn test_sweep_stale() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("sluice-script-abc")).unwrap();
        std::fs::create_dir(base.path().join("keep-me")).unwrap();
        std::fs::write(base.path().join("sluice-script-file"), "x").unwrap();

        assert_eq!(SubprocessRunner::sweep_stale(base.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(SubprocessRunner::sweep_stale(base.path(), Duration::ZERO).unwrap(), 1);
        assert!(base.path().join("keep-me").exists());
        assert!(base.path().join("sluice-script-file").exists());
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let data = vec![b'x'; 20_000].into_iter().chain(*b"END").collect::<Vec<u8>>();
        let tail = read_tail(data.as_slice(), 10).await.unwrap();
        assert_eq!(tail, b"xxxxxxxEND");
        assert_eq!(read_tail(&b"short"[..], 10).await.unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_noisy_script_output_is_capped() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            max_output_bytes: 512,
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, base.path());
        let code = "import sys\nfor _ in range(2000):\n    print('x' * 1000)\n    sys.stderr.write('e' * 1000)\nresult = 42";
        let out = runner.run(invocation(code, json!({}), 30)).await.unwrap();
        assert!(out.success);
        assert_eq!(out.data, json!(42));

        let failing = "import sys\nsys.stderr.write('e' * 100000)\nsys.exit(2)";
        let out = runner.run(invocation(failing, json!({}), 30)).await.unwrap();
        let error = out.error.unwrap();
        assert!(error.starts_with("exit code 2"));
        assert!(error.len() < 600);
    }

    #[test]
    fn test_parse_envelope_uses_last_line() {
        let out = parse_envelope("noise\n{\"success\": true, \"data\": [1]}\n\n").unwrap();
        assert!(out.success);
        assert_eq!(out.data, json!([1]));
        assert!(parse_envelope("just text").is_none());
    }
}
