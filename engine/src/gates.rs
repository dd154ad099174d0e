use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use coord_core::error::{CoordError, Result};
use coord_core::models::Task;
use serde::{Deserialize, Serialize};

use crate::runner::run_command;

/// Schema of `.claude/quality-gates.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GateFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub default_gates: Vec<String>,
    #[serde(default)]
    pub gates: HashMap<String, GateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    pub command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout: u64,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_gate_timeout_ms() -> u64 {
    60_000
}

/// One gate's execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub all_passed: bool,
    pub total_gates: usize,
    pub passed_gates: usize,
    pub failed_gates: usize,
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn empty() -> Self {
        Self {
            all_passed: true,
            total_gates: 0,
            passed_gates: 0,
            failed_gates: 0,
            results: vec![],
        }
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.gate_name.as_str())
            .collect()
    }
}

/// Quality-gate runner with a process-wide config cache.
///
/// Config is loaded lazily on first need and held until an explicit cache
/// clear, keeping the default test path free of external-file dependencies.
pub struct GateRunner {
    config_path: PathBuf,
    project_root: PathBuf,
    cache: RwLock<Option<Arc<GateFile>>>,
}

impl GateRunner {
    pub fn new(project_root: PathBuf) -> Self {
        let config_path = project_root.join(".claude").join("quality-gates.json");
        Self {
            config_path,
            project_root,
            cache: RwLock::new(None),
        }
    }

    /// Load the gate config, caching it. A missing file yields an empty
    /// config (no gates); a malformed file is a ConfigError.
    pub fn load_config(&self) -> Result<Arc<GateFile>> {
        if let Some(cached) = self.cache.read().expect("gate cache poisoned").as_ref() {
            return Ok(cached.clone());
        }

        let config = if self.config_path.exists() {
            let raw = std::fs::read_to_string(&self.config_path).map_err(|e| {
                CoordError::Config(format!(
                    "Cannot read {}: {e}",
                    self.config_path.display()
                ))
            })?;
            serde_json::from_str::<GateFile>(&raw).map_err(|e| {
                CoordError::Config(format!(
                    "Malformed {}: {e}",
                    self.config_path.display()
                ))
            })?
        } else {
            GateFile::default()
        };

        let config = Arc::new(config);
        *self.cache.write().expect("gate cache poisoned") = Some(config.clone());
        Ok(config)
    }

    /// Invalidate the cached config; the next run reloads from disk.
    pub fn clear_cache(&self) {
        *self.cache.write().expect("gate cache poisoned") = None;
    }

    /// Gates effective for a completing task: its explicit list when present
    /// (an empty list disables gates), otherwise the config defaults.
    pub fn effective_gates(&self, task: &Task) -> Result<Vec<String>> {
        match task.quality_gates() {
            Some(gates) => Ok(gates),
            None => Ok(self.load_config()?.default_gates.clone()),
        }
    }

    /// Run the named gates sequentially in declared order.
    pub async fn run_gates(&self, task: &Task, gate_names: &[String]) -> Result<GateReport> {
        if gate_names.is_empty() {
            return Ok(GateReport::empty());
        }
        let config = self.load_config()?;

        let mut results = Vec::with_capacity(gate_names.len());
        for name in gate_names {
            let spec = config.gates.get(name).ok_or_else(|| {
                CoordError::Config(format!("Quality gate '{name}' is not defined"))
            })?;
            let dir = self.resolve_working_dir(spec, task);
            let env: Vec<(String, String)> = spec
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let outcome = run_command(&spec.command, &dir, spec.timeout, &env).await;
            let passed = outcome.passed(spec.expected_exit_code);
            let message = if passed {
                format!("Gate '{name}' passed")
            } else if outcome.timed_out {
                format!("Gate '{name}' timed out after {}ms", spec.timeout)
            } else {
                format!(
                    "Gate '{name}' failed: exit {:?}, expected {}",
                    outcome.exit_code, spec.expected_exit_code
                )
            };
            results.push(GateResult {
                gate_name: name.clone(),
                passed,
                command: spec.command.clone(),
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: outcome.error,
                message,
            });
        }

        let passed_gates = results.iter().filter(|r| r.passed).count();
        Ok(GateReport {
            all_passed: passed_gates == results.len(),
            total_gates: results.len(),
            passed_gates,
            failed_gates: results.len() - passed_gates,
            results,
        })
    }

    /// Working directory for a gate.
    ///
    /// Explicit config wins. Package-manager commands walk up from the
    /// task's first listed file looking for a package.json, then fall back
    /// to that file's directory and finally the project root.
    fn resolve_working_dir(&self, spec: &GateSpec, task: &Task) -> PathBuf {
        if let Some(ref dir) = spec.working_directory {
            return self.project_root.join(dir);
        }

        let first_file_dir = task.files().first().map(|f| {
            let path = self.project_root.join(f);
            path.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.project_root.clone())
        });

        let is_node_command = ["npm", "yarn", "pnpm"]
            .iter()
            .any(|tool| spec.command.trim_start().starts_with(tool));

        match (is_node_command, first_file_dir) {
            (true, Some(start)) => {
                let mut dir = start.clone();
                loop {
                    if dir.join("package.json").exists() {
                        return dir;
                    }
                    if dir == self.project_root || !dir.pop() {
                        break;
                    }
                }
                if start.exists() {
                    start
                } else {
                    self.project_root.clone()
                }
            }
            (_, Some(dir)) if dir.exists() => dir,
            _ => self.project_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_core::models::{Metadata, TaskStatus};
    use serde_json::json;

    fn make_task(files: &[&str]) -> Task {
        let mut metadata = Metadata::new();
        if !files.is_empty() {
            metadata.insert("files".into(), json!(files));
        }
        Task {
            id: "TASK-1".into(),
            prd_id: None,
            parent_id: None,
            title: "t".into(),
            description: String::new(),
            assigned_agent: None,
            status: TaskStatus::InProgress,
            blocked_reason: None,
            notes: None,
            metadata,
            archived: false,
            archived_at: None,
            archived_by_initiative_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn write_config(root: &Path, body: &str) {
        let dir = root.join(".claude");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("quality-gates.json"), body).unwrap();
    }

    #[tokio::test]
    async fn test_missing_config_means_no_gates() {
        let dir = tempfile::tempdir().unwrap();
        let runner = GateRunner::new(dir.path().to_path_buf());
        let task = make_task(&[]);
        assert!(runner.effective_gates(&task).unwrap().is_empty());
        let report = runner.run_gates(&task, &[]).await.unwrap();
        assert!(report.all_passed);
        assert_eq!(report.total_gates, 0);
    }

    #[tokio::test]
    async fn test_malformed_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "{not json");
        let runner = GateRunner::new(dir.path().to_path_buf());
        let err = runner.load_config().unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[tokio::test]
    async fn test_failing_gate_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"version":"1.0","defaultGates":["tests_pass"],
                "gates":{"tests_pass":{"command":"exit 1"}}}"#,
        );
        let runner = GateRunner::new(dir.path().to_path_buf());
        let task = make_task(&[]);
        let gates = runner.effective_gates(&task).unwrap();
        let report = runner.run_gates(&task, &gates).await.unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.failed_gates, 1);
        assert_eq!(report.failed_names(), vec!["tests_pass"]);
    }

    #[tokio::test]
    async fn test_undefined_gate_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"defaultGates":[],"gates":{}}"#);
        let runner = GateRunner::new(dir.path().to_path_buf());
        let task = make_task(&[]);
        let err = runner
            .run_gates(&task, &["missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[tokio::test]
    async fn test_gate_timeout_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"defaultGates":["slow"],"gates":{"slow":{"command":"sleep 5","timeout":200}}}"#,
        );
        let runner = GateRunner::new(dir.path().to_path_buf());
        let task = make_task(&[]);
        let report = runner.run_gates(&task, &["slow".to_string()]).await.unwrap();
        assert!(!report.all_passed);
        assert!(report.results[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cache_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"defaultGates":["a"],"gates":{}}"#);
        let runner = GateRunner::new(dir.path().to_path_buf());
        assert_eq!(runner.load_config().unwrap().default_gates, vec!["a"]);

        // Rewrite on disk; cached copy still served
        write_config(dir.path(), r#"{"defaultGates":["b"],"gates":{}}"#);
        assert_eq!(runner.load_config().unwrap().default_gates, vec!["a"]);

        runner.clear_cache();
        assert_eq!(runner.load_config().unwrap().default_gates, vec!["b"]);
    }

    #[test]
    fn test_working_dir_walks_up_for_npm() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("web/src/components")).unwrap();
        std::fs::write(root.join("web/package.json"), "{}").unwrap();

        let runner = GateRunner::new(root.to_path_buf());
        let task = make_task(&["web/src/components/button.tsx"]);
        let spec = GateSpec {
            command: "npm test".into(),
            expected_exit_code: 0,
            timeout: 60_000,
            working_directory: None,
            env: HashMap::new(),
        };
        assert_eq!(runner.resolve_working_dir(&spec, &task), root.join("web"));

        // Non-node commands use the file's directory
        let spec = GateSpec {
            command: "cargo test".into(),
            expected_exit_code: 0,
            timeout: 60_000,
            working_directory: None,
            env: HashMap::new(),
        };
        assert_eq!(
            runner.resolve_working_dir(&spec, &task),
            root.join("web/src/components")
        );

        // Explicit directory wins
        let spec = GateSpec {
            command: "npm test".into(),
            expected_exit_code: 0,
            timeout: 60_000,
            working_directory: Some("elsewhere".into()),
            env: HashMap::new(),
        };
        assert_eq!(runner.resolve_working_dir(&spec, &task), root.join("elsewhere"));
    }
}
