use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use coord_core::error::Result;

use crate::runner::run_command;
use crate::Coordinator;

/// The test probe never runs longer than this.
pub const TEST_PROBE_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightParams {
    /// Probe a local dev server on this port
    pub dev_server_port: Option<u16>,
    /// Run this test command (capped at 30 s) and parse its summary
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightChecks {
    pub progress: CheckResult,
    pub git: CheckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_server: Option<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<CheckResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResponse {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub checks: PreflightChecks,
    pub recommendations: Vec<String>,
}

impl Coordinator {
    /// Environment health probe: store/progress state, VCS status, and
    /// optional dev-server and test-baseline checks.
    pub async fn preflight_check(&self, params: PreflightParams) -> Result<PreflightResponse> {
        let mut recommendations = Vec::new();

        let progress = self.check_progress(&mut recommendations).await;
        let git = self.check_git(&mut recommendations).await;

        let dev_server = match params.dev_server_port {
            Some(port) => Some(check_dev_server(port, &mut recommendations).await),
            None => None,
        };
        let tests = match params.test_command {
            Some(ref command) => Some(self.check_tests(command, &mut recommendations).await),
            None => None,
        };

        let checks = PreflightChecks {
            progress,
            git,
            dev_server,
            tests,
        };
        let healthy = [Some(&checks.progress), Some(&checks.git), checks.dev_server.as_ref(), checks.tests.as_ref()]
            .into_iter()
            .flatten()
            .all(|check| check.status != CheckStatus::Fail);

        Ok(PreflightResponse {
            healthy,
            timestamp: Utc::now(),
            checks,
            recommendations,
        })
    }

    async fn check_progress(&self, recommendations: &mut Vec<String>) -> CheckResult {
        if let Err(e) = self.store.health_check().await {
            return CheckResult {
                status: CheckStatus::Fail,
                details: format!("Store unreachable: {e}"),
            };
        }
        match self.progress_summary(None).await {
            Ok(summary) => match summary.initiative {
                Some(initiative) => CheckResult {
                    status: CheckStatus::Pass,
                    details: format!(
                        "Initiative {}: {}/{} tasks completed across {} PRDs",
                        initiative.id,
                        summary.completed_tasks,
                        summary.total_tasks,
                        summary.prd_count
                    ),
                },
                None => {
                    recommendations
                        .push("Link an initiative before starting work (initiative_link)".into());
                    CheckResult {
                        status: CheckStatus::Warn,
                        details: "No current initiative linked".into(),
                    }
                }
            },
            Err(e) => CheckResult {
                status: CheckStatus::Fail,
                details: format!("Progress summary failed: {e}"),
            },
        }
    }

    async fn check_git(&self, recommendations: &mut Vec<String>) -> CheckResult {
        let root = &self.options.project_root;
        let branch = run_command("git rev-parse --abbrev-ref HEAD", root, 10_000, &[]).await;

        if let Some(error) = &branch.error {
            if !branch.timed_out {
                return CheckResult {
                    status: CheckStatus::Warn,
                    details: format!("git unavailable: {error}"),
                };
            }
        }
        if branch.exit_code != Some(0) {
            return CheckResult {
                status: CheckStatus::Warn,
                details: "Not a git repository".into(),
            };
        }
        let branch_name = branch.stdout.trim().to_string();

        let status = run_command("git status --porcelain", root, 10_000, &[]).await;
        let dirty_files = status
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
        if dirty_files > 0 {
            recommendations.push(format!(
                "Working tree has {dirty_files} uncommitted changes; commit or stash before long-running work"
            ));
            CheckResult {
                status: CheckStatus::Warn,
                details: format!("On branch {branch_name}, {dirty_files} dirty files"),
            }
        } else {
            CheckResult {
                status: CheckStatus::Pass,
                details: format!("On branch {branch_name}, working tree clean"),
            }
        }
    }

    async fn check_tests(&self, command: &str, recommendations: &mut Vec<String>) -> CheckResult {
        let outcome = run_command(
            command,
            &self.options.project_root,
            TEST_PROBE_CAP_MS,
            &[],
        )
        .await;

        if outcome.timed_out {
            return CheckResult {
                status: CheckStatus::Fail,
                details: format!("Test command exceeded the {TEST_PROBE_CAP_MS}ms cap"),
            };
        }

        let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
        let (passed, failed) = parse_test_summary(&combined);

        if outcome.exit_code == Some(0) && failed == 0 {
            CheckResult {
                status: CheckStatus::Pass,
                details: format!("Test baseline green ({passed} passed)"),
            }
        } else {
            recommendations.push("Fix the failing test baseline before assigning new work".into());
            CheckResult {
                status: CheckStatus::Fail,
                details: format!(
                    "Test baseline red: {passed} passed, {failed} failed (exit {:?})",
                    outcome.exit_code
                ),
            }
        }
    }
}

async fn check_dev_server(port: u16, recommendations: &mut Vec<String>) -> CheckResult {
    let addr = format!("127.0.0.1:{port}");
    let probe = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        tokio::net::TcpStream::connect(&addr),
    )
    .await;
    match probe {
        Ok(Ok(_)) => CheckResult {
            status: CheckStatus::Pass,
            details: format!("Dev server listening on {addr}"),
        },
        _ => {
            recommendations.push(format!("Start the dev server on port {port}"));
            CheckResult {
                status: CheckStatus::Fail,
                details: format!("Nothing listening on {addr}"),
            }
        }
    }
}

/// Heuristic parse of "N passed / M failed" test summaries.
fn parse_test_summary(output: &str) -> (u64, u64) {
    let passed_re = Regex::new(r"(\d+)\s+pass(?:ed|ing)?").expect("static pattern");
    let failed_re = Regex::new(r"(\d+)\s+fail(?:ed|ing)?").expect("static pattern");
    let last_capture = |re: &Regex| {
        re.captures_iter(output)
            .last()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    (last_capture(&passed_re), last_capture(&failed_re))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_summary_formats() {
        assert_eq!(parse_test_summary("test result: ok. 42 passed; 0 failed"), (42, 0));
        assert_eq!(parse_test_summary("Tests: 3 failed, 10 passed, 13 total"), (10, 3));
        assert_eq!(parse_test_summary("5 passing\n2 failing"), (5, 2));
        assert_eq!(parse_test_summary("no recognizable output"), (0, 0));
    }

    #[tokio::test]
    async fn test_dev_server_probe_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut recs = Vec::new();
        let result = check_dev_server(port, &mut recs).await;
        assert_eq!(result.status, CheckStatus::Pass);

        drop(listener);
        let result = check_dev_server(port, &mut recs).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(!recs.is_empty());
    }
}
