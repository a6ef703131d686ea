//! Deployer sub-protocol.
//!
//! A deployer task runs after all other tasks, gated by a build
//! verification. Its success is decided by scanning the raw worker output:
//! failure markers win over success markers, and failures are diagnosed
//! into a category with a window of surrounding log lines for the retry
//! context.

use std::fmt;

/// Success markers scanned in the deployer output.
const SUCCESS_MARKERS: [&str; 4] = [
    "app started",
    "instances running",
    "status: running",
    "push successful",
];

/// Failure markers; any of these overrides every success marker.
const FAILURE_MARKERS: [&str; 5] = [
    "crashed",
    "staging failed",
    "health check timeout",
    "failed to bind service",
    "service binding failed",
];

/// Host suffixes that identify a deployment-platform route.
const DEFAULT_URL_SUFFIXES: [&str; 3] = [".apps.internal", ".cfapps.io", ".apps.cloud"];

/// Lines kept before and after the first diagnostic keyword match.
const WINDOW_BEFORE: usize = 5;
const WINDOW_AFTER: usize = 10;

// ---------------------------------------------------------------------------
// Pre-deploy verification
// ---------------------------------------------------------------------------

/// Outcome of the pre-deploy build verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildVerification {
    Ok,
    Failed { reason: String },
}

/// Parse the build-verification tester output. Any `BUILD: FAIL`,
/// `MANIFEST: FAIL`, or `MANIFEST: MISSING` marker fails the verification
/// and the deployer is skipped.
pub fn verify_build_output(output: &str) -> BuildVerification {
    for marker in ["BUILD: FAIL", "MANIFEST: FAIL", "MANIFEST: MISSING"] {
        if output.contains(marker) {
            return BuildVerification::Failed {
                reason: format!("pre-deploy verification reported {marker}"),
            };
        }
    }
    BuildVerification::Ok
}

// ---------------------------------------------------------------------------
// Outcome scan
// ---------------------------------------------------------------------------

/// Category of a diagnosed deployment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosisCategory {
    BuildFailure,
    ServiceBindingFailure,
    StagingFailure,
    AppCrashed,
    HealthCheckTimeout,
    Unknown,
}

impl fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuildFailure => "build-failure",
            Self::ServiceBindingFailure => "service-binding-failure",
            Self::StagingFailure => "staging-failure",
            Self::AppCrashed => "app-crashed",
            Self::HealthCheckTimeout => "health-check-timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A categorised deployment failure with its surrounding log context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployDiagnosis {
    pub category: DiagnosisCategory,
    pub reason: String,
    /// Log lines around the first diagnostic keyword match.
    pub log_window: String,
}

/// The decided result of a deployer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Success { url: Option<String> },
    Failure { diagnosis: DeployDiagnosis },
}

/// Decide whether a deployer run succeeded by scanning its output.
///
/// Failure markers take precedence over success markers; an output
/// containing both is a failure. An output with neither is a failure too
/// (diagnosed as unknown) since the platform never confirmed the app.
pub fn scan_deployer_output(output: &str) -> DeployOutcome {
    let lowered = output.to_lowercase();

    let failed = FAILURE_MARKERS.iter().any(|m| lowered.contains(m))
        || has_nonzero_exit_status(&lowered);
    if failed {
        return DeployOutcome::Failure {
            diagnosis: diagnose(output),
        };
    }

    if SUCCESS_MARKERS.iter().any(|m| lowered.contains(m)) {
        return DeployOutcome::Success {
            url: extract_deployment_url(output, &DEFAULT_URL_SUFFIXES),
        };
    }

    DeployOutcome::Failure {
        diagnosis: DeployDiagnosis {
            category: DiagnosisCategory::Unknown,
            reason: "deployer output contains no success confirmation".into(),
            log_window: tail_lines(output, WINDOW_AFTER),
        },
    }
}

/// `exit status N` with N != 0 counts as a failure marker.
fn has_nonzero_exit_status(lowered: &str) -> bool {
    let mut rest = lowered;
    while let Some(idx) = rest.find("exit status ") {
        let after = &rest[idx + "exit status ".len()..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(code) = digits.parse::<i32>() {
            if code != 0 {
                return true;
            }
        }
        rest = after;
    }
    false
}

/// Extract the deployment URL from a `routes:` line, or from any explicit
/// `https://` URL whose host ends with a known platform suffix.
pub fn extract_deployment_url(output: &str, suffixes: &[&str]) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("routes:") {
            let route = rest.trim().split_whitespace().next()?;
            if route.is_empty() {
                continue;
            }
            return Some(if route.starts_with("http") {
                route.to_owned()
            } else {
                format!("https://{route}")
            });
        }
    }

    for token in output.split_whitespace() {
        if let Some(host_and_path) = token.strip_prefix("https://") {
            let host = host_and_path.split('/').next().unwrap_or("");
            if suffixes.iter().any(|s| host.ends_with(s)) {
                return Some(token.trim_end_matches(['.', ',', ')']).to_owned());
            }
        }
    }

    None
}

/// Categorise a failed deployment and capture the log window around the
/// first relevant keyword (five lines before, ten after).
pub fn diagnose(output: &str) -> DeployDiagnosis {
    let lowered = output.to_lowercase();

    let (category, keyword) = if lowered.contains("staging failed") {
        (DiagnosisCategory::StagingFailure, "staging failed")
    } else if lowered.contains("health check timeout") {
        (DiagnosisCategory::HealthCheckTimeout, "health check timeout")
    } else if lowered.contains("failed to bind service") || lowered.contains("service binding failed")
    {
        (DiagnosisCategory::ServiceBindingFailure, "bind")
    } else if lowered.contains("build fail") || lowered.contains("compilation fail") {
        (DiagnosisCategory::BuildFailure, "fail")
    } else if lowered.contains("crashed") {
        (DiagnosisCategory::AppCrashed, "crashed")
    } else {
        (DiagnosisCategory::Unknown, "")
    };

    let reason = match category {
        DiagnosisCategory::BuildFailure => "the application build failed on the platform",
        DiagnosisCategory::ServiceBindingFailure => "a required service binding was not satisfied",
        DiagnosisCategory::StagingFailure => "the platform failed to stage the application",
        DiagnosisCategory::AppCrashed => "the application crashed after starting",
        DiagnosisCategory::HealthCheckTimeout => "the platform health check never passed",
        DiagnosisCategory::Unknown => "the deployment failed for an unrecognised reason",
    };

    let log_window = if keyword.is_empty() {
        tail_lines(output, WINDOW_AFTER)
    } else {
        window_around(output, keyword)
    };

    DeployDiagnosis {
        category,
        reason: reason.to_owned(),
        log_window,
    }
}

/// Render the retry context for a failed deployment: category, human
/// reason, and the captured log window.
pub fn deploy_retry_context(diagnosis: &DeployDiagnosis) -> String {
    format!(
        "Deployment failed ({category}): {reason}\nRelevant log lines:\n{window}",
        category = diagnosis.category,
        reason = diagnosis.reason,
        window = diagnosis.log_window,
    )
}

fn window_around(output: &str, keyword: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let keyword_lower = keyword.to_lowercase();
    let hit = lines
        .iter()
        .position(|l| l.to_lowercase().contains(&keyword_lower));

    match hit {
        Some(i) => {
            let start = i.saturating_sub(WINDOW_BEFORE);
            let end = (i + WINDOW_AFTER + 1).min(lines.len());
            lines[start..end].join("\n")
        }
        None => tail_lines(output, WINDOW_AFTER),
    }
}

fn tail_lines(output: &str, count: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_verification_markers() {
        assert_eq!(verify_build_output("BUILD: OK\nMANIFEST: OK"), BuildVerification::Ok);
        assert!(matches!(
            verify_build_output("BUILD: FAIL\ncompile error"),
            BuildVerification::Failed { .. }
        ));
        assert!(matches!(
            verify_build_output("BUILD: OK\nMANIFEST: MISSING"),
            BuildVerification::Failed { .. }
        ));
    }

    #[test]
    fn success_markers_give_success() {
        let output = "pushing app\npush successful\nroutes: demo.apps.internal\n";
        match scan_deployer_output(output) {
            DeployOutcome::Success { url } => {
                assert_eq!(url.as_deref(), Some("https://demo.apps.internal"));
            }
            DeployOutcome::Failure { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn failure_markers_take_precedence_over_success() {
        let output = "app started\ninstances running\nprocess crashed with exit status 137\n";
        match scan_deployer_output(output) {
            DeployOutcome::Failure { diagnosis } => {
                assert_eq!(diagnosis.category, DiagnosisCategory::AppCrashed);
            }
            DeployOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn nonzero_exit_status_is_a_failure() {
        let output = "app started\nworker exited with exit status 1\n";
        assert!(matches!(scan_deployer_output(output), DeployOutcome::Failure { .. }));
    }

    #[test]
    fn zero_exit_status_is_not_a_failure() {
        let output = "push successful\nfinished with exit status 0\n";
        assert!(matches!(scan_deployer_output(output), DeployOutcome::Success { .. }));
    }

    #[test]
    fn no_markers_at_all_is_a_failure() {
        match scan_deployer_output("uploading bits...\ndone\n") {
            DeployOutcome::Failure { diagnosis } => {
                assert_eq!(diagnosis.category, DiagnosisCategory::Unknown);
            }
            DeployOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn url_from_routes_line() {
        let output = "name: demo\nroutes: demo-app.cfapps.io\nstatus: running\n";
        assert_eq!(
            extract_deployment_url(output, &DEFAULT_URL_SUFFIXES).as_deref(),
            Some("https://demo-app.cfapps.io")
        );
    }

    #[test]
    fn url_from_explicit_https_host() {
        let output = "status: running\napp reachable at https://demo.apps.internal/health now\n";
        assert_eq!(
            extract_deployment_url(output, &DEFAULT_URL_SUFFIXES).as_deref(),
            Some("https://demo.apps.internal/health")
        );
    }

    #[test]
    fn unrelated_https_urls_are_ignored() {
        let output = "see https://docs.example.com/guide for help\n";
        assert_eq!(extract_deployment_url(output, &DEFAULT_URL_SUFFIXES), None);
    }

    #[test]
    fn diagnosis_categories() {
        assert_eq!(diagnose("Staging failed: buildpack").category, DiagnosisCategory::StagingFailure);
        assert_eq!(diagnose("health check timeout after 60s").category, DiagnosisCategory::HealthCheckTimeout);
        assert_eq!(diagnose("failed to bind service db").category, DiagnosisCategory::ServiceBindingFailure);
        assert_eq!(diagnose("process crashed").category, DiagnosisCategory::AppCrashed);
        assert_eq!(diagnose("something odd").category, DiagnosisCategory::Unknown);
    }

    #[test]
    fn log_window_captures_surrounding_lines() {
        let mut lines: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        lines[15] = "process crashed here".into();
        let output = lines.join("\n");

        let diagnosis = diagnose(&output);
        assert_eq!(diagnosis.category, DiagnosisCategory::AppCrashed);
        // Five before, the hit, ten after.
        assert!(diagnosis.log_window.contains("line 10"));
        assert!(diagnosis.log_window.contains("process crashed here"));
        assert!(diagnosis.log_window.contains("line 25"));
        assert!(!diagnosis.log_window.contains("line 9\n"));
        assert!(!diagnosis.log_window.contains("line 26"));
    }

    #[test]
    fn retry_context_embeds_category_reason_window() {
        let diagnosis = diagnose("Staging failed: no buildpack detected");
        let context = deploy_retry_context(&diagnosis);
        assert!(context.contains("staging-failure"));
        assert!(context.contains("failed to stage"));
        assert!(context.contains("no buildpack detected"));
    }
}
