//! Evidence gate for task completion.
//!
//! A task may only complete once externally produced test and coverage
//! results satisfy the configured [`EvidencePolicy`]. Every verification
//! attempt, passing or not, is appended to the `task_evidence` audit trail.
//!
//! ## Checks
//!
//! | Threshold          | Violated when                                         |
//! |--------------------|-------------------------------------------------------|
//! | `tests_failed`     | any test failed                                       |
//! | `pass_rate`        | pass rate below `min_pass_rate`                       |
//! | `coverage`         | coverage below `min_coverage` (when required)         |
//! | `coverage_missing` | no coverage reported (when required)                  |
//! | `skipped_tests`    | skipped tests reported (when disallowed)              |
//! | `skip_patterns`    | skip markers found in source (when disallowed)        |
//! | `test_output`      | raw test output missing or too short to be real       |

mod verifier;

pub use verifier::{EvidenceVerifier, VerificationRequest};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breakdown::WorkNumber;
use crate::errors::ForemanError;

/// Minimum characters of raw test output accepted as evidence.
pub const MIN_TEST_OUTPUT_CHARS: usize = 10;

/// Quality thresholds a task must meet before completing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePolicy {
    pub require_coverage: bool,
    pub min_coverage: f64,
    pub allow_skipped_tests: bool,
    pub min_pass_rate: f64,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            require_coverage: true,
            min_coverage: 85.0,
            allow_skipped_tests: false,
            min_pass_rate: 100.0,
        }
    }
}

/// Raw results from an external test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Line coverage percentage, if the run measured it.
    pub coverage: Option<f64>,
    pub output: String,
    pub framework: Option<String>,
}

impl TestResults {
    /// Passed over all reported tests, skipped included, as a percentage.
    ///
    /// `total` is taken as at least `passed + failed + skipped` so an
    /// under-reported total cannot push the rate past 100.
    pub fn pass_rate(&self) -> f64 {
        let counted = u64::from(self.passed) + u64::from(self.failed) + u64::from(self.skipped);
        let total = u64::from(self.total).max(counted);
        if total == 0 {
            return 0.0;
        }
        self.passed as f64 / total as f64 * 100.0
    }
}

/// A skip marker found in source by the external detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipViolation {
    pub file: String,
    pub line: u32,
    pub pattern: String,
    pub context: Option<String>,
}

/// One violated threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "threshold", rename_all = "snake_case")]
pub enum Violation {
    TestsFailed { failed: u32 },
    PassRate { actual: f64, minimum: f64 },
    Coverage { actual: f64, minimum: f64 },
    CoverageMissing,
    SkippedTests { count: u32 },
    SkipPatterns { count: usize },
    TestOutput,
}

impl Violation {
    /// Stable name of the threshold this violation refers to.
    pub fn threshold(&self) -> &'static str {
        match self {
            Self::TestsFailed { .. } => "tests_failed",
            Self::PassRate { .. } => "pass_rate",
            Self::Coverage { .. } => "coverage",
            Self::CoverageMissing => "coverage_missing",
            Self::SkippedTests { .. } => "skipped_tests",
            Self::SkipPatterns { .. } => "skip_patterns",
            Self::TestOutput => "test_output",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TestsFailed { failed } => write!(f, "{failed} test(s) failed"),
            Self::PassRate { actual, minimum } => {
                write!(f, "pass rate {actual:.1}% is below minimum {minimum:.1}%")
            }
            Self::Coverage { actual, minimum } => {
                write!(f, "coverage {actual:.1}% is below minimum {minimum:.1}%")
            }
            Self::CoverageMissing => write!(f, "coverage is required but was not reported"),
            Self::SkippedTests { count } => write!(f, "{count} skipped test(s) are not allowed"),
            Self::SkipPatterns { count } => {
                write!(f, "{count} skip marker(s) found in source")
            }
            Self::TestOutput => write!(
                f,
                "test output missing or shorter than {MIN_TEST_OUTPUT_CHARS} characters"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Rejected,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(Self::Verified),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid verification status: {}", s)),
        }
    }
}

/// Evidence row as written; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvidence {
    pub project_id: i64,
    pub task_id: Uuid,
    pub task_number: WorkNumber,
    pub agent_id: Option<String>,
    pub attempt: u32,
    pub verification_status: VerificationStatus,
    pub test_results: TestResults,
    pub coverage_pct: Option<f64>,
    pub skip_violations: Vec<SkipViolation>,
    pub violations: Vec<Violation>,
}

/// Persisted, immutable verification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub project_id: i64,
    pub task_id: Uuid,
    pub task_number: WorkNumber,
    pub agent_id: Option<String>,
    pub attempt: u32,
    pub verification_status: VerificationStatus,
    pub test_results: TestResults,
    pub coverage_pct: Option<f64>,
    pub skip_violations: Vec<SkipViolation>,
    pub violations: Vec<Violation>,
    pub created_at: DateTime<Utc>,
}

impl EvidenceRecord {
    /// Human-readable report of this record.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Evidence #{} for task {} (attempt {}): {}\n",
            self.id,
            self.task_number,
            self.attempt,
            self.verification_status.as_str().to_uppercase()
        ));
        out.push_str(&format!("  Recorded: {}\n", self.created_at.to_rfc3339()));
        if let Some(agent) = &self.agent_id {
            out.push_str(&format!("  Agent: {agent}\n"));
        }
        let r = &self.test_results;
        out.push_str(&format!(
            "  Tests: {} total, {} passed, {} failed, {} skipped ({:.1}% pass rate)\n",
            r.total,
            r.passed,
            r.failed,
            r.skipped,
            r.pass_rate()
        ));
        match self.coverage_pct {
            Some(c) => out.push_str(&format!("  Coverage: {c:.1}%\n")),
            None => out.push_str("  Coverage: not reported\n"),
        }
        if !self.skip_violations.is_empty() {
            out.push_str("  Skip markers:\n");
            for skip in &self.skip_violations {
                out.push_str(&format!("    {}:{} {}\n", skip.file, skip.line, skip.pattern));
            }
        }
        if !self.violations.is_empty() {
            out.push_str("  Violations:\n");
            for v in &self.violations {
                out.push_str(&format!("    [{}] {}\n", v.threshold(), v));
            }
        }
        out
    }
}

/// Outcome of one verification, returned to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub record_id: i64,
    pub task_number: WorkNumber,
    pub passed: bool,
    pub pass_rate: f64,
    pub coverage: Option<f64>,
    pub violations: Vec<Violation>,
}

impl VerificationReport {
    /// Names of every violated threshold.
    pub fn thresholds(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|v| v.threshold().to_string())
            .collect()
    }

    /// One-line reason suitable for a blocked task.
    pub fn reason(&self) -> String {
        if self.passed {
            return "evidence verified".to_string();
        }
        let details: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        format!("evidence rejected: {}", details.join("; "))
    }

    pub fn ensure_passed(&self) -> Result<(), ForemanError> {
        if self.passed {
            return Ok(());
        }
        Err(ForemanError::EvidenceViolation {
            task: self.task_number.to_string(),
            violations: self.thresholds(),
        })
    }
}
