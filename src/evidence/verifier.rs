use uuid::Uuid;

use super::{
    EvidencePolicy, EvidenceRecord, MIN_TEST_OUTPUT_CHARS, NewEvidence, SkipViolation, TestResults,
    VerificationReport, VerificationStatus, Violation,
};
use crate::breakdown::WorkNumber;
use crate::errors::ForemanError;
use crate::store::DbHandle;

/// One completion attempt submitted for verification.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub project_id: i64,
    pub task_id: Uuid,
    pub task_number: WorkNumber,
    pub agent_id: Option<String>,
    pub attempt: u32,
    pub results: TestResults,
    pub skip_violations: Vec<SkipViolation>,
}

pub struct EvidenceVerifier {
    policy: EvidencePolicy,
    db: DbHandle,
}

impl EvidenceVerifier {
    pub fn new(policy: EvidencePolicy, db: DbHandle) -> Self {
        Self { policy, db }
    }

    pub fn policy(&self) -> &EvidencePolicy {
        &self.policy
    }

    /// Every threshold the results miss, in check order.
    pub fn evaluate(&self, results: &TestResults, skips: &[SkipViolation]) -> Vec<Violation> {
        let policy = &self.policy;
        let mut violations = Vec::new();

        if results.failed > 0 {
            violations.push(Violation::TestsFailed {
                failed: results.failed,
            });
        }

        let pass_rate = results.pass_rate();
        if pass_rate < policy.min_pass_rate {
            violations.push(Violation::PassRate {
                actual: pass_rate,
                minimum: policy.min_pass_rate,
            });
        }

        if policy.require_coverage {
            match results.coverage {
                Some(actual) if actual < policy.min_coverage => {
                    violations.push(Violation::Coverage {
                        actual,
                        minimum: policy.min_coverage,
                    });
                }
                Some(_) => {}
                None => violations.push(Violation::CoverageMissing),
            }
        }

        if !policy.allow_skipped_tests {
            if results.skipped > 0 {
                violations.push(Violation::SkippedTests {
                    count: results.skipped,
                });
            }
            if !skips.is_empty() {
                violations.push(Violation::SkipPatterns { count: skips.len() });
            }
        }

        if results.output.trim().chars().count() < MIN_TEST_OUTPUT_CHARS {
            violations.push(Violation::TestOutput);
        }

        violations
    }

    /// Evaluate the results and append exactly one evidence record.
    ///
    /// A rejected verification is not an error: the report carries every
    /// violated threshold. Only a failed write is.
    pub async fn verify(
        &self,
        request: VerificationRequest,
    ) -> Result<VerificationReport, ForemanError> {
        let violations = self.evaluate(&request.results, &request.skip_violations);
        let passed = violations.is_empty();
        let pass_rate = request.results.pass_rate();
        let coverage = request.results.coverage;

        let evidence = NewEvidence {
            project_id: request.project_id,
            task_id: request.task_id,
            task_number: request.task_number.clone(),
            agent_id: request.agent_id,
            attempt: request.attempt,
            verification_status: if passed {
                VerificationStatus::Verified
            } else {
                VerificationStatus::Rejected
            },
            test_results: request.results,
            coverage_pct: coverage,
            skip_violations: request.skip_violations,
            violations: violations.clone(),
        };
        let record = self
            .db
            .persist(move |db| db.insert_evidence(&evidence))
            .await?;

        let report = VerificationReport {
            record_id: record.id,
            task_number: request.task_number,
            passed,
            pass_rate,
            coverage,
            violations,
        };
        if passed {
            tracing::info!(task = %report.task_number, record_id = record.id, "Evidence verified");
        } else {
            tracing::warn!(
                task = %report.task_number,
                record_id = record.id,
                thresholds = ?report.thresholds(),
                "Evidence rejected"
            );
        }
        Ok(report)
    }

    /// Audit trail for a task, oldest first.
    pub async fn history(&self, task_id: Uuid) -> Result<Vec<EvidenceRecord>, ForemanError> {
        self.db.persist(move |db| db.list_evidence(task_id)).await
    }
}
