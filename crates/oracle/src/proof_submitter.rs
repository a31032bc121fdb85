//! # Proof Submitter
//!
//! Turns one pending report into a confirmed attestation.
//!
//! ## Flow
//!
//! ```text
//! AnalysisReport
//!   │
//!   ├─ submitted / no content ─────────────▶ Skipped
//!   ├─ confirmed earlier, store not marked ─▶ retry mark only
//!   ├─ claim (StateTracker::begin_submission) fails ─▶ Skipped
//!   ├─ validate ── error ──────────────────▶ Malformed (Failed, never retried)
//!   ├─ ledger already holds attestation ───▶ Recovered (mark only)
//!   ├─ send + confirm ── error ────────────▶ Retrying | Failed (cap)
//!   │                  └─ unencodable ─────▶ Failed, never retried
//!   └─ record_submitted ───────────────────▶ Submitted
//! ```
//!
//! At most one transaction per report is ever in flight: the claim taken
//! in the state tracker is released only by a terminal record call.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use securizz_common::{AnalysisReport, Attestation, ReportError};

use crate::backend_client::BackendError;
use crate::chain_client::{ChainClient, ChainError};
use crate::metrics::{inc, OracleMetrics};
use crate::state_tracker::{StateTracker, SubmissionState};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error("malformed report: {0}")]
    Malformed(#[from] ReportError),

    #[error("contract already attested with report hash {existing}")]
    ConflictingAttestation { existing: String },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Why a report was left alone this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySubmitted,
    NoContent,
    InFlight,
    Failed,
}

/// Result of one [`ProofSubmitter::submit`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// New attestation confirmed and the store flag set.
    Submitted { signature: String },
    /// The ledger already held this attestation; only the flag was set.
    Recovered { signature: String },
    /// Attestation is confirmed but the store flag is still unset.
    MarkPending { signature: String },
    Skipped(SkipReason),
    /// Transient failure, will be retried next cycle.
    Retrying { attempts: u32, error: String },
    /// Attempt cap reached or the report is malformed.
    Failed { reason: String },
}

pub struct ProofSubmitter {
    chain: Arc<ChainClient>,
    tracker: Arc<StateTracker>,
    metrics: Arc<OracleMetrics>,
}

impl ProofSubmitter {
    pub fn new(
        chain: Arc<ChainClient>,
        tracker: Arc<StateTracker>,
        metrics: Arc<OracleMetrics>,
    ) -> Self {
        Self {
            chain,
            tracker,
            metrics,
        }
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    /// Submits `report` if it is eligible. Never returns an error: every
    /// failure is folded into the outcome and the tracker state.
    pub async fn submit(&self, report: &AnalysisReport) -> SubmitOutcome {
        if report.submitted {
            debug!(report_id = %report.id, "already submitted, skipping");
            return SubmitOutcome::Skipped(SkipReason::AlreadySubmitted);
        }
        if !report.has_content() {
            debug!(report_id = %report.id, "no content identifier yet, skipping");
            return SubmitOutcome::Skipped(SkipReason::NoContent);
        }

        if !self.tracker.begin_submission(&report.id) {
            let reason = if self.tracker.current_state(report).is_failed() {
                SkipReason::Failed
            } else {
                SkipReason::InFlight
            };
            debug!(report_id = %report.id, ?reason, "not claimable, skipping");
            return SubmitOutcome::Skipped(reason);
        }

        self.metrics.in_flight_started();
        let outcome = self.submit_claimed(report).await;
        self.metrics.in_flight_finished();
        outcome
    }

    async fn submit_claimed(&self, report: &AnalysisReport) -> SubmitOutcome {
        if let Some(signature) = self.tracker.pending_mark(&report.id) {
            return self.mark(report, signature, false).await;
        }

        let attestation = match Attestation::from_report(report) {
            Ok(a) => a,
            Err(e) => return self.malformed(report, &SubmitError::from(e)),
        };

        match self.send(&attestation).await {
            Ok(Sent::New(signature)) => {
                inc(&self.metrics.submissions_confirmed);
                info!(
                    report_id = %report.id,
                    contract_hash = %attestation.contract_hash_hex(),
                    risk_score_fixed = attestation.risk_score_fixed,
                    signature = %signature,
                    "attestation confirmed"
                );
                self.mark(report, signature, false).await
            }
            Ok(Sent::Existing(signature)) => {
                inc(&self.metrics.attestations_recovered);
                info!(
                    report_id = %report.id,
                    contract_hash = %attestation.contract_hash_hex(),
                    signature = %signature,
                    "attestation already on ledger"
                );
                self.mark(report, signature, true).await
            }
            Err(e @ SubmitError::ConflictingAttestation { .. }) => self.malformed(report, &e),
            Err(SubmitError::Chain(e)) if !e.is_transient() => {
                self.malformed(report, &SubmitError::Chain(e))
            }
            Err(e) => self.transient(report, &e),
        }
    }

    async fn send(&self, attestation: &Attestation) -> Result<Sent, SubmitError> {
        if let Some(record) = self.chain.find_attestation(&attestation.contract_hash).await? {
            if record.attests(&attestation.report_hash) {
                return Ok(Sent::Existing(record.submitter_signature));
            }
            return Err(SubmitError::ConflictingAttestation {
                existing: record.report_hash,
            });
        }
        let signature = self.chain.submit_attestation(attestation).await?;
        Ok(Sent::New(signature))
    }

    async fn mark(&self, report: &AnalysisReport, signature: String, recovered: bool) -> SubmitOutcome {
        match self.tracker.record_submitted(&report.id, &signature).await {
            Ok(()) if recovered => SubmitOutcome::Recovered { signature },
            Ok(()) => SubmitOutcome::Submitted { signature },
            Err(e) => {
                inc(&self.metrics.mark_failures);
                warn!(
                    report_id = %report.id,
                    signature = %signature,
                    error = %e,
                    "mark-submitted failed, will retry without resending"
                );
                SubmitOutcome::MarkPending { signature }
            }
        }
    }

    fn malformed(&self, report: &AnalysisReport, e: &SubmitError) -> SubmitOutcome {
        inc(&self.metrics.reports_malformed);
        error!(report_id = %report.id, error = %e, "report cannot be attested");
        self.tracker.record_malformed(&report.id, &e.to_string());
        SubmitOutcome::Failed {
            reason: e.to_string(),
        }
    }

    fn transient(&self, report: &AnalysisReport, e: &SubmitError) -> SubmitOutcome {
        inc(&self.metrics.submission_failures);
        match self.tracker.record_failure(&report.id, &e.to_string()) {
            SubmissionState::Failed { reason, attempts } => {
                inc(&self.metrics.reports_failed);
                error!(
                    report_id = %report.id,
                    attempts,
                    error = %e,
                    "attempt cap reached, report failed until reset"
                );
                SubmitOutcome::Failed { reason }
            }
            SubmissionState::Pending { attempts } => {
                warn!(report_id = %report.id, attempts, error = %e, "submission failed, will retry");
                SubmitOutcome::Retrying {
                    attempts,
                    error: e.to_string(),
                }
            }
            other => SubmitOutcome::Failed {
                reason: format!("unexpected state {:?}", other),
            },
        }
    }
}

enum Sent {
    New(String),
    Existing(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use securizz_common::{attestation_address, AttestationRecord, OracleKeypair};

    use crate::backend_client::MockReportStore;
    use crate::chain_client::{MockChainTransport, MockFailure};

    struct Harness {
        chain: Arc<MockChainTransport>,
        store: Arc<MockReportStore>,
        metrics: Arc<OracleMetrics>,
        submitter: ProofSubmitter,
    }

    fn report(id: &str, contract: u8, risk: f64, cid: &str) -> AnalysisReport {
        AnalysisReport {
            id: id.to_string(),
            contract_hash: hex::encode([contract; 32]),
            report_hash: "bb".repeat(32),
            content_id: cid.to_string(),
            risk_score: risk,
            submitted: false,
        }
    }

    fn harness(reports: Vec<AnalysisReport>, cap: u32) -> Harness {
        let chain = Arc::new(MockChainTransport::new());
        let store = Arc::new(MockReportStore::new(reports));
        let metrics = Arc::new(OracleMetrics::new());
        let client = ChainClient::new(
            chain.clone(),
            Arc::new(OracleKeypair::from_seed([8u8; 32])),
            "SecuRizz",
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_millis(50));
        let tracker = Arc::new(StateTracker::new(store.clone(), cap));
        let submitter = ProofSubmitter::new(Arc::new(client), tracker, metrics.clone());
        Harness {
            chain,
            store,
            metrics,
            submitter,
        }
    }

    #[tokio::test]
    async fn submits_and_marks() {
        let r = report("1", 0xAA, 0.4567, "QmA");
        let h = harness(vec![r.clone()], 5);

        let outcome = h.submitter.submit(&r).await;
        let signature = match outcome {
            SubmitOutcome::Submitted { signature } => signature,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(h.store.signature("1"), Some(signature));
        assert_eq!(
            h.chain.attestation(&[0xAA; 32]).map(|a| a.risk_score_fixed),
            Some(4567)
        );
        assert_eq!(OracleMetrics::get(&h.metrics.submissions_confirmed), 1);
        assert_eq!(OracleMetrics::get(&h.metrics.in_flight), 0);
    }

    #[tokio::test]
    async fn skips_submitted_and_contentless() {
        let mut done = report("1", 1, 0.1, "QmA");
        done.submitted = true;
        let empty = report("2", 2, 0.1, "");
        let h = harness(vec![done.clone(), empty.clone()], 5);

        assert_eq!(
            h.submitter.submit(&done).await,
            SubmitOutcome::Skipped(SkipReason::AlreadySubmitted)
        );
        assert_eq!(
            h.submitter.submit(&empty).await,
            SubmitOutcome::Skipped(SkipReason::NoContent)
        );
        assert_eq!(h.chain.send_count(), 0);
    }

    #[tokio::test]
    async fn malformed_is_not_retried() {
        let mut bad = report("1", 1, 0.5, "QmA");
        bad.contract_hash = "ab".repeat(31);
        let h = harness(vec![bad.clone()], 5);

        assert!(matches!(h.submitter.submit(&bad).await, SubmitOutcome::Failed { .. }));
        assert_eq!(
            h.submitter.submit(&bad).await,
            SubmitOutcome::Skipped(SkipReason::Failed)
        );
        assert_eq!(h.chain.send_count(), 0);
        assert_eq!(OracleMetrics::get(&h.metrics.reports_malformed), 1);
    }

    #[tokio::test]
    async fn out_of_range_risk_is_malformed() {
        let bad = report("1", 1, 1.1, "QmA");
        let h = harness(vec![bad.clone()], 5);
        assert!(matches!(h.submitter.submit(&bad).await, SubmitOutcome::Failed { .. }));
        assert_eq!(h.chain.send_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_hit_cap() {
        let r = report("1", 3, 0.5, "QmA");
        let h = harness(vec![r.clone()], 3);
        for _ in 0..3 {
            h.chain.push_failure(MockFailure::Timeout);
        }

        assert!(matches!(
            h.submitter.submit(&r).await,
            SubmitOutcome::Retrying { attempts: 1, .. }
        ));
        assert!(matches!(
            h.submitter.submit(&r).await,
            SubmitOutcome::Retrying { attempts: 2, .. }
        ));
        assert!(matches!(h.submitter.submit(&r).await, SubmitOutcome::Failed { .. }));
        assert_eq!(
            h.submitter.submit(&r).await,
            SubmitOutcome::Skipped(SkipReason::Failed)
        );
        assert_eq!(h.chain.send_count(), 3);

        assert!(h.submitter.tracker().reset("1"));
        assert!(matches!(h.submitter.submit(&r).await, SubmitOutcome::Submitted { .. }));
    }

    #[tokio::test]
    async fn existing_attestation_is_recovered_without_send() {
        let r = report("1", 4, 0.5, "QmA");
        let h = harness(vec![r.clone()], 5);
        let att = Attestation::from_report(&r).unwrap_or_else(|e| panic!("{}", e));
        h.chain.insert_attestation(
            attestation_address("SecuRizz", &att.contract_hash),
            AttestationRecord::from_attestation(&att, "earlier-sig", &[0u8; 32], 1),
        );

        assert_eq!(
            h.submitter.submit(&r).await,
            SubmitOutcome::Recovered {
                signature: "earlier-sig".to_string()
            }
        );
        assert_eq!(h.chain.send_count(), 0);
        assert_eq!(h.store.signature("1").as_deref(), Some("earlier-sig"));
    }

    #[tokio::test]
    async fn conflicting_attestation_fails() {
        let r = report("1", 5, 0.5, "QmA");
        let h = harness(vec![r.clone()], 5);
        let mut att = Attestation::from_report(&r).unwrap_or_else(|e| panic!("{}", e));
        att.report_hash = [0xCC; 32];
        h.chain.insert_attestation(
            attestation_address("SecuRizz", &att.contract_hash),
            AttestationRecord::from_attestation(&att, "other", &[0u8; 32], 1),
        );

        assert!(matches!(h.submitter.submit(&r).await, SubmitOutcome::Failed { .. }));
        assert_eq!(h.chain.send_count(), 0);
    }

    #[tokio::test]
    async fn mark_failure_does_not_resend() {
        let r = report("1", 6, 0.5, "QmA");
        let h = harness(vec![r.clone()], 5);
        h.store.fail_next_mark(BackendError::Timeout);

        assert!(matches!(h.submitter.submit(&r).await, SubmitOutcome::MarkPending { .. }));
        assert!(matches!(h.submitter.submit(&r).await, SubmitOutcome::Submitted { .. }));
        assert_eq!(h.chain.send_count(), 1);
        assert_eq!(h.store.mark_calls(), 2);
    }

    #[tokio::test]
    async fn unencodable_transaction_is_not_retried() {
        let r = report("1", 7, 0.5, "QmA");
        let chain = Arc::new(MockChainTransport::new());
        let store = Arc::new(MockReportStore::new(vec![r.clone()]));
        let metrics = Arc::new(OracleMetrics::new());
        // Program ids longer than the envelope allows cannot be signed.
        let client = ChainClient::new(
            chain.clone(),
            Arc::new(OracleKeypair::from_seed([8u8; 32])),
            "p".repeat(300),
        );
        let tracker = Arc::new(StateTracker::new(store, 5));
        let submitter = ProofSubmitter::new(Arc::new(client), tracker, metrics.clone());

        assert!(matches!(submitter.submit(&r).await, SubmitOutcome::Failed { .. }));
        assert_eq!(
            submitter.submit(&r).await,
            SubmitOutcome::Skipped(SkipReason::Failed)
        );
        assert_eq!(chain.send_count(), 0);
        assert_eq!(OracleMetrics::get(&metrics.reports_malformed), 1);
    }
}
