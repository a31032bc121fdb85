//! # Reconciliation Integration Tests
//!
//! Drives the scheduler's cycles end to end against in-memory doubles of
//! the ledger, the report store and the content gateway.
//!
//! | Section | Focus |
//! |---------|-------|
//! | Eligibility | single submission per report |
//! | Timeouts and cap | attempt cap, operator reset, store outage |
//! | Recovery and idempotency | crash recovery, mark retries |
//! | Integrity | verification and tamper detection |

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use securizz_common::{content_digest_hex, AnalysisReport, OracleKeypair};
use securizz_oracle::{
    BackendError, ChainClient, IntegrityVerifier, MockChainTransport, MockContentStore,
    MockFailure, MockReportStore, OracleMetrics, ProofSubmitter, Scheduler, SchedulerSettings,
    StateTracker, SubmissionState, VerificationOutcome,
};

// ════════════════════════════════════════════════════════════════════════════
// HARNESS
// ════════════════════════════════════════════════════════════════════════════

struct Oracle {
    chain: Arc<MockChainTransport>,
    store: Arc<MockReportStore>,
    content: Arc<MockContentStore>,
    tracker: Arc<StateTracker>,
    metrics: Arc<OracleMetrics>,
    scheduler: Arc<Scheduler>,
}

fn oracle_with(
    chain: Arc<MockChainTransport>,
    store: Arc<MockReportStore>,
    content: Arc<MockContentStore>,
    cap: u32,
) -> Oracle {
    let metrics = Arc::new(OracleMetrics::new());
    let client = Arc::new(
        ChainClient::new(
            chain.clone(),
            Arc::new(OracleKeypair::from_seed([42u8; 32])),
            "SecuRizzAudit",
        )
        .with_timeouts(Duration::from_secs(60), Duration::from_secs(2)),
    );
    let tracker = Arc::new(StateTracker::new(store.clone(), cap));
    let submitter = Arc::new(ProofSubmitter::new(
        client.clone(),
        tracker.clone(),
        metrics.clone(),
    ));
    let verifier = Arc::new(IntegrityVerifier::new(
        client,
        content.clone(),
        tracker.clone(),
        metrics.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        submitter,
        verifier,
        metrics.clone(),
        SchedulerSettings::default(),
    ));
    Oracle {
        chain,
        store,
        content,
        tracker,
        metrics,
        scheduler,
    }
}

fn oracle(reports: Vec<AnalysisReport>, cap: u32) -> Oracle {
    oracle_with(
        Arc::new(MockChainTransport::new()),
        Arc::new(MockReportStore::new(reports)),
        Arc::new(MockContentStore::new()),
        cap,
    )
}

fn report(id: &str, contract: u8, content_id: &str, submitted: bool) -> AnalysisReport {
    AnalysisReport {
        id: id.to_string(),
        contract_hash: hex::encode([contract; 32]),
        report_hash: "bb".repeat(32),
        content_id: content_id.to_string(),
        risk_score: 0.4567,
        submitted,
    }
}

impl Oracle {
    async fn submission_cycle(&self) {
        match self.scheduler.try_run_submission_cycle().await {
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("submission cycle failed: {}", e),
            None => panic!("submission cycle unexpectedly busy"),
        }
    }

    async fn integrity_cycle(&self) {
        match self.scheduler.try_run_integrity_cycle().await {
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("integrity cycle failed: {}", e),
            None => panic!("integrity cycle unexpectedly busy"),
        }
    }

    fn state(&self, id: &str) -> SubmissionState {
        let r = self
            .store
            .report(id)
            .unwrap_or_else(|| panic!("report {} missing", id));
        self.tracker.current_state(&r)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ELIGIBILITY
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn mixed_reports_one_cycle() {
    let o = oracle(
        vec![
            report("A", 0xA1, "QmA", true),
            report("B", 0xB1, "Qm1", false),
            report("C", 0xC1, "", false),
        ],
        5,
    );

    o.submission_cycle().await;

    assert_eq!(o.store.mark_calls(), 1);
    assert!(o.store.signature("A").is_none());
    assert!(o.store.report("B").map(|r| r.submitted).unwrap_or(false));
    assert!(!o.store.report("C").map(|r| r.submitted).unwrap_or(true));
    assert_eq!(o.chain.send_count(), 1);
    assert!(o.chain.attestation(&[0xC1; 32]).is_none());

    let rec = o
        .chain
        .attestation(&[0xB1; 32])
        .unwrap_or_else(|| panic!("B not attested"));
    assert_eq!(rec.content_id, "Qm1");
    assert_eq!(rec.risk_score_fixed, 4567);
    assert_eq!(o.store.signature("B"), Some(rec.submitter_signature));
}

#[tokio::test]
async fn second_cycle_sends_nothing() {
    let o = oracle(vec![report("B", 0xB2, "Qm1", false)], 5);
    o.submission_cycle().await;
    o.submission_cycle().await;
    o.submission_cycle().await;

    assert_eq!(o.chain.send_count(), 1);
    assert_eq!(o.chain.attestation_count(), 1);
    assert_eq!(o.store.mark_calls(), 1);
}

#[tokio::test]
async fn content_id_arriving_later_is_picked_up() {
    let o = oracle(vec![report("C", 0xC3, "", false)], 5);
    o.submission_cycle().await;
    assert_eq!(o.chain.send_count(), 0);

    o.store.set_content_id("C", "QmLate");
    o.submission_cycle().await;
    assert_eq!(
        o.chain.attestation(&[0xC3; 32]).map(|r| r.content_id),
        Some("QmLate".to_string())
    );
}

#[tokio::test]
async fn malformed_report_is_isolated() {
    let mut bad = report("X", 0x01, "QmX", false);
    bad.contract_hash = "not-hex".to_string();
    let o = oracle(vec![bad, report("Y", 0x02, "QmY", false)], 5);

    o.submission_cycle().await;
    o.submission_cycle().await;

    assert!(o.state("X").is_failed());
    assert!(matches!(o.state("Y"), SubmissionState::Submitted { .. }));
    assert_eq!(o.chain.send_count(), 1);
    assert_eq!(OracleMetrics::get(&o.metrics.reports_malformed), 1);
}

// ════════════════════════════════════════════════════════════════════════════
// TIMEOUTS AND CAP
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn three_timeouts_reach_cap() {
    let o = oracle(vec![report("D", 0xD1, "QmD", false)], 3);
    o.chain.set_stall_confirmations(true);

    for expected in 1..=2u32 {
        o.submission_cycle().await;
        assert_eq!(o.state("D"), SubmissionState::Pending { attempts: expected });
    }
    o.submission_cycle().await;
    assert!(o.state("D").is_failed());

    o.chain.set_stall_confirmations(false);
    o.submission_cycle().await;
    assert_eq!(o.chain.send_count(), 3);
    assert_eq!(OracleMetrics::get(&o.metrics.reports_failed), 1);
}

#[tokio::test(start_paused = true)]
async fn operator_reset_resumes_retries() {
    let o = oracle(vec![report("D", 0xD2, "QmD", false)], 2);
    o.chain.push_failure(MockFailure::Rejected("blockhash expired".to_string()));
    o.chain.push_failure(MockFailure::Network("connection reset".to_string()));

    o.submission_cycle().await;
    o.submission_cycle().await;
    assert!(o.state("D").is_failed());

    assert!(o.tracker.reset("D"));
    o.submission_cycle().await;
    assert!(matches!(o.state("D"), SubmissionState::Submitted { .. }));
}

#[tokio::test]
async fn backend_outage_skips_cycle() {
    let o = oracle(vec![report("B", 0xB3, "Qm1", false)], 5);
    o.store.fail_next_list(BackendError::Network("refused".to_string()));

    assert!(matches!(
        o.scheduler.try_run_submission_cycle().await,
        Some(Err(BackendError::Network(_)))
    ));
    assert_eq!(o.chain.send_count(), 0);

    o.submission_cycle().await;
    assert_eq!(o.chain.attestation_count(), 1);
}

// ════════════════════════════════════════════════════════════════════════════
// RECOVERY AND IDEMPOTENCY
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn restart_after_confirm_before_mark() {
    let chain = Arc::new(MockChainTransport::new());
    let store = Arc::new(MockReportStore::new(vec![report("E", 0xE1, "QmE", false)]));
    let content = Arc::new(MockContentStore::new());

    // First process: attestation confirmed, mark-submitted never lands.
    let first = oracle_with(chain.clone(), store.clone(), content.clone(), 5);
    store.fail_next_mark(BackendError::Timeout);
    first.submission_cycle().await;
    assert_eq!(chain.attestation_count(), 1);
    assert!(!store.report("E").map(|r| r.submitted).unwrap_or(true));
    drop(first);

    // Restarted process: no in-memory state, ledger already holds it.
    let second = oracle_with(chain.clone(), store.clone(), content, 5);
    second.submission_cycle().await;

    assert_eq!(chain.send_count(), 1);
    assert!(store.report("E").map(|r| r.submitted).unwrap_or(false));
    assert_eq!(OracleMetrics::get(&second.metrics.attestations_recovered), 1);
}

#[tokio::test]
async fn mark_retry_within_process_does_not_resend() {
    let o = oracle(vec![report("F", 0xF1, "QmF", false)], 5);
    o.store.fail_next_mark(BackendError::Status {
        status: 502,
        body: "bad gateway".to_string(),
    });

    o.submission_cycle().await;
    let pending = o.tracker.pending_mark("F");
    assert!(pending.is_some());

    o.submission_cycle().await;
    assert_eq!(o.chain.send_count(), 1);
    assert_eq!(o.store.signature("F"), pending);
}

// ════════════════════════════════════════════════════════════════════════════
// INTEGRITY
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn round_trip_digest_verifies() {
    // report_hash as written by the report producer for this document.
    let doc = json!({
        "risk_score": 0.82,
        "contract_name": "Vault",
        "vulnerabilities": [{"type": "reentrancy", "severity": "high"}]
    });
    let mut r = report("G", 0x61, "QmG", false);
    r.report_hash = "fab7b16a3d37a8428ceb1499a65bbd395a07cb2fab08314a4f14a4d3025f13ae".to_string();
    let o = oracle(vec![r], 5);
    o.content.put("QmG", doc);

    o.submission_cycle().await;
    o.integrity_cycle().await;

    assert_eq!(o.tracker.verification("G"), Some(VerificationOutcome::Verified));
    assert!(o.chain.warnings().is_empty());
}

#[tokio::test]
async fn tamper_emits_exactly_one_warning() {
    let doc = json!({"findings": [], "risk_score": 0.9});
    let mut r = report("H", 0x71, "QmH", false);
    r.report_hash = content_digest_hex(&doc);
    let o = oracle(vec![r], 5);
    o.content.put("QmH", doc);

    o.submission_cycle().await;
    o.integrity_cycle().await;
    assert!(o.chain.warnings().is_empty());

    o.content.put("QmH", json!({"findings": [], "risk_score": 0.1}));
    o.integrity_cycle().await;
    o.integrity_cycle().await;

    let warnings = o.chain.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].contract_hash, [0x71; 32]);
    assert!(warnings[0].mismatch);

    // Attestation and flag untouched.
    assert_eq!(o.chain.attestation_count(), 1);
    assert!(o.store.report("H").map(|r| r.submitted).unwrap_or(false));
    assert!(matches!(
        o.tracker.verification("H"),
        Some(VerificationOutcome::Mismatched { .. })
    ));
}

#[tokio::test]
async fn fetch_failure_changes_nothing() {
    let doc = json!({"a": 1});
    let mut r = report("I", 0x81, "QmI", true);
    r.report_hash = content_digest_hex(&doc);
    let o = oracle(vec![r], 5);
    o.content.fail("QmI");

    o.integrity_cycle().await;

    assert!(o.chain.warnings().is_empty());
    assert_eq!(o.tracker.verification("I"), None);
    assert_eq!(OracleMetrics::get(&o.metrics.content_fetch_failures), 1);
}
