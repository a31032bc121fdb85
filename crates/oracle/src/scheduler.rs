//! # Reconciliation Scheduler
//!
//! Drives the two periodic cycles:
//!
//! | Cycle | Default period | Work |
//! |-------|----------------|------|
//! | submission | 30s | list reports, submit each pending one |
//! | integrity | 300s | list reports, verify each submitted one |
//!
//! Each cycle has its own ticker and its own busy flag. A tick that fires
//! while the previous run of the same cycle is still going is skipped and
//! logged; a cycle never runs concurrently with itself. Within one run at
//! most `max_in_flight` reports are processed at a time and a failure on
//! one report never affects the others.
//!
//! ## Shutdown
//!
//! When the shutdown channel flips to `true` (or its sender is dropped) no
//! new ticks are started. A run already in progress gets `shutdown_grace`
//! to finish and is aborted after that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::backend_client::{BackendError, ReportStore};
use crate::integrity_verifier::{IntegrityVerifier, VerifyOutcome};
use crate::metrics::{inc, OracleMetrics};
use crate::proof_submitter::{ProofSubmitter, SubmitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub submission_interval: Duration,
    pub integrity_interval: Duration,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            submission_interval: Duration::from_secs(30),
            integrity_interval: Duration::from_secs(300),
            max_in_flight: 4,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Submission,
    Integrity,
}

/// Counts from one submission run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionSummary {
    pub listed: usize,
    pub submitted: usize,
    pub recovered: usize,
    pub mark_pending: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Counts from one integrity run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegritySummary {
    pub checked: usize,
    pub verified: usize,
    pub mismatched: usize,
    pub warnings_emitted: usize,
    pub skipped: usize,
}

/// Clears the busy flag when the run ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    store: Arc<dyn ReportStore>,
    submitter: Arc<ProofSubmitter>,
    verifier: Arc<IntegrityVerifier>,
    metrics: Arc<OracleMetrics>,
    settings: SchedulerSettings,
    submission_busy: Arc<AtomicBool>,
    integrity_busy: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ReportStore>,
        submitter: Arc<ProofSubmitter>,
        verifier: Arc<IntegrityVerifier>,
        metrics: Arc<OracleMetrics>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            submitter,
            verifier,
            metrics,
            settings,
            submission_busy: Arc::new(AtomicBool::new(false)),
            integrity_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs both cycles until shutdown is signalled, then drains.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            submission_interval_ms = self.settings.submission_interval.as_millis() as u64,
            integrity_interval_ms = self.settings.integrity_interval.as_millis() as u64,
            max_in_flight = self.settings.max_in_flight,
            "scheduler started"
        );
        let submission = tokio::spawn(Arc::clone(&self).cycle_loop(Cycle::Submission, shutdown.clone()));
        let integrity = tokio::spawn(Arc::clone(&self).cycle_loop(Cycle::Integrity, shutdown));

        for (name, handle) in [("submission", submission), ("integrity", integrity)] {
            if let Err(e) = handle.await {
                warn!(cycle = name, error = %e, "cycle loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    async fn cycle_loop(self: Arc<Self>, cycle: Cycle, mut shutdown: watch::Receiver<bool>) {
        let period = match cycle {
            Cycle::Submission => self.settings.submission_interval,
            Cycle::Integrity => self.settings.integrity_interval,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(handle) = Arc::clone(&self).spawn_cycle(cycle) {
                        running = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = running {
            self.drain(cycle, handle).await;
        }
    }

    fn spawn_cycle(self: Arc<Self>, cycle: Cycle) -> Option<JoinHandle<()>> {
        let flag = match cycle {
            Cycle::Submission => &self.submission_busy,
            Cycle::Integrity => &self.integrity_busy,
        };
        let Some(guard) = BusyGuard::acquire(flag) else {
            match cycle {
                Cycle::Submission => inc(&self.metrics.submission_ticks_skipped),
                Cycle::Integrity => inc(&self.metrics.integrity_ticks_skipped),
            }
            warn!(cycle = ?cycle, "previous run still in progress, tick skipped");
            return None;
        };

        Some(tokio::spawn(async move {
            let _guard = guard;
            match cycle {
                Cycle::Submission => {
                    if let Err(e) = self.run_submission_cycle().await {
                        warn!(error = %e, "submission cycle failed to list reports");
                    }
                }
                Cycle::Integrity => {
                    if let Err(e) = self.run_integrity_cycle().await {
                        warn!(error = %e, "integrity cycle failed to list reports");
                    }
                }
            }
        }))
    }

    async fn drain(&self, cycle: Cycle, mut handle: JoinHandle<()>) {
        if handle.is_finished() {
            return;
        }
        info!(cycle = ?cycle, grace_ms = self.settings.shutdown_grace.as_millis() as u64, "waiting for in-flight run");
        if tokio::time::timeout(self.settings.shutdown_grace, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            let _ = handle.await;
            warn!(cycle = ?cycle, "grace period elapsed, in-flight run aborted");
        }
    }

    /// Runs one submission pass unless one is already running.
    pub async fn try_run_submission_cycle(&self) -> Option<Result<SubmissionSummary, BackendError>> {
        let Some(_guard) = BusyGuard::acquire(&self.submission_busy) else {
            inc(&self.metrics.submission_ticks_skipped);
            return None;
        };
        Some(self.run_submission_cycle().await)
    }

    /// Runs one integrity pass unless one is already running.
    pub async fn try_run_integrity_cycle(&self) -> Option<Result<IntegritySummary, BackendError>> {
        let Some(_guard) = BusyGuard::acquire(&self.integrity_busy) else {
            inc(&self.metrics.integrity_ticks_skipped);
            return None;
        };
        Some(self.run_integrity_cycle().await)
    }

    async fn run_submission_cycle(&self) -> Result<SubmissionSummary, BackendError> {
        inc(&self.metrics.submission_ticks);
        let reports = self.store.list_reports().await?;
        self.submitter.tracker().retain_listed(&reports);
        let mut summary = SubmissionSummary {
            listed: reports.len(),
            ..Default::default()
        };

        let submitter = &self.submitter;
        let outcomes: Vec<SubmitOutcome> = stream::iter(reports.into_iter().filter(|r| r.is_pending()))
            .map(|report| async move { submitter.submit(&report).await })
            .buffer_unordered(self.settings.max_in_flight.max(1))
            .collect()
            .await;

        summary.skipped = summary.listed - outcomes.len();
        for outcome in outcomes {
            match outcome {
                SubmitOutcome::Submitted { .. } => summary.submitted += 1,
                SubmitOutcome::Recovered { .. } => summary.recovered += 1,
                SubmitOutcome::MarkPending { .. } => summary.mark_pending += 1,
                SubmitOutcome::Retrying { .. } => summary.retrying += 1,
                SubmitOutcome::Failed { .. } => summary.failed += 1,
                SubmitOutcome::Skipped(_) => summary.skipped += 1,
            }
        }

        info!(
            listed = summary.listed,
            submitted = summary.submitted,
            recovered = summary.recovered,
            retrying = summary.retrying,
            failed = summary.failed,
            "submission cycle complete"
        );
        Ok(summary)
    }

    async fn run_integrity_cycle(&self) -> Result<IntegritySummary, BackendError> {
        inc(&self.metrics.integrity_ticks);
        let reports = self.store.list_reports().await?;
        self.verifier.retain_listed(&reports);

        let verifier = &self.verifier;
        let outcomes: Vec<VerifyOutcome> = stream::iter(reports.into_iter().filter(|r| r.submitted))
            .map(|report| async move { verifier.verify(&report).await })
            .buffer_unordered(self.settings.max_in_flight.max(1))
            .collect()
            .await;

        let mut summary = IntegritySummary {
            checked: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                VerifyOutcome::Verified(_) => summary.verified += 1,
                VerifyOutcome::Mismatched { warning, .. } => {
                    summary.mismatched += 1;
                    if warning.is_some() {
                        summary.warnings_emitted += 1;
                    }
                }
                VerifyOutcome::Skipped(_) => summary.skipped += 1,
            }
        }

        info!(
            checked = summary.checked,
            verified = summary.verified,
            mismatched = summary.mismatched,
            skipped = summary.skipped,
            "integrity cycle complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use securizz_common::{AnalysisReport, OracleKeypair};
    use tokio::sync::Notify;

    use crate::backend_client::MockReportStore;
    use crate::chain_client::{ChainClient, MockChainTransport};
    use crate::content_client::MockContentStore;
    use crate::state_tracker::StateTracker;

    fn report(id: &str, contract: u8) -> AnalysisReport {
        AnalysisReport {
            id: id.to_string(),
            contract_hash: hex::encode([contract; 32]),
            report_hash: "bb".repeat(32),
            content_id: format!("Qm{}", id),
            risk_score: 0.3,
            submitted: false,
        }
    }

    fn scheduler(store: Arc<dyn ReportStore>, settings: SchedulerSettings) -> (Arc<MockChainTransport>, Arc<OracleMetrics>, Arc<Scheduler>) {
        let chain = Arc::new(MockChainTransport::new());
        let metrics = Arc::new(OracleMetrics::new());
        let client = Arc::new(
            ChainClient::new(chain.clone(), Arc::new(OracleKeypair::from_seed([6u8; 32])), "SecuRizz")
                .with_timeouts(Duration::from_secs(5), Duration::from_millis(50)),
        );
        let tracker = Arc::new(StateTracker::new(store.clone(), 5));
        let submitter = Arc::new(ProofSubmitter::new(client.clone(), tracker.clone(), metrics.clone()));
        let verifier = Arc::new(IntegrityVerifier::new(
            client,
            Arc::new(MockContentStore::new()),
            tracker,
            metrics.clone(),
        ));
        let sched = Arc::new(Scheduler::new(store, submitter, verifier, metrics.clone(), settings));
        (chain, metrics, sched)
    }

    /// Store whose `list_reports` blocks until released.
    struct GatedStore {
        inner: MockReportStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReportStore for GatedStore {
        async fn list_reports(&self) -> Result<Vec<AnalysisReport>, BackendError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.list_reports().await
        }

        async fn mark_submitted(&self, id: &str, sig: &str) -> Result<(), BackendError> {
            self.inner.mark_submitted(id, sig).await
        }
    }

    #[tokio::test]
    async fn submission_cycle_counts_outcomes() {
        let mut done = report("3", 3);
        done.submitted = true;
        let store = Arc::new(MockReportStore::new(vec![report("1", 1), report("2", 2), done]));
        let (chain, _, sched) = scheduler(store.clone(), SchedulerSettings::default());

        let summary = sched
            .try_run_submission_cycle()
            .await
            .unwrap_or_else(|| panic!("guard busy"))
            .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(summary.listed, 3);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(chain.attestation_count(), 2);
    }

    #[tokio::test]
    async fn list_failure_is_reported() {
        let store = Arc::new(MockReportStore::new(vec![report("1", 1)]));
        store.fail_next_list(BackendError::Timeout);
        let (_, _, sched) = scheduler(store, SchedulerSettings::default());
        assert_eq!(
            sched.try_run_submission_cycle().await,
            Some(Err(BackendError::Timeout))
        );
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped() {
        let store = Arc::new(GatedStore {
            inner: MockReportStore::new(vec![report("1", 1)]),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (_, metrics, sched) = scheduler(store.clone(), SchedulerSettings::default());

        let first = {
            let sched = Arc::clone(&sched);
            tokio::spawn(async move { sched.try_run_submission_cycle().await })
        };
        store.entered.notified().await;

        assert!(sched.try_run_submission_cycle().await.is_none());
        assert_eq!(OracleMetrics::get(&metrics.submission_ticks_skipped), 1);

        store.release.notify_one();
        let res = first.await.unwrap_or_else(|e| panic!("{}", e));
        assert!(matches!(res, Some(Ok(ref s)) if s.submitted == 1));

        // Flag is cleared once the run ends.
        store.release.notify_one();
        assert!(matches!(sched.try_run_submission_cycle().await, Some(Ok(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MockReportStore::new(vec![report("1", 1)]));
        let settings = SchedulerSettings {
            submission_interval: Duration::from_secs(1),
            integrity_interval: Duration::from_secs(5),
            max_in_flight: 2,
            shutdown_grace: Duration::from_secs(1),
        };
        let (chain, metrics, sched) = scheduler(store, settings);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&sched).run(rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let _ = tx.send(true);
        handle.await.unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(chain.attestation_count(), 1);
        assert!(OracleMetrics::get(&metrics.submission_ticks) >= 2);
    }

    /// Store whose listing never completes.
    struct StuckStore;

    #[async_trait]
    impl ReportStore for StuckStore {
        async fn list_reports(&self) -> Result<Vec<AnalysisReport>, BackendError> {
            futures::future::pending().await
        }

        async fn mark_submitted(&self, _id: &str, _sig: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_run_is_aborted_after_grace() {
        let settings = SchedulerSettings {
            submission_interval: Duration::from_secs(1),
            integrity_interval: Duration::from_secs(1),
            max_in_flight: 1,
            shutdown_grace: Duration::from_secs(3),
        };
        let (_, _, sched) = scheduler(Arc::new(StuckStore), settings);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&sched).run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sched.submission_busy.load(Ordering::Acquire));
        assert!(sched.integrity_busy.load(Ordering::Acquire));

        let started = tokio::time::Instant::now();
        let _ = tx.send(true);
        handle.await.unwrap_or_else(|e| panic!("{}", e));
        let waited = started.elapsed();

        assert!(waited >= Duration::from_secs(3), "stopped after {:?}", waited);
        assert!(waited < Duration::from_secs(4), "stopped after {:?}", waited);
        assert!(!sched.submission_busy.load(Ordering::Acquire));
        assert!(!sched.integrity_busy.load(Ordering::Acquire));
    }
}
