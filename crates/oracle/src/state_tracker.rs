//! # Submission State Tracker
//!
//! Maps each report to its submission lifecycle state and owns the
//! idempotency contract with the report store.
//!
//! ## State Machine
//!
//! ```text
//!                 begin_submission
//! ┌─────────┐ ─────────────────────▶ ┌────────────┐
//! │ Pending │                        │ Submitting │
//! │         │ ◀───────────────────── │            │
//! └─────────┘   record_failure       └─────┬──────┘
//!      ▲        (attempts < cap)           │
//!      │                                   ├── record_submitted ──▶ Submitted
//!      │ reset (operator)                  │
//!      │                                   └── record_failure (cap) ──▶ Failed
//! ┌────┴────┐                                  record_malformed ──▶ Failed
//! │ Failed  │ ◀────────────────────────────────────────────────────────┘
//! └─────────┘
//! ```
//!
//! ## Source of Truth
//!
//! The store's `submitted` flag is authoritative. [`StateTracker::current_state`]
//! always answers `Submitted` for a report whose freshly read flag is set,
//! whatever the in-memory bookkeeping says. The in-memory map is advisory:
//! it only carries attempt counters, the in-flight claim, the `Failed`
//! marker and signatures confirmed on the ledger but not yet acknowledged
//! by the store. Losing it on restart is safe. Entries for reports the
//! store no longer lists are dropped by [`StateTracker::retain_listed`], so
//! the map holds at most one entry per listed report.
//!
//! ## Thread Safety
//!
//! All state lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use securizz_common::AnalysisReport;

use crate::backend_client::{BackendError, ReportStore};

/// Default number of failed attempts after which a report is `Failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ════════════════════════════════════════════════════════════════════════════════
// STATES
// ════════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    /// Waiting for (another) attempt.
    Pending { attempts: u32 },
    /// Claimed by an in-flight submission.
    Submitting,
    /// Durably submitted. The signature is known only when this process
    /// confirmed the transaction.
    Submitted { signature: Option<String> },
    /// No further automatic attempts until an operator reset.
    Failed { reason: String, attempts: u32 },
}

impl SubmissionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Result of the last integrity check of a submitted report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified,
    Mismatched { actual_hash: String },
}

#[derive(Debug, Clone, Default)]
struct Entry {
    attempts: u32,
    in_flight: bool,
    failed: Option<String>,
    confirmed_signature: Option<String>,
    marked: bool,
    verification: Option<VerificationOutcome>,
}

/// Serializable view of one tracked report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub report_id: String,
    pub attempts: u32,
    pub submitting: bool,
    pub failed_reason: Option<String>,
    pub signature: Option<String>,
    pub marked: bool,
    pub verification: Option<VerificationOutcome>,
}

/// Serializable view of the whole tracker, sorted by report id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub max_attempts: u32,
    pub entries: Vec<EntrySnapshot>,
}

// ════════════════════════════════════════════════════════════════════════════════
// TRACKER
// ════════════════════════════════════════════════════════════════════════════════

pub struct StateTracker {
    store: Arc<dyn ReportStore>,
    max_attempts: u32,
    entries: Mutex<HashMap<String, Entry>>,
}

impl StateTracker {
    /// Creates a tracker. A cap of 0 is treated as 1.
    pub fn new(store: Arc<dyn ReportStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Derives the state of `report` from its freshly read flag plus the
    /// in-memory bookkeeping.
    pub fn current_state(&self, report: &AnalysisReport) -> SubmissionState {
        let entries = self.entries.lock();
        let entry = entries.get(&report.id);

        if report.submitted {
            return SubmissionState::Submitted {
                signature: entry.and_then(|e| e.confirmed_signature.clone()),
            };
        }
        match entry {
            None => SubmissionState::Pending { attempts: 0 },
            Some(e) => {
                if let Some(reason) = &e.failed {
                    SubmissionState::Failed {
                        reason: reason.clone(),
                        attempts: e.attempts,
                    }
                } else if e.in_flight {
                    SubmissionState::Submitting
                } else {
                    SubmissionState::Pending {
                        attempts: e.attempts,
                    }
                }
            }
        }
    }

    /// Claims `report_id` for submission.
    ///
    /// Returns `false` when the report is already `Submitting` or `Failed`
    /// in this process.
    pub fn begin_submission(&self, report_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(report_id.to_string()).or_default();
        if entry.in_flight || entry.failed.is_some() {
            return false;
        }
        entry.in_flight = true;
        true
    }

    /// Counts a failed attempt. Returns `Failed` once the cap is reached,
    /// `Pending` otherwise.
    pub fn record_failure(&self, report_id: &str, reason: &str) -> SubmissionState {
        let mut entries = self.entries.lock();
        let entry = entries.entry(report_id.to_string()).or_default();
        entry.in_flight = false;
        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts >= self.max_attempts {
            entry.failed = Some(reason.to_string());
            SubmissionState::Failed {
                reason: reason.to_string(),
                attempts: entry.attempts,
            }
        } else {
            SubmissionState::Pending {
                attempts: entry.attempts,
            }
        }
    }

    /// Marks a report whose fields cannot be attested. Never retried
    /// automatically.
    pub fn record_malformed(&self, report_id: &str, reason: &str) -> SubmissionState {
        let mut entries = self.entries.lock();
        let entry = entries.entry(report_id.to_string()).or_default();
        entry.in_flight = false;
        entry.failed = Some(reason.to_string());
        SubmissionState::Failed {
            reason: reason.to_string(),
            attempts: entry.attempts,
        }
    }

    /// Records a confirmed attestation and sets the store flag.
    ///
    /// The signature is remembered before the store is called, so a store
    /// failure leaves the report waiting for [`pending_mark`](Self::pending_mark)
    /// instead of a second transaction. Repeated calls are harmless.
    pub async fn record_submitted(
        &self,
        report_id: &str,
        signature: &str,
    ) -> Result<(), BackendError> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(report_id.to_string()).or_default();
            entry.in_flight = false;
            entry.failed = None;
            if entry.confirmed_signature.is_none() {
                entry.confirmed_signature = Some(signature.to_string());
            }
        }

        self.store.mark_submitted(report_id, signature).await?;

        if let Some(e) = self.entries.lock().get_mut(report_id) {
            e.marked = true;
            e.attempts = 0;
        }
        info!(report_id = %report_id, signature = %signature, "report marked submitted");
        Ok(())
    }

    /// Signature confirmed on the ledger but not yet acknowledged by the
    /// store.
    pub fn pending_mark(&self, report_id: &str) -> Option<String> {
        self.entries
            .lock()
            .get(report_id)
            .filter(|e| !e.marked)
            .and_then(|e| e.confirmed_signature.clone())
    }

    /// Operator reset of a `Failed` report. Returns `false` if the report
    /// was not `Failed`.
    pub fn reset(&self, report_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(report_id) {
            Some(e) if e.failed.is_some() => {
                e.failed = None;
                e.attempts = 0;
                debug!(report_id = %report_id, "failed report reset");
                true
            }
            _ => false,
        }
    }

    pub fn record_verification(&self, report_id: &str, outcome: VerificationOutcome) {
        self.entries
            .lock()
            .entry(report_id.to_string())
            .or_default()
            .verification = Some(outcome);
    }

    pub fn verification(&self, report_id: &str) -> Option<VerificationOutcome> {
        self.entries
            .lock()
            .get(report_id)
            .and_then(|e| e.verification.clone())
    }

    /// Drops bookkeeping for reports absent from `listed`. Claimed entries
    /// are kept until their submission finishes.
    pub fn retain_listed(&self, listed: &[AnalysisReport]) {
        let ids: HashSet<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|id, e| e.in_flight || ids.contains(id.as_str()));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, "pruned entries for unlisted reports");
        }
    }

    pub fn failed_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.failed.is_some())
            .count()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let entries = self.entries.lock();
        let mut out: Vec<EntrySnapshot> = entries
            .iter()
            .map(|(id, e)| EntrySnapshot {
                report_id: id.clone(),
                attempts: e.attempts,
                submitting: e.in_flight,
                failed_reason: e.failed.clone(),
                signature: e.confirmed_signature.clone(),
                marked: e.marked,
                verification: e.verification.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.report_id.cmp(&b.report_id));
        TrackerSnapshot {
            max_attempts: self.max_attempts,
            entries: out,
        }
    }
}
