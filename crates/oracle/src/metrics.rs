//! Oracle Metrics Module
//!
//! Lock-free counters for both reconciliation cycles, rendered in the
//! Prometheus text exposition format by the ops endpoint.
//!
//! ## Metrics Tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | submissions_confirmed | counter | Attestations confirmed on the ledger |
//! | submission_failures | counter | Failed send/confirm attempts |
//! | reports_malformed | counter | Reports rejected during validation |
//! | reports_failed | counter | Reports that reached the attempt cap |
//! | attestations_recovered | counter | Sends skipped because the ledger already held the attestation |
//! | mark_failures | counter | Store mark-submitted calls that failed |
//! | integrity_verified | counter | Integrity checks whose digest matched |
//! | integrity_mismatches | counter | Integrity checks whose digest diverged |
//! | content_fetch_failures | counter | Content store fetches that failed |
//! | warnings_emitted | counter | Integrity warning transactions confirmed |
//! | warning_failures | counter | Integrity warning transactions that failed |
//! | submission_ticks / integrity_ticks | counter | Cycles run |
//! | submission_ticks_skipped / integrity_ticks_skipped | counter | Ticks skipped by the overlap guard |
//! | in_flight | gauge | Submissions currently in flight |
//!
//! ## Thread Safety
//!
//! All fields are `AtomicU64`. Increments use `Ordering::Relaxed`, reads
//! in [`OracleMetrics::to_prometheus`] use `Ordering::SeqCst`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

// ════════════════════════════════════════════════════════════════════════════════
// ORACLE METRICS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct OracleMetrics {
    pub submissions_confirmed: AtomicU64,
    pub submission_failures: AtomicU64,
    pub reports_malformed: AtomicU64,
    pub reports_failed: AtomicU64,
    pub attestations_recovered: AtomicU64,
    pub mark_failures: AtomicU64,
    pub integrity_verified: AtomicU64,
    pub integrity_mismatches: AtomicU64,
    pub content_fetch_failures: AtomicU64,
    pub warnings_emitted: AtomicU64,
    pub warning_failures: AtomicU64,
    pub submission_ticks: AtomicU64,
    pub submission_ticks_skipped: AtomicU64,
    pub integrity_ticks: AtomicU64,
    pub integrity_ticks_skipped: AtomicU64,
    pub in_flight: AtomicU64,
}

/// Increments a counter by one.
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OracleMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn in_flight_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    /// Renders every metric in Prometheus text exposition format.
    ///
    /// Output order is fixed, so the same state always renders identically.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let series: [(&str, &str, &str, &AtomicU64); 16] = [
            ("submissions_confirmed_total", "counter", "Attestations confirmed on the ledger", &self.submissions_confirmed),
            ("submission_failures_total", "counter", "Failed send or confirm attempts", &self.submission_failures),
            ("reports_malformed_total", "counter", "Reports rejected during validation", &self.reports_malformed),
            ("reports_failed_total", "counter", "Reports that reached the attempt cap", &self.reports_failed),
            ("attestations_recovered_total", "counter", "Sends skipped because the attestation already existed", &self.attestations_recovered),
            ("mark_failures_total", "counter", "Failed mark-submitted calls", &self.mark_failures),
            ("integrity_verified_total", "counter", "Integrity checks with matching digest", &self.integrity_verified),
            ("integrity_mismatches_total", "counter", "Integrity checks with diverging digest", &self.integrity_mismatches),
            ("content_fetch_failures_total", "counter", "Failed content store fetches", &self.content_fetch_failures),
            ("warnings_emitted_total", "counter", "Integrity warnings confirmed on the ledger", &self.warnings_emitted),
            ("warning_failures_total", "counter", "Integrity warnings that failed to confirm", &self.warning_failures),
            ("submission_ticks_total", "counter", "Submission cycles run", &self.submission_ticks),
            ("submission_ticks_skipped_total", "counter", "Submission ticks skipped while a cycle was running", &self.submission_ticks_skipped),
            ("integrity_ticks_total", "counter", "Integrity cycles run", &self.integrity_ticks),
            ("integrity_ticks_skipped_total", "counter", "Integrity ticks skipped while a cycle was running", &self.integrity_ticks_skipped),
            ("in_flight", "gauge", "Submissions currently in flight", &self.in_flight),
        ];

        let mut out = String::with_capacity(4096);
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP securizz_oracle_{} {}", name, help);
            let _ = writeln!(out, "# TYPE securizz_oracle_{} {}", name, kind);
            let _ = writeln!(out, "securizz_oracle_{} {}", name, value.load(Ordering::SeqCst));
        }
        out
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════════
