//! # SecuRizz Oracle Crate
//!
//! Reconciliation service between the report store, the ledger and
//! content-addressed storage. It discovers new analysis reports, attests
//! them on-chain, and periodically re-checks that stored report content
//! still matches what was attested.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                              Scheduler                                │
//! │   submission tick (30s)                    integrity tick (300s)      │
//! │          │                                          │                 │
//! │          ▼                                          ▼                 │
//! │  ┌────────────────┐                       ┌───────────────────┐       │
//! │  │ ProofSubmitter │                       │ IntegrityVerifier │       │
//! │  └──┬─────────┬───┘                       └──┬─────────────┬──┘       │
//! │     │         │                              │             │          │
//! │     │   ┌─────▼────────┐                     │             │          │
//! │     │   │ StateTracker │◀────────────────────┘             │          │
//! │     │   └─────┬────────┘                                   │          │
//! │     ▼         ▼                                            ▼          │
//! │ ChainClient  ReportStore                             ContentStore     │
//! │ (ledger)     (backend)                               (gateway)        │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Correctness Model
//!
//! - The store's `submitted` flag is the single source of truth. Every
//!   cycle re-reads it; in-memory state is advisory and safe to lose.
//! - At most one attestation per contract: the submitter checks the
//!   ledger's attestation account before sending, and a confirmed
//!   signature whose store mark failed is re-marked without resending.
//! - An integrity divergence is reported once per `(contract, digest)`
//!   pair and never alters the attestation or the store flag.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`chain_client`] | sign, send, confirm; read attestation accounts |
//! | [`backend_client`] | list reports, mark submitted |
//! | [`content_client`] | fetch content by identifier |
//! | [`state_tracker`] | per-report lifecycle and attempt cap |
//! | [`proof_submitter`] | one report → one confirmed attestation |
//! | [`integrity_verifier`] | re-digest content, emit warnings |
//! | [`scheduler`] | periodic cycles, overlap guard, shutdown |
//! | [`config`] | environment configuration |
//! | [`metrics`] | Prometheus counters |
//! | [`ops`] | operator HTTP endpoint |

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::warn;

pub mod backend_client;
pub mod chain_client;
pub mod config;
pub mod content_client;
pub mod integrity_verifier;
pub mod metrics;
pub mod ops;
pub mod proof_submitter;
pub mod scheduler;
pub mod state_tracker;

pub use backend_client::{BackendError, HttpReportStore, MockReportStore, ReportStore};
pub use chain_client::{
    ChainClient, ChainError, ChainTransport, ConfirmationStatus, JsonRpcChainTransport,
    MockChainTransport, MockFailure,
};
pub use config::{ConfigError, OracleConfig, SigningKeySource};
pub use content_client::{ContentError, ContentStore, HttpContentGateway, MockContentStore};
pub use integrity_verifier::{
    IntegrityCheckResult, IntegrityVerifier, VerifyOutcome, VerifySkipReason,
};
pub use metrics::OracleMetrics;
pub use ops::{build_router, OpsState};
pub use proof_submitter::{ProofSubmitter, SkipReason, SubmitError, SubmitOutcome};
pub use scheduler::{IntegritySummary, Scheduler, SchedulerSettings, SubmissionSummary};
pub use state_tracker::{
    StateTracker, SubmissionState, TrackerSnapshot, VerificationOutcome,
};

/// Current unix time in seconds. A clock before the epoch reads as 0.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Awaits a spawned task and logs a panic or cancellation. Returns `false`
/// when the task did not run to completion.
pub async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "task ended abnormally");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_task_reports_panics() {
        assert!(join_task("ok", tokio::spawn(async {})).await);

        let panicking = tokio::spawn(async { panic!("ops task exploded") });
        assert!(!join_task("ops", panicking).await);
    }

    #[test]
    fn test_unix_now() {
        assert!(unix_now() > 1_600_000_000);
    }
}
