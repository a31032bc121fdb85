//! # Integrity Verifier
//!
//! Re-fetches the content of submitted reports, recomputes the canonical
//! digest and compares it with the attested hash.
//!
//! ## Expected Hash
//!
//! The attestation account on the ledger is authoritative. The report's own
//! `report_hash` is used only when the ledger has no record (or cannot be
//! read this cycle).
//!
//! ## Warnings
//!
//! A divergence emits one integrity-warning transaction. The pair
//! `(contract_hash, actual_hash)` is remembered once the warning confirms,
//! so repeated cycles over the same tampered content stay silent. A warning
//! that fails to confirm is retried on the next cycle. The attestation and
//! the report's `submitted` flag are never touched. Pairs whose contract is
//! no longer listed as submitted are forgotten by
//! [`IntegrityVerifier::retain_listed`].

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use securizz_common::{content_digest_hex, decode_hash32, AnalysisReport, IntegrityWarning};

use crate::chain_client::ChainClient;
use crate::content_client::ContentStore;
use crate::metrics::{inc, OracleMetrics};
use crate::state_tracker::{StateTracker, VerificationOutcome};
use crate::unix_now;

/// Outcome of comparing one report's content with its attested hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityCheckResult {
    pub contract_hash: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub matched: bool,
    pub checked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifySkipReason {
    NotSubmitted,
    NoContent,
    Malformed(String),
    FetchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified(IntegrityCheckResult),
    /// `warning` carries the signature of a warning confirmed during this
    /// call; `None` when it was already emitted earlier or failed to send.
    Mismatched {
        result: IntegrityCheckResult,
        warning: Option<String>,
    },
    Skipped(VerifySkipReason),
}

pub struct IntegrityVerifier {
    chain: Arc<ChainClient>,
    content: Arc<dyn ContentStore>,
    tracker: Arc<StateTracker>,
    metrics: Arc<OracleMetrics>,
    warned: Mutex<HashSet<(String, String)>>,
}

impl IntegrityVerifier {
    pub fn new(
        chain: Arc<ChainClient>,
        content: Arc<dyn ContentStore>,
        tracker: Arc<StateTracker>,
        metrics: Arc<OracleMetrics>,
    ) -> Self {
        Self {
            chain,
            content,
            tracker,
            metrics,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub async fn verify(&self, report: &AnalysisReport) -> VerifyOutcome {
        if !report.submitted {
            return VerifyOutcome::Skipped(VerifySkipReason::NotSubmitted);
        }
        if !report.has_content() {
            return VerifyOutcome::Skipped(VerifySkipReason::NoContent);
        }

        let contract_hash = match decode_hash32("contract_hash", &report.contract_hash) {
            Ok(h) => h,
            Err(e) => {
                warn!(report_id = %report.id, error = %e, "cannot verify report");
                return VerifyOutcome::Skipped(VerifySkipReason::Malformed(e.to_string()));
            }
        };

        let expected_hash = match self.expected_hash(report, &contract_hash).await {
            Ok(h) => h,
            Err(reason) => {
                warn!(report_id = %report.id, error = %reason, "cannot verify report");
                return VerifyOutcome::Skipped(VerifySkipReason::Malformed(reason));
            }
        };

        let content = match self.content.fetch(report.content_id.trim()).await {
            Ok(v) => v,
            Err(e) => {
                inc(&self.metrics.content_fetch_failures);
                warn!(
                    report_id = %report.id,
                    content_id = %report.content_id,
                    error = %e,
                    "content fetch failed, skipping this cycle"
                );
                return VerifyOutcome::Skipped(VerifySkipReason::FetchFailed(e.to_string()));
            }
        };

        let actual_hash = content_digest_hex(&content);
        let result = IntegrityCheckResult {
            contract_hash: hex::encode(contract_hash),
            matched: actual_hash == expected_hash,
            expected_hash,
            actual_hash,
            checked_at: unix_now(),
        };

        if result.matched {
            inc(&self.metrics.integrity_verified);
            info!(report_id = %report.id, contract_hash = %result.contract_hash, "verified");
            self.tracker
                .record_verification(&report.id, VerificationOutcome::Verified);
            return VerifyOutcome::Verified(result);
        }

        inc(&self.metrics.integrity_mismatches);
        warn!(
            report_id = %report.id,
            contract_hash = %result.contract_hash,
            expected = %result.expected_hash,
            actual = %result.actual_hash,
            "integrity mismatch"
        );
        self.tracker.record_verification(
            &report.id,
            VerificationOutcome::Mismatched {
                actual_hash: result.actual_hash.clone(),
            },
        );

        let warning = self.emit_once(&report.id, contract_hash, &result).await;
        VerifyOutcome::Mismatched { result, warning }
    }

    /// Forgets emitted warnings for contracts absent from the submitted
    /// reports in `listed`.
    pub fn retain_listed(&self, listed: &[AnalysisReport]) {
        let contracts: HashSet<String> = listed
            .iter()
            .filter(|r| r.submitted)
            .filter_map(|r| decode_hash32("contract_hash", &r.contract_hash).ok())
            .map(hex::encode)
            .collect();
        self.warned
            .lock()
            .retain(|(contract, _)| contracts.contains(contract));
    }

    async fn expected_hash(
        &self,
        report: &AnalysisReport,
        contract_hash: &[u8; 32],
    ) -> Result<String, String> {
        match self.chain.find_attestation(contract_hash).await {
            Ok(Some(record)) => return Ok(record.report_hash.trim().to_ascii_lowercase()),
            Ok(None) => {}
            Err(e) => {
                debug!(report_id = %report.id, error = %e, "attestation lookup failed, using report hash");
            }
        }
        decode_hash32("report_hash", &report.report_hash)
            .map(hex::encode)
            .map_err(|e| e.to_string())
    }

    async fn emit_once(
        &self,
        report_id: &str,
        contract_hash: [u8; 32],
        result: &IntegrityCheckResult,
    ) -> Option<String> {
        let key = (result.contract_hash.clone(), result.actual_hash.clone());
        if self.warned.lock().contains(&key) {
            debug!(report_id = %report_id, "warning already emitted for this divergence");
            return None;
        }

        let warning = IntegrityWarning {
            contract_hash,
            mismatch: true,
            detected_at: result.checked_at,
        };
        match self.chain.emit_integrity_warning(&warning).await {
            Ok(signature) => {
                self.warned.lock().insert(key);
                inc(&self.metrics.warnings_emitted);
                warn!(
                    report_id = %report_id,
                    contract_hash = %result.contract_hash,
                    signature = %signature,
                    "integrity warning emitted"
                );
                Some(signature)
            }
            Err(e) => {
                inc(&self.metrics.warning_failures);
                warn!(report_id = %report_id, error = %e, "integrity warning failed, will retry");
                None
            }
        }
    }
}
