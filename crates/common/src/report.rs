//! # Analysis Reports and Attestations
//!
//! [`AnalysisReport`] is the record produced by the external analysis
//! pipeline and listed by the report store. [`Attestation`] is the
//! validated, fixed-width projection of a report that is written to the
//! ledger.
//!
//! ## Validation
//!
//! Converting a report into an attestation is the only place where report
//! fields are interpreted. Any failure is a [`ReportError`] and marks the
//! report as malformed: it is never retried automatically.
//!
//! | Field | Rule |
//! |-------|------|
//! | `contract_hash` | hex, exactly 32 bytes |
//! | `report_hash` | hex, exactly 32 bytes |
//! | `content_id` | non-empty, at most [`MAX_CONTENT_ID_LEN`] bytes |
//! | `risk_score` | finite, in `[0.0, 1.0]` |
//!
//! ## Fixed-Point Risk Score
//!
//! `risk_score_fixed = floor(risk_score * 10000)`, so `0.4567 → 4567` and
//! `1.0 → 10000`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Scale applied to the risk score before it is stored on-chain.
pub const RISK_SCORE_SCALE: u16 = 10_000;

/// Bytes the ledger reserves for the content identifier in an attestation
/// account.
pub const MAX_CONTENT_ID_LEN: usize = 100;

/// Width of every digest handled by the oracle.
pub const HASH_LEN: usize = 32;

// ════════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════════

/// Malformed report input.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReportError {
    /// A hex field did not decode.
    #[error("{field} is not valid hex: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// A hex field decoded to the wrong number of bytes.
    #[error("{field} must be {expected} bytes, found {found}")]
    InvalidHashLength {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// Risk score outside `[0, 1]` or not a finite number.
    #[error("risk score {0} is outside [0, 1]")]
    RiskScoreOutOfRange(f64),

    /// The report has no content identifier.
    #[error("content identifier is empty")]
    EmptyContentId,

    /// The content identifier does not fit the attestation account.
    #[error("content identifier is {found} bytes, limit is {limit}")]
    ContentIdTooLong { found: usize, limit: usize },
}

// ════════════════════════════════════════════════════════════════════════════════
// ANALYSIS REPORT
// ════════════════════════════════════════════════════════════════════════════════

/// A vulnerability-analysis report as listed by the report store.
///
/// Field names follow the store's JSON representation. The oracle reads
/// these records and never mutates them except through the store's
/// mark-submitted call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Opaque identifier. Integer ids from the store are normalized to
    /// their decimal string form.
    #[serde(deserialize_with = "deserialize_report_id")]
    pub id: String,
    /// Hex digest of the analyzed contract.
    pub contract_hash: String,
    /// Hex digest of the report content.
    pub report_hash: String,
    /// Content-address of the report body. May be empty.
    #[serde(rename = "ipfs_cid", default)]
    pub content_id: String,
    /// Risk score in `[0, 1]`.
    pub risk_score: f64,
    /// Authoritative submission flag owned by the store.
    #[serde(rename = "on_chain_submitted", default)]
    pub submitted: bool,
}

impl AnalysisReport {
    /// Returns `true` if the report has a content identifier to attest.
    #[inline]
    pub fn has_content(&self) -> bool {
        !self.content_id.trim().is_empty()
    }

    /// Returns `true` if the report is waiting for its first attestation.
    #[inline]
    pub fn is_pending(&self) -> bool {
        !self.submitted && self.has_content()
    }
}

fn deserialize_report_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    })
}

// ════════════════════════════════════════════════════════════════════════════════
// ATTESTATION
// ════════════════════════════════════════════════════════════════════════════════

/// Validated attestation payload derived from an [`AnalysisReport`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attestation {
    pub contract_hash: [u8; HASH_LEN],
    pub report_hash: [u8; HASH_LEN],
    pub content_id: String,
    /// Risk score scaled by [`RISK_SCORE_SCALE`], in `[0, 10000]`.
    pub risk_score_fixed: u16,
}

impl Attestation {
    /// Validates `report` and builds its attestation payload.
    ///
    /// The `submitted` flag is not inspected; eligibility is the caller's
    /// concern.
    pub fn from_report(report: &AnalysisReport) -> Result<Self, ReportError> {
        let contract_hash = decode_hash32("contract_hash", &report.contract_hash)?;
        let report_hash = decode_hash32("report_hash", &report.report_hash)?;

        let content_id = report.content_id.trim();
        if content_id.is_empty() {
            return Err(ReportError::EmptyContentId);
        }
        if content_id.len() > MAX_CONTENT_ID_LEN {
            return Err(ReportError::ContentIdTooLong {
                found: content_id.len(),
                limit: MAX_CONTENT_ID_LEN,
            });
        }

        Ok(Self {
            contract_hash,
            report_hash,
            content_id: content_id.to_string(),
            risk_score_fixed: risk_score_to_fixed(report.risk_score)?,
        })
    }

    /// Lowercase hex form of `contract_hash`.
    pub fn contract_hash_hex(&self) -> String {
        hex::encode(self.contract_hash)
    }

    /// Lowercase hex form of `report_hash`.
    pub fn report_hash_hex(&self) -> String {
        hex::encode(self.report_hash)
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attestation(contract={}, report={}, cid={}, risk={})",
            self.contract_hash_hex(),
            self.report_hash_hex(),
            self.content_id,
            self.risk_score_fixed
        )
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// FIELD DECODING
// ════════════════════════════════════════════════════════════════════════════════

/// Decodes a hex digest into exactly 32 bytes.
///
/// An optional `0x` prefix and surrounding whitespace are accepted. Upper
/// and lower case digits are both accepted.
pub fn decode_hash32(field: &'static str, value: &str) -> Result<[u8; HASH_LEN], ReportError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let bytes = hex::decode(digits).map_err(|e| ReportError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;

    if bytes.len() != HASH_LEN {
        return Err(ReportError::InvalidHashLength {
            field,
            expected: HASH_LEN,
            found: bytes.len(),
        });
    }

    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Converts a risk score in `[0, 1]` to its fixed-point ledger form.
///
/// Out-of-range and non-finite inputs are rejected rather than clamped.
pub fn risk_score_to_fixed(score: f64) -> Result<u16, ReportError> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(ReportError::RiskScoreOutOfRange(score));
    }
    let scaled = (score * f64::from(RISK_SCORE_SCALE)).floor();
    // score <= 1.0 keeps scaled <= 10000; the min() guards float rounding.
    Ok((scaled as u16).min(RISK_SCORE_SCALE))
}
