//! # SecuRizz Common Crate
//!
//! Pure data model and encoding shared by the oracle and its test doubles.
//! Nothing in this crate performs I/O beyond reading a key file.
//!
//! ## Modules
//! - `report`: `AnalysisReport`, validated `Attestation`, fixed-point risk score
//! - `digest`: canonical JSON and SHA-256 content digest
//! - `instruction`: v1 ledger instruction and transaction encoding
//! - `crypto`: Ed25519 oracle keypair
//!
//! ## Data Flow
//! ```text
//! AnalysisReport ──validate──▶ Attestation ──encode──▶ Instruction bytes
//!                                                        │
//!                                   OracleKeypair ──sign─┴─▶ SignedTransaction
//!
//! report content (JSON) ──canonical_json──▶ SHA-256 ──▶ report_hash (hex)
//! ```

pub mod crypto;
pub mod digest;
pub mod instruction;
pub mod report;

pub use crypto::{verify_signature, CryptoError, OracleKeypair, TransactionSigner};
pub use digest::{canonical_json, content_digest_hex, sha256_hex};
pub use instruction::{
    attestation_address, encode_attestation, encode_integrity_warning, AttestationRecord,
    Instruction, InstructionError, IntegrityWarning, SignedTransaction, INSTRUCTION_VERSION,
};
pub use report::{
    decode_hash32, risk_score_to_fixed, AnalysisReport, Attestation, ReportError, HASH_LEN,
    MAX_CONTENT_ID_LEN, RISK_SCORE_SCALE,
};
