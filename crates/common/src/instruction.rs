//! # Ledger Instruction Encoding (v1)
//!
//! CANONICAL byte layouts for the two instructions the oracle sends to the
//! attestation program, and for the signed transaction envelope that
//! carries them. The ledger program decodes exactly these layouts; any
//! change requires a new version byte.
//!
//! ## Integer Encoding
//!
//! All integers are encoded **big-endian**.
//!
//! ## Attestation Instruction
//!
//! | Offset | Field | Size | Encoding |
//! |--------|-------|------|----------|
//! | 0 | discriminator | 1 | `0x01` |
//! | 1 | version | 1 | `0x01` |
//! | 2 | `contract_hash` | 32 | raw bytes |
//! | 34 | `report_hash` | 32 | raw bytes |
//! | 66 | `content_id` length | 2 | u16 |
//! | 68 | `content_id` | n ≤ 100 | UTF-8 |
//! | 68+n | `risk_score_fixed` | 2 | u16, ≤ 10000 |
//!
//! ## Integrity Warning Instruction
//!
//! | Offset | Field | Size | Encoding |
//! |--------|-------|------|----------|
//! | 0 | discriminator | 1 | `0x02` |
//! | 1 | version | 1 | `0x01` |
//! | 2 | `contract_hash` | 32 | raw bytes |
//! | 34 | `mismatch` | 1 | `0x00` / `0x01` |
//! | 35 | `detected_at` | 8 | i64 unix seconds |
//!
//! ## Transaction Envelope
//!
//! | Field | Size | Encoding |
//! |-------|------|----------|
//! | magic | 4 | `"SRZ1"` |
//! | program id length | 1 | u8 |
//! | program id | m | UTF-8 |
//! | signer public key | 32 | raw bytes |
//! | instruction length | 4 | u32 |
//! | instruction | k | bytes above |
//! | signature | 64 | Ed25519 over every preceding byte |
//!
//! ## Attestation Account
//!
//! One account per contract, addressed by
//! `SHA-256("audit_proof" || program_id || contract_hash)`. A second
//! attestation for the same contract is refused by the ledger.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{verify_signature, TransactionSigner};
use crate::digest::sha256;
use crate::report::{Attestation, HASH_LEN, MAX_CONTENT_ID_LEN, RISK_SCORE_SCALE};

/// Current instruction layout version.
pub const INSTRUCTION_VERSION: u8 = 1;
/// Discriminator of the attestation instruction.
pub const ATTESTATION_DISCRIMINATOR: u8 = 0x01;
/// Discriminator of the integrity warning instruction.
pub const INTEGRITY_WARNING_DISCRIMINATOR: u8 = 0x02;
/// Transaction envelope magic.
pub const TX_MAGIC: [u8; 4] = *b"SRZ1";
/// Seed prefix of attestation account addresses.
pub const ATTESTATION_SEED: &[u8] = b"audit_proof";

const MAX_PROGRAM_ID_LEN: usize = u8::MAX as usize;

// ════════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════════

/// Failure to encode or decode an instruction or transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstructionError {
    #[error("buffer too short: need {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("unknown instruction discriminator {0:#04x}")]
    UnknownDiscriminator(u8),

    #[error("unsupported instruction version {0}")]
    UnsupportedVersion(u8),

    #[error("{0} trailing bytes after instruction")]
    TrailingBytes(usize),

    #[error("content identifier of {0} bytes exceeds limit")]
    ContentIdTooLong(usize),

    #[error("content identifier is not UTF-8")]
    ContentIdEncoding,

    #[error("risk score {0} exceeds scale")]
    RiskScoreOutOfRange(u16),

    #[error("invalid mismatch flag {0}")]
    InvalidFlag(u8),

    #[error("program id of {0} bytes is invalid")]
    InvalidProgramId(usize),

    #[error("bad transaction magic")]
    BadMagic,

    #[error("transaction signature does not verify")]
    BadSignature,
}

// ════════════════════════════════════════════════════════════════════════════════
// INSTRUCTIONS
// ════════════════════════════════════════════════════════════════════════════════

/// Payload of an integrity warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityWarning {
    pub contract_hash: [u8; HASH_LEN],
    pub mismatch: bool,
    /// Unix seconds at detection time.
    pub detected_at: i64,
}

/// Decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    SubmitAttestation(Attestation),
    IntegrityWarning(IntegrityWarning),
}

impl Instruction {
    /// Encodes the instruction with the v1 layout.
    pub fn encode(&self) -> Result<Vec<u8>, InstructionError> {
        match self {
            Self::SubmitAttestation(att) => encode_attestation(att),
            Self::IntegrityWarning(w) => Ok(encode_integrity_warning(w)),
        }
    }

    /// Decodes a v1 instruction. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, InstructionError> {
        let mut r = Reader::new(bytes);
        let discriminator = r.u8()?;
        let version = r.u8()?;
        if version != INSTRUCTION_VERSION {
            return Err(InstructionError::UnsupportedVersion(version));
        }

        let instruction = match discriminator {
            ATTESTATION_DISCRIMINATOR => {
                let contract_hash = r.array32()?;
                let report_hash = r.array32()?;
                let cid_len = usize::from(r.u16()?);
                if cid_len > MAX_CONTENT_ID_LEN {
                    return Err(InstructionError::ContentIdTooLong(cid_len));
                }
                let content_id = String::from_utf8(r.take(cid_len)?.to_vec())
                    .map_err(|_| InstructionError::ContentIdEncoding)?;
                let risk_score_fixed = r.u16()?;
                if risk_score_fixed > RISK_SCORE_SCALE {
                    return Err(InstructionError::RiskScoreOutOfRange(risk_score_fixed));
                }
                Self::SubmitAttestation(Attestation {
                    contract_hash,
                    report_hash,
                    content_id,
                    risk_score_fixed,
                })
            }
            INTEGRITY_WARNING_DISCRIMINATOR => {
                let contract_hash = r.array32()?;
                let mismatch = match r.u8()? {
                    0 => false,
                    1 => true,
                    other => return Err(InstructionError::InvalidFlag(other)),
                };
                let detected_at = i64::from_be_bytes(r.array8()?);
                Self::IntegrityWarning(IntegrityWarning {
                    contract_hash,
                    mismatch,
                    detected_at,
                })
            }
            other => return Err(InstructionError::UnknownDiscriminator(other)),
        };

        r.finish()?;
        Ok(instruction)
    }
}

/// Encodes an attestation instruction (v1).
pub fn encode_attestation(att: &Attestation) -> Result<Vec<u8>, InstructionError> {
    let cid = att.content_id.as_bytes();
    if cid.len() > MAX_CONTENT_ID_LEN {
        return Err(InstructionError::ContentIdTooLong(cid.len()));
    }
    if att.risk_score_fixed > RISK_SCORE_SCALE {
        return Err(InstructionError::RiskScoreOutOfRange(att.risk_score_fixed));
    }

    let mut out = Vec::with_capacity(2 + 2 * HASH_LEN + 2 + cid.len() + 2);
    out.push(ATTESTATION_DISCRIMINATOR);
    out.push(INSTRUCTION_VERSION);
    out.extend_from_slice(&att.contract_hash);
    out.extend_from_slice(&att.report_hash);
    // cid.len() <= 100, fits u16.
    out.extend_from_slice(&(cid.len() as u16).to_be_bytes());
    out.extend_from_slice(cid);
    out.extend_from_slice(&att.risk_score_fixed.to_be_bytes());
    Ok(out)
}

/// Encodes an integrity warning instruction (v1).
pub fn encode_integrity_warning(w: &IntegrityWarning) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + HASH_LEN + 1 + 8);
    out.push(INTEGRITY_WARNING_DISCRIMINATOR);
    out.push(INSTRUCTION_VERSION);
    out.extend_from_slice(&w.contract_hash);
    out.push(u8::from(w.mismatch));
    out.extend_from_slice(&w.detected_at.to_be_bytes());
    out
}

/// Address of the attestation account for `contract_hash`.
pub fn attestation_address(program_id: &str, contract_hash: &[u8; HASH_LEN]) -> [u8; 32] {
    let mut seed = Vec::with_capacity(ATTESTATION_SEED.len() + program_id.len() + HASH_LEN);
    seed.extend_from_slice(ATTESTATION_SEED);
    seed.extend_from_slice(program_id.as_bytes());
    seed.extend_from_slice(contract_hash);
    sha256(&seed)
}

// ════════════════════════════════════════════════════════════════════════════════
// TRANSACTION ENVELOPE
// ════════════════════════════════════════════════════════════════════════════════

/// A signed transaction carrying one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub program_id: String,
    pub signer: [u8; 32],
    pub instruction: Vec<u8>,
    pub signature: [u8; 64],
}

impl SignedTransaction {
    /// Encodes `instruction` and signs the envelope with `signer`.
    pub fn sign(
        program_id: &str,
        instruction: &Instruction,
        signer: &dyn TransactionSigner,
    ) -> Result<Self, InstructionError> {
        let instruction = instruction.encode()?;
        let public_key = signer.public_key();
        let message = signing_message(program_id, &public_key, &instruction)?;
        Ok(Self {
            program_id: program_id.to_string(),
            signer: public_key,
            instruction,
            signature: signer.sign(&message),
        })
    }

    /// Serialized envelope bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, InstructionError> {
        let mut out = signing_message(&self.program_id, &self.signer, &self.instruction)?;
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    /// Parses and verifies an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InstructionError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != TX_MAGIC {
            return Err(InstructionError::BadMagic);
        }
        let program_len = usize::from(r.u8()?);
        if program_len == 0 {
            return Err(InstructionError::InvalidProgramId(0));
        }
        let program_id = String::from_utf8(r.take(program_len)?.to_vec())
            .map_err(|_| InstructionError::InvalidProgramId(program_len))?;
        let signer = r.array32()?;
        let ix_len = r.u32()? as usize;
        let instruction = r.take(ix_len)?.to_vec();
        let mut signature = [0u8; 64];
        signature.copy_from_slice(r.take(64)?);
        r.finish()?;

        let tx = Self {
            program_id,
            signer,
            instruction,
            signature,
        };
        if !tx.verify()? {
            return Err(InstructionError::BadSignature);
        }
        Ok(tx)
    }

    /// Checks the envelope signature.
    pub fn verify(&self) -> Result<bool, InstructionError> {
        let message = signing_message(&self.program_id, &self.signer, &self.instruction)?;
        Ok(verify_signature(&self.signer, &message, &self.signature).unwrap_or(false))
    }

    /// Decodes the carried instruction.
    pub fn decode_instruction(&self) -> Result<Instruction, InstructionError> {
        Instruction::decode(&self.instruction)
    }

    /// Lowercase hex of the signature, used as the transaction id.
    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature)
    }
}

fn signing_message(
    program_id: &str,
    signer: &[u8; 32],
    instruction: &[u8],
) -> Result<Vec<u8>, InstructionError> {
    let program = program_id.as_bytes();
    if program.is_empty() || program.len() > MAX_PROGRAM_ID_LEN {
        return Err(InstructionError::InvalidProgramId(program.len()));
    }
    let mut out = Vec::with_capacity(4 + 1 + program.len() + 32 + 4 + instruction.len() + 64);
    out.extend_from_slice(&TX_MAGIC);
    out.push(program.len() as u8);
    out.extend_from_slice(program);
    out.extend_from_slice(signer);
    out.extend_from_slice(&(instruction.len() as u32).to_be_bytes());
    out.extend_from_slice(instruction);
    Ok(out)
}

// ════════════════════════════════════════════════════════════════════════════════
// ON-CHAIN RECORD
// ════════════════════════════════════════════════════════════════════════════════

/// Attestation account contents as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Hex digest of the contract.
    pub contract_hash: String,
    /// Hex digest that was attested.
    pub report_hash: String,
    pub content_id: String,
    pub risk_score_fixed: u16,
    /// Transaction signature that created the account.
    pub submitter_signature: String,
    /// Hex public key of the oracle that submitted it.
    pub oracle: String,
    /// Ledger time of the attestation, unix seconds.
    pub timestamp: i64,
}

impl AttestationRecord {
    /// Builds the record the ledger stores for a confirmed attestation.
    pub fn from_attestation(
        att: &Attestation,
        signature: &str,
        oracle: &[u8; 32],
        timestamp: i64,
    ) -> Self {
        Self {
            contract_hash: att.contract_hash_hex(),
            report_hash: att.report_hash_hex(),
            content_id: att.content_id.clone(),
            risk_score_fixed: att.risk_score_fixed,
            submitter_signature: signature.to_string(),
            oracle: hex::encode(oracle),
            timestamp,
        }
    }

    /// Returns `true` if this record attests `report_hash` (hex, any case).
    pub fn attests(&self, report_hash: &[u8; HASH_LEN]) -> bool {
        self.report_hash.trim().eq_ignore_ascii_case(&hex::encode(report_hash))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// READER
// ════════════════════════════════════════════════════════════════════════════════

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InstructionError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len()).ok_or(
            InstructionError::Truncated {
                offset: self.pos,
                needed: n,
            },
        )?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, InstructionError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, InstructionError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, InstructionError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array8(&mut self) -> Result<[u8; 8], InstructionError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(out)
    }

    fn array32(&mut self) -> Result<[u8; 32], InstructionError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn finish(&self) -> Result<(), InstructionError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(InstructionError::TrailingBytes(n)),
        }
    }
}
