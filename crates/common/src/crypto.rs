//! Crypto helpers: Ed25519 oracle keypair loading, sign, verify.
//!
//! Accepted key encodings (hex, optional surrounding whitespace):
//!   32 bytes = private seed
//!   64 bytes = [0..32] private seed, [32..64] public key
//!
//! For the 64-byte form the public half must match the seed.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 or 64 bytes, found {found}")]
    InvalidKeyLength { found: usize },

    #[error("public key does not match private seed")]
    KeyMismatch,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signing capability used to authorize ledger transactions.
///
/// Key custody lives behind this trait; the oracle never needs the
/// private key itself.
pub trait TransactionSigner: Send + Sync {
    /// 32-byte Ed25519 public key of the signer.
    fn public_key(&self) -> [u8; 32];

    /// 64-byte Ed25519 signature over `message`.
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

/// The oracle's signing identity.
#[derive(Clone)]
pub struct OracleKeypair {
    signing: SigningKey,
}

impl OracleKeypair {
    /// Build a keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Build a keypair from 32-byte seed or 64-byte combined bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(bytes);
                Ok(Self::from_seed(seed))
            }
            64 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes[0..32]);
                let kp = Self::from_seed(seed);
                if kp.public_key() != bytes[32..64] {
                    return Err(CryptoError::KeyMismatch);
                }
                Ok(kp)
            }
            found => Err(CryptoError::InvalidKeyLength { found }),
        }
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(hexstr: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hexstr.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Read a hex-encoded key from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_hex(&contents)
    }

    /// 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message and return the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl TransactionSigner for OracleKeypair {
    fn public_key(&self) -> [u8; 32] {
        OracleKeypair::public_key(self)
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        OracleKeypair::sign(self, message)
    }
}

impl fmt::Debug for OracleKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleKeypair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

/// Verify a message given public key and signature.
pub fn verify_signature(
    pubkey: &[u8; 32],
    message: &[u8],
    sig: &[u8; 64],
) -> Result<bool, CryptoError> {
    let vk = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(sig);
    Ok(vk.verify(message, &sig).is_ok())
}
