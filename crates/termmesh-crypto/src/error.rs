//! Error types for the crypto crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid public key encoding: {0}")]
    InvalidPublicKey(String),

    #[error("invalid packed ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("decryption failed (tag mismatch or corrupted frame)")]
    DecryptionFailed,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
