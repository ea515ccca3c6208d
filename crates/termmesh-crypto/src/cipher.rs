//! AES-256-GCM authenticated encryption, wire layout `iv(12) ‖ tag(16) ‖
//! ciphertext`, base64-encoded. Grounded structurally on the teacher's
//! `NaClEngine::encrypt`/`decrypt` (random nonce, packed output, symmetric
//! failure test) with the XSalsa20/Poly1305 primitive swapped for AES-GCM.

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;

use crate::error::{CryptoError, Result};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts `plaintext` under `key`, returning the base64-encoded
/// `iv ‖ tag ‖ ciphertext` frame.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = GenericArray::from_slice(&iv);
    // `aes-gcm` appends the tag to the ciphertext itself; split it back out
    // so the wire layout matches the spec's iv-tag-ciphertext ordering.
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let tag_offset = sealed.len() - TAG_LEN;
    let tag = sealed.split_off(tag_offset);
    let ciphertext = sealed;

    let mut packed = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    packed.extend_from_slice(&iv);
    packed.extend_from_slice(&tag);
    packed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(packed))
}

/// Inverse of [`encrypt`]. Fails closed: any layout, base64, or tag error
/// returns [`CryptoError::DecryptionFailed`] without partial output.
pub fn decrypt(key: &[u8; 32], packed_b64: &str) -> Result<Vec<u8>> {
    let packed = STANDARD.decode(packed_b64)?;
    if packed.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::InvalidCiphertext(
            "frame shorter than iv+tag".into(),
        ));
    }
    let (iv, rest) = packed.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(iv);
    cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips() {
        let key = test_key();
        let packed = encrypt(&key, b"hello peer").unwrap();
        let opened = decrypt(&key, &packed).unwrap();
        assert_eq!(opened, b"hello peer");
    }

    #[test]
    fn fails_closed_on_tampered_frame() {
        let key = test_key();
        let packed = encrypt(&key, b"hello peer").unwrap();
        let mut raw = STANDARD.decode(&packed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = STANDARD.encode(raw);
        assert!(decrypt(&key, &tampered).is_err());
    }

    #[test]
    fn fails_closed_on_wrong_key() {
        let packed = encrypt(&test_key(), b"hello peer").unwrap();
        let wrong_key = [9u8; 32];
        assert!(decrypt(&wrong_key, &packed).is_err());
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        let key = test_key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a, b, "random iv must vary ciphertext framing");
    }
}
