//! Diffie-Hellman over RFC3526 MODP group 14.
//!
//! The teacher crate's `EncryptionEngine` (`happy-remote-core::crypto::nacl`)
//! is built around X25519/XSalsa20 via `crypto_box`, which has no raw
//! shared-secret primitive to reuse here — classic DH is implemented
//! directly against `num-bigint-dig`, kept behind the same trait shape the
//! teacher uses (keypair struct, `compute_secret`) so the rest of the
//! codebase reads the same way.

use base64::{engine::general_purpose::STANDARD, Engine};
use num_bigint_dig::{BigUint, RandBigInt};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Result};

/// RFC3526 2048-bit MODP Group 14 prime, hex.
const MODP14_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404",
    "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
    "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE4",
    "5B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD2",
    "4CF5F83655D23DCA3AD961C62F356208552BB9ED5290770",
    "96966D670C354E4ABC9804F1746C08CA18217C32905E462",
    "E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF0",
    "6F4C52C9DE2BCBF6955817183995497CEA956AE515D2261",
    "898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);
const GENERATOR: u64 = 2;

/// Bytes of private exponent randomness. 256 bits gives the usual security
/// margin used against modp14 in practice without paying for a full
/// 2048-bit exponentiation range.
const PRIVATE_EXPONENT_BYTES: usize = 32;

fn prime() -> BigUint {
    BigUint::parse_bytes(MODP14_PRIME_HEX.as_bytes(), 16).expect("modp14 prime is valid hex")
}

pub struct KeyPair {
    private: BigUint,
    pub public: BigUint,
}

impl KeyPair {
    /// Base64 encoding of the public value's big-endian bytes, as carried
    /// in the `key:exchange` frame.
    pub fn public_base64(&self) -> String {
        STANDARD.encode(self.public.to_bytes_be())
    }

    /// Derives the 32-byte shared key: SHA-256 of the raw DH shared secret.
    pub fn compute_secret(&self, remote_public_b64: &str) -> Result<[u8; 32]> {
        let remote_bytes = STANDARD
            .decode(remote_public_b64)
            .map_err(CryptoError::Base64)?;
        if remote_bytes.is_empty() {
            return Err(CryptoError::InvalidPublicKey("empty public key".into()));
        }
        let remote_public = BigUint::from_bytes_be(&remote_bytes);
        let p = prime();
        if remote_public >= p {
            return Err(CryptoError::InvalidPublicKey(
                "public key not reduced mod p".into(),
            ));
        }
        let shared = remote_public.modpow(&self.private, &p);
        let mut hasher = Sha256::new();
        hasher.update(shared.to_bytes_be());
        Ok(hasher.finalize().into())
    }
}

/// Generates a fresh DH keypair over modp14.
pub fn generate_keypair() -> KeyPair {
    let p = prime();
    let g = BigUint::from(GENERATOR);
    let mut rng = rand::rngs::OsRng;
    let private = rng.gen_biguint(PRIVATE_EXPONENT_BYTES as u64 * 8) % &p;
    let public = g.modpow(&private, &p);
    KeyPair { private, public }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let alice_secret = alice.compute_secret(&bob.public_base64()).unwrap();
        let bob_secret = bob.compute_secret(&alice.public_base64()).unwrap();
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn different_peers_derive_different_secrets() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let carol = generate_keypair();
        let alice_bob = alice.compute_secret(&bob.public_base64()).unwrap();
        let alice_carol = alice.compute_secret(&carol.public_base64()).unwrap();
        assert_ne!(alice_bob, alice_carol);
    }

    #[test]
    fn rejects_public_key_not_reduced_mod_p() {
        let alice = generate_keypair();
        let oversized = STANDARD.encode(prime().to_bytes_be());
        assert!(alice.compute_secret(&oversized).is_err());
    }
}
