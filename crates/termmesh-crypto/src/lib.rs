pub mod cipher;
pub mod dh;
pub mod error;

pub use error::{CryptoError, Result};

/// A per-connection derived secret plus the encrypt/decrypt operations over
/// it — the peer server and peer client each own one of these per
/// connection, matching the "immutable after handshake" resource policy.
#[derive(Clone)]
pub struct SessionCrypto {
    key: [u8; 32],
}

impl SessionCrypto {
    pub fn from_shared_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn derive(keypair: &dh::KeyPair, remote_public_b64: &str) -> Result<Self> {
        Ok(Self {
            key: keypair.compute_secret(remote_public_b64)?,
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        cipher::encrypt(&self.key, plaintext)
    }

    pub fn decrypt(&self, packed_b64: &str) -> Result<Vec<u8>> {
        cipher::decrypt(&self.key, packed_b64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_session_crypto_round_trips_across_two_sides() {
        let alice_kp = dh::generate_keypair();
        let bob_kp = dh::generate_keypair();
        let alice = SessionCrypto::derive(&alice_kp, &bob_kp.public_base64()).unwrap();
        let bob = SessionCrypto::derive(&bob_kp, &alice_kp.public_base64()).unwrap();

        let frame = alice.encrypt(b"auth:request").unwrap();
        let opened = bob.decrypt(&frame).unwrap();
        assert_eq!(opened, b"auth:request");
    }
}
