//! Local identity resolution: git email -> identity hash, persisted instance
//! id, hostname.

use sha2::{Digest, Sha256};
use std::process::Command;

use crate::types::LocalIdentity;
use crate::{paths, CoreError, Result};

/// Outcome of attempting to resolve identity at daemon start. Matching the
/// spec's "no crash, disabled status" contract: a missing git email is not
/// an error, it is the `Disabled` variant.
pub enum IdentityResolution {
    Enabled(LocalIdentity),
    Disabled,
}

/// Resolves local identity the way the peer fabric needs it at startup.
/// Never fails outright: any lookup problem downgrades to `Disabled` rather
/// than propagating, since the absence of a configured git email is an
/// expected, common case (not every machine is paired for peering).
pub fn resolve() -> IdentityResolution {
    match git_user_email() {
        Some(email) if !email.trim().is_empty() => {
            let email = email.trim().to_string();
            let identity_hash = identity_hash(&email);
            let instance_id = match load_or_create_instance_id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(error = %e, "could not resolve instance id, peer fabric disabled");
                    return IdentityResolution::Disabled;
                }
            };
            let hostname = hostname();
            IdentityResolution::Enabled(LocalIdentity {
                email,
                identity_hash,
                instance_id,
                hostname,
            })
        }
        _ => IdentityResolution::Disabled,
    }
}

fn git_user_email() -> Option<String> {
    let output = Command::new("git")
        .args(["config", "--global", "user.email"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// First 16 hex chars of SHA-256(email), per the glossary definition of
/// identity hash.
pub fn identity_hash(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

fn load_or_create_instance_id() -> Result<String> {
    let path = paths::instance_id_path()?;
    if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id).map_err(CoreError::Io)?;
    Ok(id)
}

/// OS hostname. `whoami` is cross-platform and avoids shelling out except
/// where the OS itself requires it on that platform.
fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_is_first_16_hex_chars_of_sha256() {
        let mut hasher = Sha256::new();
        hasher.update(b"alice@example.com");
        let expected = hex::encode(hasher.finalize())[..16].to_string();
        assert_eq!(identity_hash("alice@example.com"), expected);
        assert_eq!(identity_hash("alice@example.com").len(), 16);
    }

    #[test]
    fn identity_hash_is_deterministic() {
        assert_eq!(identity_hash("x@y.com"), identity_hash("x@y.com"));
        assert_ne!(identity_hash("x@y.com"), identity_hash("z@y.com"));
    }
}
