//! Core data model: sessions, saved records, peer descriptors, identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two supervised command-line assistants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    KindA,
    KindB,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::KindA => "kind-a",
            SessionKind::KindB => "kind-b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Reserved for future use; treated as `Active` for persistence per
    /// the data model.
    Idle,
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub git_root: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context_used: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub waiting_for_input: bool,
}

/// Output of the metadata extractor for a single chunk: only the fields a
/// rule actually matched are `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub model: Option<String>,
    pub context_used: Option<String>,
    pub last_message: Option<String>,
    pub waiting_for_input: Option<bool>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.context_used.is_none()
            && self.last_message.is_none()
            && self.waiting_for_input.is_none()
    }

    /// Applies this patch to `metadata` field-by-field, returning whether
    /// anything actually changed.
    pub fn apply(&self, metadata: &mut SessionMetadata) -> bool {
        let mut changed = false;
        if let Some(model) = &self.model {
            if metadata.model.as_deref() != Some(model.as_str()) {
                metadata.model = Some(model.clone());
                changed = true;
            }
        }
        if let Some(context_used) = &self.context_used {
            if metadata.context_used.as_deref() != Some(context_used.as_str()) {
                metadata.context_used = Some(context_used.clone());
                changed = true;
            }
        }
        if let Some(last_message) = &self.last_message {
            if metadata.last_message.as_deref() != Some(last_message.as_str()) {
                metadata.last_message = Some(last_message.clone());
                changed = true;
            }
        }
        if let Some(waiting) = self.waiting_for_input {
            if metadata.waiting_for_input != waiting {
                metadata.waiting_for_input = waiting;
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    /// Updated on every PTY read. Drives `list()` sort order only; never
    /// persisted beyond what the saved-session record carries.
    pub last_activity: DateTime<Utc>,
}

/// On-disk representation: (id, name, kind, workingDir) only — no runtime
/// state is ever persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSessionRecord {
    pub id: String,
    pub name: String,
    pub kind: SessionKind,
    pub working_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHostDescriptor {
    pub instance_id: String,
    pub hostname: String,
    pub identity_hash: String,
    pub address: String,
    pub port: u16,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub email: String,
    pub identity_hash: String,
    pub instance_id: String,
    pub hostname: String,
}

/// Prefix applied to remote session ids only at the IPC boundary, per the
/// tunnel id transform.
pub const TUNNEL_PREFIX: &str = "tunnel:";

pub fn make_tunnel_id(instance_id: &str, remote_id: &str) -> String {
    format!("{TUNNEL_PREFIX}{instance_id}:{remote_id}")
}

pub fn is_tunnel_id(id: &str) -> bool {
    id.starts_with(TUNNEL_PREFIX)
}

/// Splits a tunnel id into `(instance_id, remote_id)`. Returns `None` if
/// `id` is not a well-formed tunnel id.
pub fn parse_tunnel_id(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix(TUNNEL_PREFIX)?;
    rest.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_id_round_trips() {
        let id = make_tunnel_id("inst-1", "sess-9");
        assert!(is_tunnel_id(&id));
        assert_eq!(parse_tunnel_id(&id), Some(("inst-1", "sess-9")));
        assert_eq!(parse_tunnel_id("sess-9"), None);
    }

    #[test]
    fn patch_apply_only_flags_changed_fields() {
        let mut meta = SessionMetadata::default();
        let patch = MetadataPatch {
            last_message: Some("hi".into()),
            ..Default::default()
        };
        assert!(patch.apply(&mut meta));
        assert!(!patch.apply(&mut meta)); // same value again -> no change
        assert_eq!(meta.last_message.as_deref(), Some("hi"));
    }
}
