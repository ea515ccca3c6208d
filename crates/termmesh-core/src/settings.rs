//! Daemon settings persistence, grounded on the teacher's
//! `SettingsManager` (separate load/save, owner-only file permissions,
//! directory auto-creation).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{paths, CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// First port the peer server tries to bind; probes upward per §4.9.
    #[serde(default = "default_peer_port_base")]
    pub peer_port_base: u16,
    /// Local loopback port the IPC surface listens on.
    #[serde(default = "default_ipc_port")]
    pub ipc_port: u16,
    /// Reserved extension point for the lazy-activation open question in
    /// §9 — unused; restored sessions always spawn immediately.
    #[serde(default)]
    pub lazy_activation: bool,
}

fn default_peer_port_base() -> u16 {
    9500
}

fn default_ipc_port() -> u16 {
    7890
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            peer_port_base: default_peer_port_base(),
            ipc_port: default_ipc_port(),
            lazy_activation: false,
        }
    }
}

pub struct SettingsManager;

impl SettingsManager {
    pub fn load() -> Result<DaemonSettings> {
        let path = paths::settings_path()?;
        if !path.exists() {
            let settings = DaemonSettings::default();
            Self::save(&settings)?;
            return Ok(settings);
        }
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(error = %e, "settings file unreadable, falling back to defaults");
                Ok(DaemonSettings::default())
            }
        }
    }

    pub fn save(settings: &DaemonSettings) -> Result<()> {
        let path = paths::settings_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(settings).map_err(CoreError::Json)?;
        std::fs::write(&path, content)?;
        set_owner_only(&path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &PathBuf) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_have_expected_ports() {
        let s = DaemonSettings::default();
        assert_eq!(s.peer_port_base, 9500);
        assert!(!s.lazy_activation);
    }
}
