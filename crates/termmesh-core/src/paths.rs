//! Home directory resolution, project-directory encode/decode, and git-root
//! discovery.

use std::path::{Path, PathBuf};

/// Returns `~/.termmesh`, honoring a `TERMMESH_HOME` override the same way
/// the daemon honors other env overrides.
pub fn termmesh_home() -> crate::Result<PathBuf> {
    if let Ok(path) = std::env::var("TERMMESH_HOME") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| crate::CoreError::Other("could not find home directory".into()))?;
    Ok(home.join(".termmesh"))
}

pub fn sessions_path() -> crate::Result<PathBuf> {
    Ok(termmesh_home()?.join("sessions.json"))
}

pub fn settings_path() -> crate::Result<PathBuf> {
    Ok(termmesh_home()?.join("settings.json"))
}

pub fn instance_id_path() -> crate::Result<PathBuf> {
    Ok(termmesh_home()?.join("tunnel-instance-id"))
}

pub fn pid_path() -> crate::Result<PathBuf> {
    Ok(termmesh_home()?.join("daemon.pid"))
}

pub fn log_path() -> crate::Result<PathBuf> {
    Ok(termmesh_home()?.join("logs"))
}

/// Expands a leading `~` to the user's home directory. Paths without a
/// leading `~` are returned unchanged.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

/// Encodes an absolute path into the flattened directory-name form used
/// under `<kind-A dir>/projects/<encoded>/`, replacing path separators with
/// `-`. This mirrors the encoding the kind-A CLI itself uses for its
/// per-project log directories.
pub fn encode_project_dir(path: &Path) -> String {
    path.to_string_lossy().replace(['/', '\\'], "-")
}

/// Reverses [`encode_project_dir`]. The encoded name has lost which `-`
/// characters were original path separators versus literal hyphens in
/// directory names, so this tries every separator at every segment boundary
/// and returns the first candidate that exists on disk; falls back to `/`
/// when none exist (e.g. in tests against a path that hasn't been created).
pub fn decode_project_dir(encoded: &str) -> PathBuf {
    let segments: Vec<&str> = encoded.split('-').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return PathBuf::from("/");
    }
    let mut stack = vec![PathBuf::from("/")];
    for seg in &segments {
        let mut next = Vec::new();
        for base in &stack {
            // `/`: seg starts a new path component.
            next.push(base.join(seg));
            // `.`/`_`/`-`: seg was joined to the previous component by a
            // literal character in the original directory name, so fold it
            // into `base`'s last component instead of starting a new one.
            for sep in ['.', '_', '-'] {
                if let Some(folded) = fold_into_last_component(base, sep, seg) {
                    next.push(folded);
                }
            }
        }
        stack = dedup_paths(next);
    }
    stack
        .into_iter()
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("/").join(segments.join("/")))
}

/// Builds `base` with `sep` and `seg` appended to its last component's name,
/// e.g. `fold_into_last_component("/a", '-', "b")` -> `/a-b`. Returns `None`
/// when `base` has no last component to fold into (the root).
fn fold_into_last_component(base: &Path, sep: char, seg: &str) -> Option<PathBuf> {
    let parent = base.parent()?;
    let name = base.file_name()?.to_string_lossy();
    Some(parent.join(format!("{name}{sep}{seg}")))
}

fn dedup_paths(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort();
    paths.dedup();
    paths
}

/// Walks upward from `start` looking for a `.git` entry; returns the
/// containing directory, or `None` if no repository root is found before
/// reaching the filesystem root.
pub fn resolve_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_replaces_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~/projects/x"), home.join("projects/x"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn encode_decode_round_trips_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let encoded = encode_project_dir(&nested);
        let decoded = decode_project_dir(&encoded);
        assert_eq!(decoded, nested);
    }

    #[test]
    fn encode_decode_round_trips_path_with_embedded_punctuation() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("my.project_v2-final");
        std::fs::create_dir_all(&nested).unwrap();
        let encoded = encode_project_dir(&nested);
        let decoded = decode_project_dir(&encoded);
        assert_eq!(decoded, nested);
    }

    #[test]
    fn resolve_git_root_finds_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("src").join("inner");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(resolve_git_root(&nested), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn resolve_git_root_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_git_root(dir.path()), None);
    }
}
