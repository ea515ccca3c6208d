//! Auto-discovery watcher (§4.6): polls three sources on a fixed interval
//! for sessions not yet represented locally. This is a pure polling loop —
//! *not* the teacher's inotify-based `happy_core::watcher::Watcher`, since
//! the spec is explicit about 10 s polling with delta-suffix log reads,
//! which an fs-event watcher does not model. The module name and the
//! "poll once immediately, then on an interval" baseline behavior are the
//! only things carried from the teacher's watcher.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use termmesh_core::paths::decode_project_dir;
use termmesh_core::types::SessionKind;

#[derive(Debug, Clone)]
pub struct WatcherPaths {
    /// kind-A append-only history log.
    pub history_log: PathBuf,
    /// kind-A `<projects>/<encoded-dir>/<sessionId>.jsonl` tree.
    pub projects_dir: PathBuf,
    /// kind-B `<session-state>/<uuid>/workspace.yaml` tree.
    pub copilot_state_dir: PathBuf,
}

impl Default for WatcherPaths {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            history_log: home.join(".claude").join("history.jsonl"),
            projects_dir: home.join(".claude").join("projects"),
            copilot_state_dir: home.join(".copilot").join("session-state"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub working_dir: PathBuf,
    pub display_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct Watcher {
    paths: WatcherPaths,
    known_session_ids: HashSet<String>,
    claimed_dirs: HashSet<PathBuf>,
    history_offset: u64,
    history_len: u64,
}

impl Watcher {
    pub fn new(paths: WatcherPaths) -> Self {
        Self {
            paths,
            known_session_ids: HashSet::new(),
            claimed_dirs: HashSet::new(),
            history_offset: 0,
            history_len: 0,
        }
    }

    /// Polls all three sources and returns newly discovered sessions,
    /// applying the working-directory claim rule against both this
    /// watcher's own prior claims and the caller's set of already-known
    /// working directories (materialized sessions).
    pub fn poll(&mut self, known_working_dirs: &HashSet<PathBuf>) -> Vec<DiscoveredSession> {
        let mut candidates = Vec::new();
        candidates.extend(self.poll_history_log());
        candidates.extend(self.poll_projects_dir());
        candidates.extend(self.poll_copilot_state());
        self.dedup_and_claim(candidates, known_working_dirs)
    }

    /// Applies the working-directory claim rule: a candidate is emitted iff
    /// its session id hasn't been seen before and its working directory is
    /// not already claimed (by a prior discovery) or known (materialized).
    fn dedup_and_claim(
        &mut self,
        candidates: Vec<DiscoveredSession>,
        known_working_dirs: &HashSet<PathBuf>,
    ) -> Vec<DiscoveredSession> {
        let mut emitted = Vec::new();
        for candidate in candidates {
            if self.known_session_ids.contains(&candidate.session_id) {
                continue;
            }
            if self.claimed_dirs.contains(&candidate.working_dir)
                || known_working_dirs.contains(&candidate.working_dir)
            {
                self.known_session_ids.insert(candidate.session_id.clone());
                continue;
            }
            self.known_session_ids.insert(candidate.session_id.clone());
            self.claimed_dirs.insert(candidate.working_dir.clone());
            emitted.push(candidate);
        }
        emitted
    }

    fn poll_history_log(&mut self) -> Vec<DiscoveredSession> {
        let meta = match fs::metadata(&self.paths.history_log) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        let len = meta.len();

        if len < self.history_len {
            // Truncated: reset and skip this cycle per §4.6.
            self.history_offset = 0;
            self.history_len = 0;
            return Vec::new();
        }
        if len == self.history_len {
            return Vec::new();
        }

        let content = match fs::read(&self.paths.history_log) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let delta = &content[self.history_offset as usize..];
        self.history_offset = len;
        self.history_len = len;

        String::from_utf8_lossy(delta)
            .lines()
            .filter_map(|line| serde_json::from_str::<HistoryLine>(line).ok())
            .map(|entry| DiscoveredSession {
                session_id: entry.session_id,
                kind: SessionKind::KindA,
                working_dir: PathBuf::from(entry.project),
                display_name: entry.display,
                timestamp: entry.timestamp,
            })
            .collect()
    }

    fn poll_projects_dir(&self) -> Vec<DiscoveredSession> {
        let mut found = Vec::new();
        let Ok(dirs) = fs::read_dir(&self.paths.projects_dir) else {
            return found;
        };
        for entry in dirs.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let encoded = entry.file_name().to_string_lossy().to_string();
            let working_dir = decode_project_dir(&encoded);
            let Ok(files) = fs::read_dir(entry.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if !is_canonical_uuid(stem) {
                    continue;
                }
                found.push(DiscoveredSession {
                    session_id: stem.to_string(),
                    kind: SessionKind::KindA,
                    working_dir: working_dir.clone(),
                    display_name: None,
                    timestamp: None,
                });
            }
        }
        found
    }

    fn poll_copilot_state(&self) -> Vec<DiscoveredSession> {
        let mut found = Vec::new();
        let Ok(dirs) = fs::read_dir(&self.paths.copilot_state_dir) else {
            return found;
        };
        for entry in dirs.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let uuid = entry.file_name().to_string_lossy().to_string();
            if !is_canonical_uuid(&uuid) {
                continue;
            }
            let workspace = entry.path().join("workspace.yaml");
            let Ok(content) = fs::read_to_string(&workspace) else {
                continue;
            };
            let fields = parse_flat_yaml(&content);
            let Some(cwd) = fields.get("cwd") else {
                continue;
            };
            let timestamp = fields
                .get("updated_at")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            found.push(DiscoveredSession {
                session_id: uuid,
                kind: SessionKind::KindB,
                working_dir: PathBuf::from(cwd),
                display_name: fields.get("summary").cloned(),
                timestamp,
            });
        }
        found
    }
}

#[derive(serde::Deserialize)]
struct HistoryLine {
    #[serde(rename = "sessionId")]
    session_id: String,
    project: String,
    display: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

fn is_canonical_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

fn parse_flat_yaml(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn decode_project_dir_is_used_for_encoded_names() {
        // exercised indirectly via poll_projects_dir; direct sanity check
        // that the re-exported helper is reachable from this module.
        let _ = decode_project_dir("tmp-x");
    }

    #[test]
    fn flat_yaml_parses_required_and_optional_fields() {
        let content = "cwd: /tmp/project\nsummary: \"Fix bug\"\nupdated_at: 2024-01-01T00:00:00Z\n";
        let fields = parse_flat_yaml(content);
        assert_eq!(fields.get("cwd").unwrap(), "/tmp/project");
        assert_eq!(fields.get("summary").unwrap(), "Fix bug");
    }

    #[test]
    fn history_log_delta_read_skips_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("history.jsonl");
        let mut file = fs::File::create(&log_path).unwrap();
        writeln!(
            file,
            r#"{{"sessionId":"{}","project":"/tmp/a"}}"#,
            uuid::Uuid::new_v4()
        )
        .unwrap();
        drop(file);

        let mut watcher = Watcher::new(WatcherPaths {
            history_log: log_path.clone(),
            projects_dir: dir.path().join("projects"),
            copilot_state_dir: dir.path().join("copilot"),
        });
        let first = watcher.poll_history_log();
        assert_eq!(first.len(), 1);

        // truncate to simulate log rotation
        fs::File::create(&log_path).unwrap();
        let second = watcher.poll_history_log();
        assert!(second.is_empty());
    }

    #[test]
    fn dedup_claims_working_dir_on_first_emit() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new(WatcherPaths {
            history_log: dir.path().join("missing.jsonl"),
            projects_dir: dir.path().join("projects"),
            copilot_state_dir: dir.path().join("copilot"),
        });
        let known = HashSet::new();
        let wd = PathBuf::from("/tmp/project-x");
        let first = DiscoveredSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            kind: SessionKind::KindA,
            working_dir: wd.clone(),
            display_name: None,
            timestamp: None,
        };
        let second = DiscoveredSession {
            working_dir: wd.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            ..first.clone()
        };

        let emitted_first = watcher.dedup_and_claim(vec![first], &known);
        assert_eq!(emitted_first.len(), 1);
        let emitted_second = watcher.dedup_and_claim(vec![second], &known);
        assert!(emitted_second.is_empty(), "second uuid for same dir must be absorbed");
    }
}
