//! Persistence store (§4.1): the durable list of saved-session records in
//! `sessions.json`. Grounded on `happy-cli::daemon::persistence::
//! PersistenceManager`'s best-effort, log-never-throw posture, generalized
//! from the teacher's per-session ring-buffer store down to the plain
//! `(id, name, kind, workingDir)` tuple the spec's data model actually
//! calls for.

use std::collections::HashMap;
use termmesh_core::paths;
use termmesh_core::types::SavedSessionRecord;

pub struct PersistenceStore;

impl PersistenceStore {
    /// Loads the saved-session list. A parse failure is treated as an
    /// empty list rather than an error — persistence is best-effort and
    /// must never block the supervisor from starting.
    pub fn load() -> Vec<SavedSessionRecord> {
        let path = match paths::sessions_path() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "could not resolve sessions.json path");
                return Vec::new();
            }
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed reading sessions.json, treating as empty");
                return Vec::new();
            }
        };
        let parsed: Vec<SavedSessionRecord> = match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "sessions.json did not parse, treating as empty");
                return Vec::new();
            }
        };

        let deduped = dedup_latest_wins(parsed);
        if deduped.len() != count_records(&raw) {
            Self::save(&deduped);
        }
        deduped
    }

    /// Full-file rewrite, indented for human inspection. Errors are logged
    /// only — persistence never surfaces a failure to the supervisor.
    pub fn save(list: &[SavedSessionRecord]) {
        let path = match paths::sessions_path() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "could not resolve sessions.json path");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!(error = %e, "could not create sessions.json parent dir");
                return;
            }
        }
        match serde_json::to_string_pretty(list) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    tracing::error!(error = %e, "could not write sessions.json");
                }
            }
            Err(e) => tracing::error!(error = %e, "could not serialize sessions.json"),
        }
    }

    pub fn add_or_replace(record: SavedSessionRecord) {
        let mut list = Self::load();
        if let Some(existing) = list.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            list.push(record);
        }
        Self::save(&list);
    }

    pub fn remove(id: &str) {
        let mut list = Self::load();
        list.retain(|r| r.id != id);
        Self::save(&list);
    }

    pub fn update(id: &str, patch: impl FnOnce(&mut SavedSessionRecord)) {
        let mut list = Self::load();
        if let Some(existing) = list.iter_mut().find(|r| r.id == id) {
            patch(existing);
            Self::save(&list);
        }
    }
}

/// Later occurrence wins when the same `id` appears more than once.
fn dedup_latest_wins(records: Vec<SavedSessionRecord>) -> Vec<SavedSessionRecord> {
    let mut by_id: HashMap<String, SavedSessionRecord> = HashMap::new();
    let mut order = Vec::new();
    for record in records {
        if !by_id.contains_key(&record.id) {
            order.push(record.id.clone());
        }
        by_id.insert(record.id.clone(), record);
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Cheap approximation used only to decide whether dedup actually changed
/// anything and a rewrite is warranted; counts top-level array entries by
/// re-parsing rather than tracking indices through the dedup pass.
fn count_records(raw: &str) -> usize {
    serde_json::from_str::<Vec<serde_json::Value>>(raw)
        .map(|v| v.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use termmesh_core::types::SessionKind;

    fn record(id: &str) -> SavedSessionRecord {
        SavedSessionRecord {
            id: id.to_string(),
            name: format!("name-{id}"),
            kind: SessionKind::KindA,
            working_dir: format!("/tmp/{id}"),
        }
    }

    #[test]
    fn dedup_keeps_latest_occurrence() {
        let mut first = record("a");
        first.working_dir = "/tmp/first".into();
        let mut second = record("a");
        second.working_dir = "/tmp/second".into();
        let deduped = dedup_latest_wins(vec![first, second]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].working_dir, "/tmp/second");
    }

    #[test]
    fn dedup_preserves_distinct_ids() {
        let deduped = dedup_latest_wins(vec![record("a"), record("b")]);
        assert_eq!(deduped.len(), 2);
    }
}
