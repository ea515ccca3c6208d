//! Session supervisor (§4.7): owns every local session, fans out PTY events,
//! persists lifecycle transitions. Grounded on the combination of
//! `happy-cli::daemon::multiplexer::SessionMultiplexer` (owning map +
//! per-session broadcast) and `happy-cli::daemon::session_manager::
//! DaemonSessionManager` (create/restart/shutdown orchestration).

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use termmesh_core::types::{
    SavedSessionRecord, Session, SessionKind, SessionMetadata, SessionStatus,
};
use termmesh_core::{paths, CoreError};

use super::metadata;
use super::persistence::PersistenceStore;
use super::pty_session::{self, build_launch_command, PtyEvent, PtyHandle, StartOptions, TermSize};

type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Output { session_id: String, data: Bytes },
    Update { session: Session },
    Exit { session_id: String, code: Option<i32> },
}

pub struct CreateRequest {
    pub kind: SessionKind,
    pub working_dir: PathBuf,
    pub name: Option<String>,
    pub resume: bool,
    /// `Some` means "restore this id", not "create new".
    pub id: Option<String>,
}

struct Entry {
    session: Session,
    handle: Option<PtyHandle>,
}

pub struct Supervisor {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    counters: Arc<RwLock<HashMap<&'static str, u64>>>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_tx.subscribe()
    }

    pub async fn create(&self, req: CreateRequest) -> Result<Session> {
        let is_restore = req.id.is_some();
        let id = req.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if is_restore {
            if self.entries.read().await.contains_key(&id) {
                return Err(CoreError::SessionExists(id));
            }
        }

        let name = match req.name.clone() {
            Some(n) => n,
            None => self.compose_name(req.kind).await,
        };

        let assistant = assistant_for(req.kind);
        let supports_resume = req.kind == SessionKind::KindA;
        let launch_command = build_launch_command(assistant, req.resume, supports_resume);

        let (handle, events_rx) = pty_session::spawn(StartOptions {
            working_dir: req.working_dir.clone(),
            size: TermSize::default(),
            launch_command,
        })
        .map_err(|e| CoreError::Other(format!("pty spawn failed: {e}")))?;

        let git_root = paths::resolve_git_root(&req.working_dir).map(|p| p.display().to_string());

        let session = Session {
            id: id.clone(),
            name: name.clone(),
            kind: req.kind,
            status: SessionStatus::Active,
            metadata: SessionMetadata {
                working_dir: req.working_dir.display().to_string(),
                git_root,
                ..Default::default()
            },
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };

        self.entries.write().await.insert(
            id.clone(),
            Entry {
                session: session.clone(),
                handle: Some(handle),
            },
        );

        if !is_restore {
            PersistenceStore::add_or_replace(SavedSessionRecord {
                id: id.clone(),
                name,
                kind: req.kind,
                working_dir: req.working_dir.display().to_string(),
            });
        }

        self.spawn_event_pump(id.clone(), events_rx);
        self.emit(SupervisorEvent::Update { session: session.clone() });
        Ok(session)
    }

    fn spawn_event_pump(&self, id: String, mut events_rx: mpsc::Receiver<PtyEvent>) {
        let entries = self.entries.clone();
        let events_tx = self.events_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PtyEvent::Data(bytes) => {
                        if !shutdown.load(Ordering::SeqCst) {
                            let _ = events_tx.send(SupervisorEvent::Output {
                                session_id: id.clone(),
                                data: bytes.clone(),
                            });
                        }
                        if let Some(entry) = entries.write().await.get_mut(&id) {
                            entry.session.last_activity = Utc::now();
                        }
                        if let Ok(text) = std::str::from_utf8(&bytes) {
                            let patch = metadata::extract(text);
                            if patch.is_empty() {
                                continue;
                            }
                            let mut guard = entries.write().await;
                            if let Some(entry) = guard.get_mut(&id) {
                                if patch.apply(&mut entry.session.metadata) {
                                    let updated = entry.session.clone();
                                    drop(guard);
                                    if !shutdown.load(Ordering::SeqCst) {
                                        let _ =
                                            events_tx.send(SupervisorEvent::Update { session: updated });
                                    }
                                }
                            }
                        }
                    }
                    PtyEvent::Exit { code } => {
                        let mut guard = entries.write().await;
                        if let Some(entry) = guard.get_mut(&id) {
                            entry.session.status = SessionStatus::Closed;
                            entry.handle = None;
                            let updated = entry.session.clone();
                            drop(guard);
                            if !shutdown.load(Ordering::SeqCst) {
                                let _ = events_tx.send(SupervisorEvent::Exit {
                                    session_id: id.clone(),
                                    code,
                                });
                                let _ = events_tx.send(SupervisorEvent::Update { session: updated });
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    pub async fn close(&self, id: &str) -> Result<()> {
        let (handle, session) = {
            let mut guard = self.entries.write().await;
            let entry = guard
                .get_mut(id)
                .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
            entry.session.status = SessionStatus::Closed;
            (entry.handle.take(), entry.session.clone())
        };
        if let Some(handle) = handle {
            handle.kill().await;
        }
        self.emit(SupervisorEvent::Update { session });
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let handle = {
            let mut guard = self.entries.write().await;
            let entry = guard
                .remove(id)
                .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
            entry.handle
        };
        if let Some(handle) = handle {
            handle.kill().await;
        }
        PersistenceStore::remove(id);
        Ok(())
    }

    pub async fn restart(&self, id: &str) -> Result<Session> {
        let (kind, working_dir, name) = {
            let guard = self.entries.read().await;
            let entry = guard
                .get(id)
                .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
            if entry.session.status != SessionStatus::Closed {
                return Err(CoreError::Other(format!(
                    "session {id} is not closed, cannot restart"
                )));
            }
            (
                entry.session.kind,
                PathBuf::from(&entry.session.metadata.working_dir),
                entry.session.name.clone(),
            )
        };
        // Restart reuses the closed entry's slot; drop it first so create()
        // with the same id does not see it as an existing live session.
        self.entries.write().await.remove(id);
        self.create(CreateRequest {
            kind,
            working_dir,
            name: Some(name),
            resume: true,
            id: Some(id.to_string()),
        })
        .await
    }

    pub async fn restore_sessions(&self) {
        for record in PersistenceStore::load() {
            let working_dir = PathBuf::from(&record.working_dir);
            if let Err(e) = self
                .create(CreateRequest {
                    kind: record.kind,
                    working_dir,
                    name: Some(record.name.clone()),
                    resume: true,
                    id: Some(record.id.clone()),
                })
                .await
            {
                tracing::warn!(session_id = %record.id, error = %e, "failed to restore session");
            }
        }
    }

    pub async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<()> {
        let guard = self.entries.read().await;
        let entry = guard
            .get(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        if let Some(handle) = &entry.handle {
            handle.write(bytes).await;
        }
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let guard = self.entries.read().await;
        let entry = guard
            .get(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        if let Some(handle) = &entry.handle {
            handle.resize(cols, rows).await;
        }
        Ok(())
    }

    /// Sorted by `last_activity`, most recently active first.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.entries.read().await.values().map(|e| e.session.clone()).collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.entries.read().await.get(id).map(|e| e.session.clone())
    }

    /// Sets the shutdown flag (suppressing further event emission) then
    /// kills every live PTY, per §4.7's shutdown contract.
    pub async fn close_all(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let handle = {
                let mut guard = self.entries.write().await;
                guard.get_mut(&id).and_then(|e| e.handle.take())
            };
            if let Some(handle) = handle {
                handle.kill().await;
            }
        }
    }

    async fn compose_name(&self, kind: SessionKind) -> String {
        let mut counters = self.counters.write().await;
        let counter = counters.entry(kind.as_str()).or_insert(0);
        *counter += 1;
        format!("{}-{}", kind.as_str(), counter)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn assistant_for(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::KindA => "claude",
        SessionKind::KindB => "copilot",
    }
}

#[allow(dead_code)]
fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "session".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compose_name_increments_per_kind() {
        let sup = Supervisor::new();
        assert_eq!(sup.compose_name(SessionKind::KindA).await, "kind-a-1");
        assert_eq!(sup.compose_name(SessionKind::KindA).await, "kind-a-2");
        assert_eq!(sup.compose_name(SessionKind::KindB).await, "kind-b-1");
    }

    #[tokio::test]
    async fn operations_on_unknown_id_return_not_found() {
        let sup = Supervisor::new();
        assert!(sup.close("missing").await.is_err());
        assert!(sup.remove("missing").await.is_err());
        assert!(sup.restart("missing").await.is_err());
        assert!(sup.get("missing").await.is_none());
    }
}
