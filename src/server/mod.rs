//! Save browser and live-session host
//!
//! [`SessionServer`] indexes saved sessions under a set of directories and
//! hosts live sessions, each wrapped in a [`SessionManager`]. [`http`] puts
//! an axum router in front of it.

pub mod http;
pub mod indexer;
pub mod manager;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

pub use indexer::find_saves;
pub use manager::{SessionManager, ViewerId};

use crate::config::{default_save_dir, SessionConfig};
use crate::error::ServerError;
use crate::ids::SessionId;
use crate::logger::{read_jsonl, read_snapshot};
use crate::session::{LoadMode, Session};
use crate::state::{SaveMeta, SessionMeta, SessionSnapshot};
use manager::SaveIndex;

/// Builds the configuration of each new live session
pub trait SessionFactory: Send + Sync {
    fn config(&self) -> SessionConfig;
}

impl<F> SessionFactory for F
where
    F: Fn() -> SessionConfig + Send + Sync,
{
    fn config(&self) -> SessionConfig {
        self()
    }
}

pub struct SessionServer {
    save_dirs: Vec<PathBuf>,
    /// Where new and forked sessions write their logs
    session_root: PathBuf,
    saves: SaveIndex,
    sessions: RwLock<HashMap<String, Arc<SessionManager>>>,
    factory: Option<Arc<dyn SessionFactory>>,
}

impl SessionServer {
    /// A server over `save_dirs` that can browse saves but not run sessions.
    ///
    /// New sessions are written under the first save directory, or the
    /// default save directory when there is none.
    pub fn new(save_dirs: Vec<PathBuf>) -> Self {
        let session_root = save_dirs.first().cloned().unwrap_or_else(default_save_dir);
        Self {
            save_dirs,
            session_root,
            saves: Arc::default(),
            sessions: RwLock::new(HashMap::new()),
            factory: None,
        }
    }

    pub fn with_factory(mut self, factory: impl SessionFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn save_dirs(&self) -> &[PathBuf] {
        &self.save_dirs
    }

    /// Walk every save directory and replace the index
    pub async fn reindex_saves(&self) -> Result<usize, ServerError> {
        let dirs = self.save_dirs.clone();
        let found = tokio::task::spawn_blocking(move || {
            dirs.iter()
                .flat_map(|dir| find_saves(dir))
                .map(|save| (save.meta.id.to_string(), save))
                .collect::<HashMap<_, _>>()
        })
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;

        let count = found.len();
        *self.saves.write() = found;
        info!(saves = count, "Finished indexing saves");
        Ok(count)
    }

    // ==== saves ====

    pub fn list_saves(&self) -> Vec<SaveMeta> {
        let mut saves: Vec<SaveMeta> = self.saves.read().values().cloned().collect();
        saves.sort_by(|a, b| b.meta.last_modified.total_cmp(&a.meta.last_modified));
        saves
    }

    fn save(&self, save_id: &str) -> Result<SaveMeta, ServerError> {
        self.saves
            .read()
            .get(save_id)
            .cloned()
            .ok_or_else(|| ServerError::SaveNotFound(save_id.to_string()))
    }

    pub async fn get_save_state(&self, save_id: &str) -> Result<SessionSnapshot, ServerError> {
        let save = self.save(save_id)?;
        Ok(read_snapshot(&save.state_path).await?)
    }

    /// Raw records of a save's event log
    pub async fn get_save_events(&self, save_id: &str) -> Result<Vec<serde_json::Value>, ServerError> {
        let save = self.save(save_id)?;
        Ok(read_jsonl(&save.event_path).await?)
    }

    /// Remove a save's snapshot and log, and its directory if nothing else is
    /// left in it
    pub async fn delete_save(&self, save_id: &str) -> Result<SaveMeta, ServerError> {
        let save = self.save(save_id)?;
        for path in [&save.state_path, &save.event_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.saves.write().remove(save_id);

        if let Some(dir) = save.state_path.parent() {
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                warn!(save_id, path = %dir.display(), error = %e, "Could not fully delete save");
            }
        }
        info!(save_id, "Deleted save");
        Ok(save)
    }

    // ==== live sessions ====

    fn factory(&self) -> Result<&Arc<dyn SessionFactory>, ServerError> {
        self.factory.as_ref().ok_or(ServerError::NoFactory)
    }

    pub fn manager(&self, session_id: &str) -> Result<Arc<SessionManager>, ServerError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_states(&self) -> Vec<SessionMeta> {
        let managers: Vec<Arc<SessionManager>> = self.sessions.read().values().cloned().collect();
        join_all(managers.iter().map(|m| m.meta())).await
    }

    /// Start a new live session, optionally sending it a first message
    pub async fn create_state(&self, start_content: Option<String>) -> Result<SessionSnapshot, ServerError> {
        let mut config = self.factory()?.config();
        let id = SessionId::new();
        config.settings.log_dir = Some(self.session_root.join(id.as_str()));

        let manager = self.host(Session::with_id(id, config)).await?;
        if let Some(content) = start_content.filter(|c| !c.is_empty()) {
            manager.send(content);
        }
        Ok(manager.state().await)
    }

    /// Make a save live, either as a fork or by continuing it in place
    pub async fn load_state(&self, save_id: &str, mode: LoadMode) -> Result<SessionSnapshot, ServerError> {
        if mode == LoadMode::Continue {
            if let Ok(manager) = self.manager(save_id) {
                return Ok(manager.state().await);
            }
        }
        let save = self.save(save_id)?;
        let save_dir = save
            .state_path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| ServerError::SaveNotFound(save_id.to_string()))?;

        let mut config = self.factory()?.config();
        let fork_id = SessionId::new();
        config.settings.log_dir = Some(self.session_root.join(fork_id.as_str()));
        let session = Session::load_as(config, &save_dir, mode, fork_id).await?;

        let manager = self.host(session).await?;
        Ok(manager.state().await)
    }

    async fn host(&self, session: Session) -> Result<Arc<SessionManager>, ServerError> {
        let manager = SessionManager::start(session, Arc::clone(&self.saves)).await?;
        self.sessions
            .write()
            .insert(manager.id().to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn get_state(&self, session_id: &str) -> Result<SessionSnapshot, ServerError> {
        Ok(self.manager(session_id)?.state().await)
    }

    /// Attach a viewer to a live session
    pub fn connect(
        &self,
        session_id: &str,
        tx: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<(Arc<SessionManager>, ViewerId), ServerError> {
        let manager = self.manager(session_id)?;
        let viewer = manager.connect(tx);
        Ok((manager, viewer))
    }

    pub fn send(&self, session_id: &str, content: impl Into<String>) -> Result<(), ServerError> {
        let manager = self.manager(session_id)?;
        if !manager.send(content) {
            return Err(ServerError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Close every live session
    pub async fn close(&self) {
        let managers: Vec<Arc<SessionManager>> = self.sessions.write().drain().map(|(_, m)| m).collect();
        for (manager, result) in managers.iter().zip(join_all(managers.iter().map(|m| m.close())).await) {
            if let Err(e) = result {
                warn!(session_id = %manager.id(), error = %e, "Error closing session");
            }
        }
        info!(sessions = managers.len(), "Server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use crate::testing::ScriptedEngine;
    use std::time::Duration;
    use tempfile::TempDir;

    fn server(dir: &std::path::Path) -> SessionServer {
        SessionServer::new(vec![dir.to_path_buf()]).with_factory(|| {
            SessionConfig::new(Arc::new(ScriptedEngine::responding(|_, _| ChatMessage::assistant("ok"))))
                .delegation_scheme(None)
                .root_system_prompt(None)
        })
    }

    async fn wait_for_round(server: &SessionServer, id: &str) {
        let manager = server.manager(id).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.connect(tx);
        manager.send("hello");
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if frame.contains("\"round_complete\"") {
                break;
            }
        }
        manager.session().write_snapshot().await.unwrap();
    }

    #[tokio::test]
    async fn test_without_factory_sessions_are_refused() {
        let tmp = TempDir::new().unwrap();
        let server = SessionServer::new(vec![tmp.path().to_path_buf()]);
        assert!(matches!(server.create_state(None).await, Err(ServerError::NoFactory)));
        assert!(matches!(server.get_state("nope").await, Err(ServerError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_index_fork_and_delete() {
        let tmp = TempDir::new().unwrap();
        let server = server(tmp.path());

        let created = server.create_state(None).await.unwrap();
        let id = created.meta.id.to_string();
        assert_eq!(created.state.len(), 1);
        assert_eq!(server.list_states().await.len(), 1);

        wait_for_round(&server, &id).await;
        assert_eq!(server.reindex_saves().await.unwrap(), 1);
        let events = server.get_save_events(&id).await.unwrap();
        assert!(events.iter().any(|e| e["type"] == "round_complete"));
        assert_eq!(server.get_save_state(&id).await.unwrap().state[0].chat_history.len(), 2);

        let forked = server.load_state(&id, LoadMode::Fork).await.unwrap();
        assert_ne!(forked.meta.id.to_string(), id);
        assert_eq!(forked.state[0].chat_history.len(), 2);
        assert_eq!(server.list_states().await.len(), 2);

        let continued = server.load_state(&id, LoadMode::Continue).await.unwrap();
        assert_eq!(continued.meta.id.to_string(), id);
        assert_eq!(server.list_states().await.len(), 2);

        server.close().await;
        assert!(server.list_states().await.is_empty());

        let deleted = server.delete_save(&id).await.unwrap();
        assert!(!deleted.state_path.exists());
        assert!(!tmp.path().join(&id).exists());
        assert!(matches!(server.delete_save(&id).await, Err(ServerError::SaveNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_keeps_directory_with_other_files() {
        let tmp = TempDir::new().unwrap();
        let server = server(tmp.path());
        let id = server.create_state(None).await.unwrap().meta.id.to_string();
        wait_for_round(&server, &id).await;
        server.close().await;
        std::fs::write(tmp.path().join(&id).join("notes.txt"), "keep me").unwrap();
        server.reindex_saves().await.unwrap();

        server.delete_save(&id).await.unwrap();
        assert!(tmp.path().join(&id).join("notes.txt").exists());
        assert!(server.list_saves().is_empty());
    }
}
