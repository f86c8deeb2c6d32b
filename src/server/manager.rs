//! One live session and the viewers connected to it

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Listener, ListenerId};
use crate::error::SessionError;
use crate::event::{Event, EventKind};
use crate::session::Session;
use crate::state::{SaveMeta, SessionMeta, SessionSnapshot};

/// Save index shared between the server and its managers
pub(crate) type SaveIndex = Arc<RwLock<HashMap<String, SaveMeta>>>;

/// Identifies a connected viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

type Viewers = Arc<Mutex<Vec<(ViewerId, mpsc::UnboundedSender<String>)>>>;

/// Owns a live session's inbox, its chat loop and its viewers.
///
/// Every event the session dispatches, stream deltas included, goes to every
/// viewer as one JSON text frame.
pub struct SessionManager {
    session: Arc<Session>,
    inbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    chat: tokio::sync::Mutex<Option<JoinHandle<Result<(), SessionError>>>>,
    viewers: Viewers,
    next_viewer: AtomicU64,
    listener: ListenerId,
}

impl SessionManager {
    /// Attach to `session` and start its chat loop
    pub(crate) async fn start(session: Session, saves: SaveIndex) -> Result<Arc<Self>, SessionError> {
        let session = Arc::new(session);
        session.ensure_init().await?;

        let viewers: Viewers = Arc::new(Mutex::new(Vec::new()));
        let listener = session.add_listener(Arc::new(Broadcast {
            session: Arc::downgrade(&session),
            viewers: Arc::clone(&viewers),
            saves: Arc::clone(&saves),
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let chat = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.chat_from_queue(rx).await })
        };

        let manager = Arc::new(Self {
            session,
            inbox: Mutex::new(Some(tx)),
            chat: tokio::sync::Mutex::new(Some(chat)),
            viewers,
            next_viewer: AtomicU64::new(1),
            listener,
        });
        manager.session.context().bus().flush().await;
        let meta = manager.save_meta().await;
        saves.write().insert(manager.id().to_string(), meta);
        info!(session_id = %manager.id(), "Started live session");
        Ok(manager)
    }

    pub fn id(&self) -> &str {
        self.session.id().as_str()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn state(&self) -> SessionSnapshot {
        self.session.snapshot().await
    }

    pub async fn meta(&self) -> SessionMeta {
        self.session.meta().await
    }

    pub async fn save_meta(&self) -> SaveMeta {
        save_meta_of(&self.session).await
    }

    /// Queue a user message for the chat loop
    pub fn send(&self, content: impl Into<String>) -> bool {
        match self.inbox.lock().as_ref() {
            Some(tx) => tx.send(content.into()).is_ok(),
            None => false,
        }
    }

    /// Register a viewer; it receives every event from now on
    pub fn connect(&self, tx: mpsc::UnboundedSender<String>) -> ViewerId {
        let id = ViewerId(self.next_viewer.fetch_add(1, Ordering::Relaxed));
        self.viewers.lock().push((id, tx));
        debug!(session_id = %self.id(), viewer = id.0, "Viewer connected");
        id
    }

    /// Stop sending events to a viewer
    pub fn disconnect(&self, id: ViewerId) {
        self.viewers.lock().retain(|(viewer, _)| *viewer != id);
        debug!(session_id = %self.id(), viewer = id.0, "Viewer disconnected");
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Stop accepting messages, let the chat loop drain, then close the
    /// session
    pub async fn close(&self) -> Result<(), SessionError> {
        self.inbox.lock().take();
        if let Some(chat) = self.chat.lock().await.take() {
            match chat.await {
                Ok(result) => result?,
                Err(e) => warn!(session_id = %self.id(), error = %e, "Chat loop ended abnormally"),
            }
        }
        self.session.remove_listener(self.listener);
        self.viewers.lock().clear();
        self.session.close().await
    }
}

async fn save_meta_of(session: &Session) -> SaveMeta {
    let logger = session.logger();
    let log_dir = logger.log_dir();
    SaveMeta {
        meta: session.meta().await,
        grouping_prefix: log_dir
            .parent()
            .map(|p| p.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect())
            .unwrap_or_default(),
        state_path: logger.state_path(),
        event_path: logger.event_path(),
    }
}

struct Broadcast {
    session: Weak<Session>,
    viewers: Viewers,
    saves: SaveIndex,
}

#[async_trait]
impl Listener for Broadcast {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        let frame = serde_json::to_string(event)?;
        self.viewers.lock().retain(|(id, tx)| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                debug!(viewer = id.0, "Dropping dead viewer");
            }
            alive
        });

        if let EventKind::RoundComplete { session_id } = &event.kind {
            if let Some(session) = self.session.upgrade() {
                let meta = save_meta_of(&session).await;
                self.saves.write().insert(session_id.to_string(), meta);
            }
        }
        Ok(())
    }
}
