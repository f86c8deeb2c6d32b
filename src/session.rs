//! Session management: one agent tree, one event stream
//!
//! [`SessionContext`] is the part every agent and capability can see: the
//! bus, the weak agent registry and the factories for new agents.
//! [`Session`] owns a context plus the logger, the root agent and the
//! dispatcher task, and exposes the ways to drive a conversation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentSpec};
use crate::bus::{ChannelListener, EventBus, Listener, ListenerId};
use crate::config::{default_save_dir, DelegationScheme, SessionConfig, SessionSettings, TitleSetting};
use crate::engine::Engine;
use crate::error::{AgentError, SessionError};
use crate::event::{Event, EventKind};
use crate::hierarchy::AgentHierarchy;
use crate::ids::{AgentId, SessionId};
use crate::logger::{self, EventLogger, EVENTS_FILE, STATE_FILE};
use crate::message::{ChatMessage, ChatRole};
use crate::state::{AgentSnapshot, SessionMeta, SessionSnapshot};

/// Shared state of one session, visible to every agent in it
pub struct SessionContext {
    id: SessionId,
    config: SessionConfig,
    bus: EventBus,
    hierarchy: RwLock<AgentHierarchy>,
    title: RwLock<Option<String>>,
    /// Restored agents whose parent has no delegator to hold them
    retained: Mutex<Vec<Arc<Agent>>>,
}

impl SessionContext {
    pub fn new(id: SessionId, config: SessionConfig) -> Arc<Self> {
        let title = match &config.settings.title {
            TitleSetting::Fixed(title) => Some(title.clone()),
            _ => None,
        };
        Arc::new(Self {
            id,
            config,
            bus: EventBus::new(),
            hierarchy: RwLock::new(AgentHierarchy::new()),
            title: RwLock::new(title),
            retained: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.config.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn dispatch(&self, event: Event) {
        self.bus.dispatch(event);
    }

    pub fn title(&self) -> Option<String> {
        self.title.read().clone()
    }

    pub fn set_title(&self, title: Option<String>) {
        *self.title.write() = title;
    }

    // ==== registry ====

    /// A live agent by id
    pub fn agent(&self, id: &AgentId) -> Option<Arc<Agent>> {
        self.hierarchy.read().get(id)
    }

    pub fn is_alive(&self, id: &AgentId) -> bool {
        self.hierarchy.read().is_alive(id)
    }

    /// The root agent, once created
    pub fn root_agent(&self) -> Option<Arc<Agent>> {
        let hierarchy = self.hierarchy.read();
        hierarchy.root().and_then(|id| hierarchy.get(&id))
    }

    /// Every agent still alive, parents before children
    pub fn live_agents(&self) -> Vec<Arc<Agent>> {
        self.hierarchy.read().live_agents()
    }

    /// Snapshots of every live agent, root first, depth-first
    pub fn snapshot_agents(&self) -> Vec<AgentSnapshot> {
        self.live_agents().iter().map(|a| a.snapshot()).collect()
    }

    /// Record `agent` in the registry and under its parent. With `announce`,
    /// also dispatch its spawn event.
    pub(crate) fn register_agent(&self, agent: &Arc<Agent>, announce: bool) {
        self.hierarchy.write().add_agent(agent);
        if let Some(parent) = agent.parent() {
            parent.add_child(agent.id);
        }
        if announce {
            self.dispatch(Event::spawn(agent.snapshot()));
        }
        debug!(session_id = %self.id, agent_id = %agent.id, name = %agent.name, "Registered agent");
    }

    pub(crate) fn retain(&self, agent: Arc<Agent>) {
        self.retained.lock().push(agent);
    }

    // ==== factories ====

    fn delegation_at(&self, depth: usize) -> Option<DelegationScheme> {
        self.settings()
            .delegation_scheme
            .filter(|_| depth < self.settings().max_delegation_depth)
    }

    pub(crate) fn root_spec(&self) -> AgentSpec {
        let settings = self.settings();
        let mut spec = AgentSpec::new(settings.root_name.clone(), Arc::clone(&self.config.root_engine));
        spec.system_prompt = self.config.root_system_prompt.clone();
        spec.tools = self
            .config
            .tools
            .iter()
            .filter(|t| t.for_root(settings.root_has_tools))
            .cloned()
            .collect();
        spec.delegation = self.delegation_at(0);
        spec.max_function_rounds = settings.max_function_rounds;
        spec
    }

    pub(crate) fn delegate_spec(&self, parent: &Arc<Agent>, name: String) -> AgentSpec {
        let mut spec = AgentSpec::new(name, Arc::clone(&self.config.delegate_engine));
        spec.parent = Some(Arc::clone(parent));
        spec.system_prompt = self.config.delegate_system_prompt.clone();
        spec.tools = self.config.tools.iter().filter(|t| t.for_delegate()).cloned().collect();
        spec.delegation = self.delegation_at(parent.depth + 1);
        spec.max_function_rounds = self.settings().max_function_rounds;
        spec
    }

    /// Build and announce the root agent
    pub(crate) async fn create_root(self: &Arc<Self>) -> Result<Arc<Agent>, AgentError> {
        let root = Agent::build(self, self.root_spec()).await?;
        self.register_agent(&root, true);
        Ok(root)
    }

    /// Build and announce a new child of `parent`
    pub(crate) async fn create_delegate(
        self: &Arc<Self>,
        parent: &Arc<Agent>,
        name: String,
    ) -> Result<Arc<Agent>, AgentError> {
        let child = Agent::build(self, self.delegate_spec(parent, name)).await?;
        self.register_agent(&child, true);
        info!(
            session_id = %self.id,
            agent_id = %child.id,
            parent = %parent.id,
            depth = child.depth,
            "Spawned delegate"
        );
        Ok(child)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("title", &self.title())
            .finish_non_exhaustive()
    }
}

/// Whether a loaded save writes to a new session or keeps writing to itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Copy the log forward under a new session id; the save is untouched
    Fork,
    /// Append to the save's own log
    Continue,
}

struct Runtime {
    root: Arc<Agent>,
    dispatcher: Option<JoinHandle<()>>,
}

/// One conversation: an agent tree, its event stream and its log
pub struct Session {
    ctx: Arc<SessionContext>,
    logger: Arc<EventLogger>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
    closed: AtomicBool,
    title_listener: Option<Arc<TitleListener>>,
}

impl Session {
    /// Create a session; nothing runs until the first query
    pub fn new(config: SessionConfig) -> Self {
        Self::with_id(SessionId::new(), config)
    }

    pub fn with_id(id: SessionId, config: SessionConfig) -> Self {
        let log_dir = config
            .settings
            .log_dir
            .clone()
            .unwrap_or_else(|| default_save_dir().join(id.as_str()));
        let logger = Arc::new(EventLogger::new(log_dir, config.settings.clear_existing_log));
        let autogenerate = config.settings.title == TitleSetting::Autogenerate;

        let ctx = SessionContext::new(id, config);
        ctx.bus().add_listener(Arc::clone(&logger) as Arc<dyn Listener>);
        let title_listener = autogenerate.then(|| TitleListener::install(&ctx));

        info!(session_id = %ctx.id(), log_dir = %logger.log_dir().display(), "Creating new session");
        Self {
            ctx,
            logger,
            runtime: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            title_listener,
        }
    }

    pub fn id(&self) -> &SessionId {
        self.ctx.id()
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn logger(&self) -> &Arc<EventLogger> {
        &self.logger
    }

    pub fn title(&self) -> Option<String> {
        self.ctx.title()
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.ctx.bus().add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ctx.bus().remove_listener(id)
    }

    pub fn dispatch(&self, event: Event) {
        self.ctx.dispatch(event);
    }

    /// The root agent, if the session has been initialized
    pub fn root_agent(&self) -> Option<Arc<Agent>> {
        self.ctx.root_agent()
    }

    /// Carry root message counts of an existing log over to the title
    /// listener. Must run before the dispatcher starts.
    async fn seed_title_count(&self) {
        if let Some(listener) = &self.title_listener {
            self.logger.event_count().await;
            listener
                .root_messages
                .store(self.logger.count_of("root_message"), Ordering::Release);
        }
    }

    /// Build the root and start the dispatcher, once.
    ///
    /// Concurrent callers all get the same root.
    pub async fn ensure_init(&self) -> Result<Arc<Agent>, SessionError> {
        let mut runtime = self.runtime.lock().await;
        if let Some(runtime) = runtime.as_ref() {
            return Ok(Arc::clone(&runtime.root));
        }
        let root = self.ctx.create_root().await?;
        self.seed_title_count().await;
        let dispatcher = self.ctx.bus().start();
        *runtime = Some(Runtime {
            root: Arc::clone(&root),
            dispatcher,
        });
        info!(session_id = %self.id(), root = %root.id, "Session initialized");
        Ok(root)
    }

    /// Run one round for `text` and stream the loggable events it produces.
    ///
    /// The stream ends with this session's `RoundComplete`; a failed round
    /// surfaces as an error from the call after it.
    pub async fn query(&self, text: &str) -> Result<Query, SessionError> {
        let root = self.ensure_init().await?;
        // events from before this call must not leak into the stream
        self.ctx.bus().flush().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.ctx.bus().add_listener(Arc::new(ChannelListener::new(tx)));

        let ctx = Arc::clone(&self.ctx);
        let text = text.to_string();
        let task = tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(root.full_round(&text))
                .catch_unwind()
                .await;
            ctx.dispatch(Event::round_complete(ctx.id().clone()));
            match outcome {
                Ok(result) => result.map(|_| ()).map_err(SessionError::from),
                Err(_) => Err(SessionError::RoundTask("round panicked".into())),
            }
        });

        Ok(Query {
            ctx: Arc::clone(&self.ctx),
            rx,
            listener: Some(listener),
            task: Some(task),
            outcome: None,
        })
    }

    /// Live loop: run one round per message received on `inbox` until it
    /// closes, autosaving after each.
    ///
    /// A failed round is logged and reported as an `Error` event; the loop
    /// keeps going.
    pub async fn chat_from_queue(&self, mut inbox: mpsc::UnboundedReceiver<String>) -> Result<(), SessionError> {
        let root = self.ensure_init().await?;
        while let Some(content) = inbox.recv().await {
            info!(session_id = %self.id(), "Message from queue");
            if let Err(e) = root.full_round_stream(&content).await {
                error!(session_id = %self.id(), error = %e, "Error in live chat round");
                self.dispatch(Event::error(e.to_string()));
            }
            self.finish_round().await;
        }
        debug!(session_id = %self.id(), "Inbox closed");
        Ok(())
    }

    /// Interactive loop on stdin and stdout
    pub async fn chat_in_terminal(&self) -> Result<(), SessionError> {
        self.chat_with_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Interactive loop over any line reader and writer; ends at end of input
    pub async fn chat_with_io<R, W>(&self, reader: R, mut writer: W) -> Result<(), SessionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let root = self.ensure_init().await?;
        let mut lines = reader.lines();
        loop {
            writer.write_all(b"USER: ").await?;
            writer.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let query = line.trim();
            if query.is_empty() {
                continue;
            }

            match root.full_round_stream(query).await {
                Ok(messages) => {
                    for message in messages.iter().filter(|m| m.role == ChatRole::Assistant) {
                        for call in message.tool_calls.iter().flatten() {
                            let line = format!("AI: Thinking ({}: {})\n", call.function.name, call.function.arguments);
                            writer.write_all(line.as_bytes()).await?;
                        }
                        if let Some(text) = message.text() {
                            writer.write_all(format!("AI: {}\n", text).as_bytes()).await?;
                        }
                    }
                }
                Err(e) => {
                    error!(session_id = %self.id(), error = %e, "Error in terminal chat round");
                    self.dispatch(Event::error(e.to_string()));
                    writer.write_all(format!("ERROR: {}\n", e).as_bytes()).await?;
                }
            }
            writer.flush().await?;
            self.finish_round().await;
        }
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn finish_round(&self) {
        self.dispatch(Event::round_complete(self.id().clone()));
        if let Err(e) = self.write_snapshot().await {
            warn!(session_id = %self.id(), error = %e, "Autosave failed");
        }
    }

    pub async fn meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.id().clone(),
            title: self.title(),
            last_modified: self.logger.last_modified(),
            n_events: self.logger.event_count().await,
        }
    }

    /// Current state of every live agent
    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut meta = self.meta().await;
        meta.last_modified = crate::event::now_timestamp();
        SessionSnapshot {
            meta,
            state: self.ctx.snapshot_agents(),
        }
    }

    /// Deliver pending events, then save the snapshot
    pub async fn write_snapshot(&self) -> Result<(), SessionError> {
        self.ctx.bus().flush().await;
        let snapshot = self.snapshot().await;
        self.logger.write_snapshot(&snapshot).await?;
        Ok(())
    }

    /// Deliver pending events, stop the dispatcher, then close the logger and
    /// every live agent. Later calls do nothing.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ctx.bus().flush().await;
        let agents = self.ctx.live_agents();
        let snapshot = self.snapshot().await;

        let runtime = self.runtime.lock().await.take();
        if let Some(dispatcher) = runtime.as_ref().and_then(|r| r.dispatcher.as_ref()) {
            dispatcher.abort();
        }

        let (logged, _) = tokio::join!(
            self.logger.close(&snapshot),
            join_all(agents.iter().map(|agent| agent.close()))
        );
        info!(session_id = %self.id(), agents = agents.len(), "Closed session");
        drop(runtime);
        logged?;
        Ok(())
    }

    /// Rebuild a session from the save in `save_dir`.
    ///
    /// The tree is rebuilt depth-first from the snapshot, each agent with its
    /// saved history; no events are dispatched for the rebuilt agents.
    pub async fn load(config: SessionConfig, save_dir: &Path, mode: LoadMode) -> Result<Session, SessionError> {
        Self::load_as(config, save_dir, mode, SessionId::new()).await
    }

    /// [`Session::load`], naming a fork `fork_id`. Ignored when continuing.
    pub async fn load_as(
        config: SessionConfig,
        save_dir: &Path,
        mode: LoadMode,
        fork_id: SessionId,
    ) -> Result<Session, SessionError> {
        let snapshot = logger::read_snapshot(&save_dir.join(STATE_FILE)).await?;

        let mut config = config;
        config.settings.clear_existing_log = false;
        let id = match mode {
            LoadMode::Continue => {
                config.settings.log_dir = Some(save_dir.to_path_buf());
                snapshot.meta.id.clone()
            }
            LoadMode::Fork => {
                let id = fork_id;
                let mut log_dir: PathBuf = config
                    .settings
                    .log_dir
                    .clone()
                    .unwrap_or_else(|| default_save_dir().join(id.as_str()));
                if same_dir(&log_dir, save_dir).await {
                    let fresh = save_dir
                        .parent()
                        .map_or_else(default_save_dir, Path::to_path_buf)
                        .join(id.as_str());
                    warn!(
                        save_dir = %save_dir.display(),
                        log_dir = %fresh.display(),
                        "Fork target is the save being forked; writing the fork beside it"
                    );
                    log_dir = fresh;
                }
                let source = save_dir.join(EVENTS_FILE);
                if tokio::fs::try_exists(&source).await? {
                    tokio::fs::create_dir_all(&log_dir).await?;
                    tokio::fs::copy(&source, log_dir.join(EVENTS_FILE)).await?;
                }
                config.settings.log_dir = Some(log_dir);
                id
            }
        };

        let session = Session::with_id(id, config);
        if session.title().is_none() {
            session.ctx.set_title(snapshot.meta.title.clone());
        }
        let root = session.restore_tree(&snapshot).await?;
        session.seed_title_count().await;
        let dispatcher = session.ctx.bus().start();
        *session.runtime.lock().await = Some(Runtime { root, dispatcher });

        info!(
            session_id = %session.id(),
            from = %snapshot.meta.id,
            agents = snapshot.state.len(),
            mode = ?mode,
            "Loaded session"
        );
        Ok(session)
    }

    async fn restore_tree(&self, snapshot: &SessionSnapshot) -> Result<Arc<Agent>, SessionError> {
        let saved = snapshot
            .root()
            .ok_or_else(|| SessionError::MissingRoot(snapshot.meta.id.clone()))?;
        let find = |id: &AgentId| snapshot.state.iter().find(|a| a.id == *id);

        let mut spec = self.ctx.root_spec();
        apply_saved(&mut spec, saved);
        let root = Agent::build(&self.ctx, spec).await?;
        self.ctx.register_agent(&root, false);

        let mut stack: Vec<(&AgentSnapshot, Arc<Agent>)> = saved
            .children
            .iter()
            .rev()
            .filter_map(|id| find(id))
            .map(|child| (child, Arc::clone(&root)))
            .collect();
        while let Some((saved, parent)) = stack.pop() {
            let mut spec = self.ctx.delegate_spec(&parent, saved.name.clone());
            apply_saved(&mut spec, saved);
            let agent = Agent::build(&self.ctx, spec).await?;
            self.ctx.register_agent(&agent, false);

            for child in saved.children.iter().rev().filter_map(|id| find(id)) {
                stack.push((child, Arc::clone(&agent)));
            }
            match parent.delegator() {
                Some(delegator) => delegator.adopt(agent),
                None => self.ctx.retain(agent),
            }
        }
        Ok(root)
    }
}

/// Whether two paths name the same existing directory
async fn same_dir(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn apply_saved(spec: &mut AgentSpec, saved: &AgentSnapshot) {
    spec.id = saved.id;
    spec.name = saved.name.clone();
    spec.always_included = saved.always_included_messages.clone();
    spec.chat_history = saved.chat_history.clone();
}

/// Events of one [`Session::query`] call
pub struct Query {
    ctx: Arc<SessionContext>,
    rx: mpsc::UnboundedReceiver<Event>,
    listener: Option<ListenerId>,
    task: Option<JoinHandle<Result<(), SessionError>>>,
    outcome: Option<Result<(), SessionError>>,
}

impl Query {
    /// Next loggable event, or `None` after `RoundComplete` was yielded
    pub async fn next(&mut self) -> Result<Option<Event>, SessionError> {
        if let Some(outcome) = self.outcome.take() {
            return outcome.map(|_| None);
        }
        if self.listener.is_none() {
            return Ok(None);
        }
        while let Some(event) = self.rx.recv().await {
            if event.is_round_complete_for(self.ctx.id()) {
                self.outcome = Some(self.finish().await);
                return Ok(Some(event));
            }
            if event.is_loggable() {
                return Ok(Some(event));
            }
        }
        self.finish().await.map(|_| None)
    }

    /// Drain the whole stream
    pub async fn collect(mut self) -> Result<Vec<Event>, SessionError> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }

    async fn finish(&mut self) -> Result<(), SessionError> {
        if let Some(id) = self.listener.take() {
            self.ctx.bus().remove_listener(id);
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| SessionError::RoundTask(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.ctx.bus().remove_listener(id);
        }
    }
}

const TITLE_INTRO: &str = "Here is the start of a conversation:";
const TITLE_REQUEST: &str =
    "Come up with a punchy title for this conversation.\n\nReply with your answer only and be specific.";
const TITLE_AFTER_ROOT_MESSAGES: u64 = 4;

/// Names the session once the root has a few exchanges behind it, then
/// removes itself
struct TitleListener {
    ctx: Weak<SessionContext>,
    engine: Arc<dyn Engine>,
    id: Mutex<Option<ListenerId>>,
    fired: AtomicBool,
    /// Root messages logged so far, including earlier runs of this save
    root_messages: AtomicU64,
}

impl TitleListener {
    fn install(ctx: &Arc<SessionContext>) -> Arc<Self> {
        let listener = Arc::new(TitleListener {
            ctx: Arc::downgrade(ctx),
            engine: Arc::clone(&ctx.config().root_engine),
            id: Mutex::new(None),
            fired: AtomicBool::new(false),
            root_messages: AtomicU64::new(0),
        });
        let id = ctx.bus().add_listener(Arc::clone(&listener) as Arc<dyn Listener>);
        *listener.id.lock() = Some(id);
        listener
    }

    async fn generate(&self, history: Vec<ChatMessage>) -> anyhow::Result<String> {
        let mut prompt = Vec::with_capacity(history.len() + 2);
        prompt.push(ChatMessage::user(TITLE_INTRO));
        prompt.extend(history);
        prompt.push(ChatMessage::user(TITLE_REQUEST));
        let completion = self.engine.predict(&prompt, &[]).await?;
        let text = completion
            .message
            .text()
            .ok_or_else(|| anyhow::anyhow!("empty title completion"))?;
        let title = text.trim_matches(|c: char| c == ' ' || c == '"');
        anyhow::ensure!(!title.is_empty(), "blank title completion");
        Ok(title.to_string())
    }
}

#[async_trait]
impl Listener for TitleListener {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        let EventKind::RootMessage { msg } = &event.kind else {
            return Ok(());
        };
        let seen = self.root_messages.fetch_add(1, Ordering::AcqRel) + 1;
        if seen < TITLE_AFTER_ROOT_MESSAGES {
            return Ok(());
        }
        if msg.role != ChatRole::Assistant || msg.text().is_none() || self.fired.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(());
        };
        if ctx.title().is_some() {
            return Ok(());
        }
        let Some(root) = ctx.root_agent() else {
            return Ok(());
        };
        let history = root.chat_history();
        if self.fired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.generate(history).await {
            Ok(title) => {
                info!(session_id = %ctx.id(), title = %title, "Generated session title");
                ctx.set_title(Some(title));
            }
            Err(e) => warn!(session_id = %ctx.id(), error = %e, "Could not generate session title"),
        }
        if let Some(id) = self.id.lock().take() {
            ctx.bus().remove_listener(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use crate::state::RunState;
    use crate::testing::ScriptedEngine;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(engine: ScriptedEngine, dir: &Path) -> SessionConfig {
        SessionConfig::new(Arc::new(engine))
            .delegation_scheme(None)
            .root_system_prompt(None)
            .delegate_system_prompt(None)
            .log_dir(dir)
    }

    /// Root delegates `find flights` and `find hotels`, waits for both, then
    /// answers; helpers answer `done: {instructions}`.
    fn delegating_engine() -> ScriptedEngine {
        ScriptedEngine::responding(|messages, _functions| {
            let last = messages.last().cloned().unwrap_or_else(|| ChatMessage::user(""));
            let first_user = messages
                .iter()
                .find(|m| m.role == ChatRole::User)
                .and_then(|m| m.text())
                .unwrap_or_default();
            if first_user.starts_with("find") {
                return ChatMessage::assistant(format!("done: {}", first_user));
            }
            match (last.role, last.name.as_deref()) {
                (ChatRole::User, _) => ChatMessage::assistant_calls(
                    Some("Splitting this up.".into()),
                    vec![
                        ToolCall::new("d1", "delegate", json!({"instructions": "find flights"})),
                        ToolCall::new("d2", "delegate", json!({"instructions": "find hotels"})),
                    ],
                ),
                (ChatRole::Function, Some("delegate")) => ChatMessage::assistant_calls(
                    None,
                    vec![ToolCall::new("w1", "wait", json!({"until": "all"}))],
                ),
                _ => ChatMessage::assistant("Here is your trip."),
            }
        })
    }

    #[tokio::test]
    async fn test_ensure_init_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let session = Arc::new(Session::new(config(ScriptedEngine::new(vec![]), tmp.path())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.ensure_init().await.unwrap().id })
            })
            .collect();
        let ids: Vec<AgentId> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(session.context().live_agents().len(), 1);
        assert!(session.context().bus().is_started());
        assert!(session.context().bus().start().is_none());
    }

    #[tokio::test]
    async fn test_query_yields_round_events_once() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![ChatMessage::assistant("hello"), ChatMessage::assistant("again")]);
        let session = Session::new(config(engine, tmp.path()));

        let events = session.query("hi").await.unwrap().collect().await.unwrap();

        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "agent_state_change",
                "agent_message",
                "root_message",
                "agent_message",
                "root_message",
                "tokens_used",
                "agent_state_change",
                "round_complete",
            ]
        );
        assert!(events.last().unwrap().is_round_complete_for(session.id()));

        // the spawn from initialization belongs to no query
        let second = session.query("more").await.unwrap().collect().await.unwrap();
        assert_eq!(second.iter().filter(|e| e.event_type() == "round_complete").count(), 1);
        assert!(second.iter().all(|e| e.event_type() != "agent_spawn"));
        assert_eq!(session.context().bus().listener_count(), 1);
    }

    #[tokio::test]
    async fn test_query_propagates_round_failure_after_round_complete() {
        let tmp = TempDir::new().unwrap();
        let session = Session::new(config(ScriptedEngine::new(vec![]), tmp.path()));

        let mut query = session.query("hi").await.unwrap();
        let mut last = None;
        let error = loop {
            match query.next().await {
                Ok(Some(event)) => last = Some(event),
                Ok(None) => panic!("round failure was swallowed"),
                Err(e) => break e,
            }
        };
        assert!(matches!(error, SessionError::Agent(AgentError::Engine(_))));
        assert_eq!(last.unwrap().event_type(), "round_complete");
        assert_eq!(session.root_agent().unwrap().state(), RunState::Errored);
    }

    #[tokio::test]
    async fn test_delegated_round_through_query() {
        let tmp = TempDir::new().unwrap();
        let config = config(delegating_engine(), tmp.path()).delegation_scheme(Some(DelegationScheme::DelegateWait));
        let session = Session::new(config);

        let events = session.query("Plan my trip").await.unwrap().collect().await.unwrap();

        let mut spawned: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::AgentSpawn(agent) => Some(agent.name.clone()),
                _ => None,
            })
            .collect();
        spawned.sort();
        assert_eq!(spawned, vec!["alpha", "beta"]);
        assert!(events.iter().all(|e| e.event_type() != "stream_delta"));

        let root = session.root_agent().unwrap();
        let wait_result = root
            .chat_history()
            .into_iter()
            .find(|m| m.name.as_deref() == Some("wait"))
            .and_then(|m| m.content)
            .unwrap();
        assert!(wait_result.contains("alpha:\ndone: find flights"));
        assert!(wait_result.contains("beta:\ndone: find hotels"));
        assert_eq!(root.last_assistant_message().unwrap().text(), Some("Here is your trip."));
        assert!(root.delegator().unwrap().pending().is_empty());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_depth_limit_removes_delegation() {
        let tmp = TempDir::new().unwrap();
        let config = config(ScriptedEngine::new(vec![]), tmp.path())
            .delegation_scheme(Some(DelegationScheme::DelegateOne))
            .max_delegation_depth(2);
        let session = Session::new(config);
        let root = session.ensure_init().await.unwrap();
        let ctx = session.context();

        let child = ctx.create_delegate(&root, "alpha".into()).await.unwrap();
        let grandchild = ctx.create_delegate(&child, "beta".into()).await.unwrap();

        assert!(root.can_delegate());
        assert!(child.can_delegate());
        assert_eq!(grandchild.depth, 2);
        assert!(!grandchild.can_delegate());
        assert!(grandchild.functions().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_after_load() {
        let tmp = TempDir::new().unwrap();
        let save_dir = tmp.path().join("save");
        let config_for = |dir: &Path| {
            config(delegating_engine(), dir).delegation_scheme(Some(DelegationScheme::DelegateWait))
        };

        let session = Session::new(config_for(&save_dir));
        session.query("Plan my trip").await.unwrap().collect().await.unwrap();
        session.write_snapshot().await.unwrap();
        let original = session.snapshot().await;
        let original_events = logger::read_event_log(&save_dir.join(EVENTS_FILE)).await.unwrap().len();
        session.close().await.unwrap();

        let fork_dir = tmp.path().join("fork");
        let forked = Session::load(config_for(&fork_dir), &save_dir, LoadMode::Fork).await.unwrap();
        let restored = forked.snapshot().await;

        assert_ne!(forked.id(), &original.meta.id);
        assert_eq!(restored.state.len(), original.state.len());
        for (a, b) in original.state.iter().zip(&restored.state) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.parent, b.parent);
            assert_eq!(a.children, b.children);
            assert_eq!(a.chat_history, b.chat_history);
            assert_eq!(b.state, RunState::Stopped);
        }
        assert_eq!(restored.meta.n_events as usize, original_events);

        let root = forked.root_agent().unwrap();
        assert_eq!(root.children().len(), 2);
        assert!(root.delegator().unwrap().pending().is_empty());

        forked.close().await.unwrap();
        let after = logger::read_event_log(&save_dir.join(EVENTS_FILE)).await.unwrap().len();
        assert_eq!(after, original_events);
    }

    #[tokio::test]
    async fn test_continue_appends_to_same_log() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::responding(|_, _| ChatMessage::assistant("sure"));
        let session = Session::new(config(engine.clone(), tmp.path()));
        session.query("one").await.unwrap().collect().await.unwrap();
        session.close().await.unwrap();
        let before = logger::read_event_log(&tmp.path().join(EVENTS_FILE)).await.unwrap().len();

        let resumed = Session::load(config(engine, tmp.path()), tmp.path(), LoadMode::Continue)
            .await
            .unwrap();
        assert_eq!(resumed.id(), session.id());
        assert_eq!(resumed.root_agent().unwrap().chat_history().len(), 2);

        resumed.query("two").await.unwrap().collect().await.unwrap();
        resumed.close().await.unwrap();
        let after = logger::read_event_log(&tmp.path().join(EVENTS_FILE)).await.unwrap();
        assert!(after.len() > before);
        assert_eq!(after.iter().filter(|e| e.event_type() == "agent_spawn").count(), 1);
    }

    #[tokio::test]
    async fn test_continue_after_crash_mid_record() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::responding(|_, _| ChatMessage::assistant("sure"));
        let session = Session::new(config(engine.clone(), tmp.path()));
        session.query("one").await.unwrap().collect().await.unwrap();
        session.close().await.unwrap();
        let log_path = tmp.path().join(EVENTS_FILE);
        let before = logger::read_event_log(&log_path).await.unwrap().len();

        let mut data = std::fs::read(&log_path).unwrap();
        data.extend_from_slice(b"{\"type\": \"agent_mes");
        std::fs::write(&log_path, data).unwrap();

        let resumed = Session::load(config(engine, tmp.path()), tmp.path(), LoadMode::Continue)
            .await
            .unwrap();
        resumed.query("two").await.unwrap().collect().await.unwrap();
        resumed.close().await.unwrap();

        let after = logger::read_event_log(&log_path).await.unwrap();
        assert!(after.len() > before);
        assert_eq!(
            after.iter().filter(|e| e.event_type() == "round_complete").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_fork_into_own_directory_leaves_save_untouched() {
        let tmp = TempDir::new().unwrap();
        let save_dir = tmp.path().join("save");
        let engine = ScriptedEngine::responding(|_, _| ChatMessage::assistant("sure"));
        let session = Session::new(config(engine.clone(), &save_dir));
        session.query("one").await.unwrap().collect().await.unwrap();
        session.close().await.unwrap();
        let log_before = std::fs::read(save_dir.join(EVENTS_FILE)).unwrap();
        let state_before = std::fs::read(save_dir.join(STATE_FILE)).unwrap();

        let fork_id = SessionId::from("fork-1");
        let forked = Session::load_as(config(engine, &save_dir), &save_dir, LoadMode::Fork, fork_id)
            .await
            .unwrap();
        assert_eq!(forked.logger().log_dir(), tmp.path().join("fork-1").as_path());
        forked.query("two").await.unwrap().collect().await.unwrap();
        forked.close().await.unwrap();

        assert_eq!(std::fs::read(save_dir.join(EVENTS_FILE)).unwrap(), log_before);
        assert_eq!(std::fs::read(save_dir.join(STATE_FILE)).unwrap(), state_before);
        let fork_events = logger::read_event_log(&tmp.path().join("fork-1").join(EVENTS_FILE))
            .await
            .unwrap();
        assert!(fork_events.len() > logger::read_event_log(&save_dir.join(EVENTS_FILE)).await.unwrap().len());
    }

    #[tokio::test]
    async fn test_load_without_root_fails() {
        let tmp = TempDir::new().unwrap();
        let snapshot = SessionSnapshot {
            meta: SessionMeta {
                id: SessionId::from("orphans"),
                title: None,
                last_modified: 0.0,
                n_events: 0,
            },
            state: vec![],
        };
        std::fs::write(tmp.path().join(STATE_FILE), serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let result = Session::load(
            config(ScriptedEngine::new(vec![]), tmp.path()),
            tmp.path(),
            LoadMode::Continue,
        )
        .await;
        assert!(matches!(result, Err(SessionError::MissingRoot(_))));
    }

    #[tokio::test]
    async fn test_title_generated_after_enough_messages() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::responding(|messages, _| {
            if messages.last().and_then(|m| m.text()) == Some(TITLE_REQUEST) {
                ChatMessage::assistant(" \"Trip Planning\" ")
            } else {
                ChatMessage::assistant("noted")
            }
        });
        let session = Session::new(config(engine, tmp.path()).title(TitleSetting::Autogenerate));

        session.query("one").await.unwrap().collect().await.unwrap();
        session.context().bus().flush().await;
        assert_eq!(session.title(), None);

        session.query("two").await.unwrap().collect().await.unwrap();
        session.context().bus().flush().await;
        assert_eq!(session.title().as_deref(), Some("Trip Planning"));
        // logger only; the title listener removed itself
        assert_eq!(session.context().bus().listener_count(), 1);
    }

    #[tokio::test]
    async fn test_title_counts_root_messages_from_earlier_runs() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::responding(|messages, _| {
            if messages.last().and_then(|m| m.text()) == Some(TITLE_REQUEST) {
                ChatMessage::assistant("Resumed Chat")
            } else {
                ChatMessage::assistant("noted")
            }
        });
        let session = Session::new(config(engine.clone(), tmp.path()));
        session.query("one").await.unwrap().collect().await.unwrap();
        session.close().await.unwrap();

        let resumed = Session::load(
            config(engine, tmp.path()).title(TitleSetting::Autogenerate),
            tmp.path(),
            LoadMode::Continue,
        )
        .await
        .unwrap();
        assert_eq!(resumed.title(), None);
        resumed.query("two").await.unwrap().collect().await.unwrap();
        resumed.context().bus().flush().await;

        assert_eq!(resumed.title().as_deref(), Some("Resumed Chat"));
        assert_eq!(resumed.logger().count_of("root_message"), 4);
    }

    #[tokio::test]
    async fn test_title_failure_is_swallowed() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![ChatMessage::assistant("a"), ChatMessage::assistant("b")]);
        let session = Session::new(config(engine, tmp.path()).title(TitleSetting::Autogenerate));

        session.query("one").await.unwrap().collect().await.unwrap();
        session.query("two").await.unwrap().collect().await.unwrap();
        session.context().bus().flush().await;

        assert_eq!(session.title(), None);
        assert_eq!(session.context().bus().listener_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_from_queue_autosaves() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![ChatMessage::assistant("first")]);
        let session = Session::new(config(engine, tmp.path()));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("hello".to_string()).unwrap();
        // the second round fails; the loop carries on
        tx.send("again".to_string()).unwrap();
        drop(tx);

        session.chat_from_queue(rx).await.unwrap();

        let saved = logger::read_snapshot(&tmp.path().join(STATE_FILE)).await.unwrap();
        assert_eq!(saved.state.len(), 1);
        assert_eq!(saved.state[0].chat_history.len(), 3);
        let events = logger::read_event_log(&tmp.path().join(EVENTS_FILE)).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.event_type() == "round_complete").count(), 2);
        assert_eq!(events.iter().filter(|e| e.event_type() == "error").count(), 1);
    }

    #[tokio::test]
    async fn test_chat_with_io() {
        let tmp = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![ChatMessage::assistant("Hi there!")]);
        let session = Session::new(config(engine, tmp.path()));
        let input: &[u8] = b"hello\n\n";
        let mut output = Vec::new();

        session.chat_with_io(input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("AI: Hi there!\n"));
    }

    #[tokio::test]
    async fn test_close_is_safe_to_repeat_and_skips_empty_sessions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("never-used");
        let session = Session::new(config(ScriptedEngine::new(vec![]), &dir));

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!dir.exists());
    }
}
