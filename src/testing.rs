//! Test doubles shared by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::agent::{Agent, AgentSpec};
use crate::bus::ChannelListener;
use crate::config::{DelegationScheme, SessionConfig};
use crate::engine::{Completion, Engine};
use crate::error::EngineError;
use crate::event::Event;
use crate::ids::SessionId;
use crate::message::ChatMessage;
use crate::session::SessionContext;
use crate::tool::{FunctionSpec, ToolConfig};

type Responder = dyn Fn(&[ChatMessage], &[FunctionSpec]) -> ChatMessage + Send + Sync;
type DelayFn = dyn Fn(&[ChatMessage]) -> Duration + Send + Sync;

#[derive(Default)]
struct Recorded {
    prompts: Vec<Vec<ChatMessage>>,
    functions: Vec<Vec<FunctionSpec>>,
}

/// Engine that replays canned completions and records what it was asked.
///
/// Either pops from a fixed script (failing once the script runs out) or
/// computes each reply with a responder closure. Every completion reports
/// 10 prompt and 5 completion tokens. Message length is the character count.
#[derive(Clone)]
pub(crate) struct ScriptedEngine {
    script: Arc<Mutex<VecDeque<ChatMessage>>>,
    responder: Option<Arc<Responder>>,
    delay: Option<Arc<DelayFn>>,
    recorded: Arc<Mutex<Recorded>>,
    context_size: usize,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ChatMessage>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            responder: None,
            delay: None,
            recorded: Arc::new(Mutex::new(Recorded::default())),
            context_size: 100_000,
        }
    }

    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&[ChatMessage], &[FunctionSpec]) -> ChatMessage + Send + Sync + 'static,
    {
        let mut engine = Self::new(Vec::new());
        engine.responder = Some(Arc::new(responder));
        engine
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    pub fn with_context_size(mut self, size: usize) -> Self {
        self.context_size = size;
        self
    }

    /// Reply without recording, for engines that wrap this one
    pub fn respond(&self, messages: &[ChatMessage], functions: &[FunctionSpec]) -> ChatMessage {
        match &self.responder {
            Some(responder) => responder(messages, functions),
            None => ChatMessage::assistant("ok"),
        }
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.recorded.lock().prompts.clone()
    }

    pub fn offered_functions(&self) -> Vec<Vec<FunctionSpec>> {
        self.recorded.lock().functions.clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn max_context_size(&self) -> usize {
        self.context_size
    }

    fn message_len(&self, message: &ChatMessage) -> usize {
        message.content.as_deref().map_or(0, |c| c.chars().count())
    }

    async fn predict(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
    ) -> Result<Completion, EngineError> {
        {
            let mut recorded = self.recorded.lock();
            recorded.prompts.push(messages.to_vec());
            recorded.functions.push(functions.to_vec());
        }
        if let Some(delay) = &self.delay {
            let wait = delay(messages);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        let message = match &self.responder {
            Some(responder) => responder(messages, functions),
            None => self
                .script
                .lock()
                .pop_front()
                .ok_or_else(|| EngineError::Request("script exhausted".into()))?,
        };
        Ok(Completion::new(message).with_usage(10, 5))
    }
}

/// Session context with a silent engine, no prompts and no delegation
pub(crate) fn test_context() -> Arc<SessionContext> {
    context_with(
        SessionConfig::new(Arc::new(ScriptedEngine::new(Vec::new())))
            .delegation_scheme(None)
            .root_system_prompt(None)
            .delegate_system_prompt(None),
    )
}

pub(crate) fn context_with(config: SessionConfig) -> Arc<SessionContext> {
    SessionContext::new(SessionId::new(), config)
}

/// [`test_context`] with a running bus that copies every event into the
/// returned receiver
pub(crate) fn recording_context() -> (Arc<SessionContext>, mpsc::UnboundedReceiver<Event>) {
    let ctx = test_context();
    let rx = record(&ctx);
    (ctx, rx)
}

pub(crate) fn recording_context_with(
    config: SessionConfig,
) -> (Arc<SessionContext>, mpsc::UnboundedReceiver<Event>) {
    let ctx = context_with(config);
    let rx = record(&ctx);
    (ctx, rx)
}

fn record(ctx: &Arc<SessionContext>) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctx.bus().add_listener(Arc::new(ChannelListener::new(tx)));
    ctx.bus().start();
    rx
}

/// Everything currently buffered in `rx`
pub(crate) fn drain_events(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Builds agents directly, without registering them with the session
pub(crate) struct AgentFixture {
    ctx: Arc<SessionContext>,
    spec: AgentSpec,
}

impl AgentFixture {
    pub fn root(ctx: &Arc<SessionContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            spec: AgentSpec::new("root", Arc::new(ScriptedEngine::new(Vec::new()))),
        }
    }

    pub fn child(ctx: &Arc<SessionContext>, parent: &Arc<Agent>, name: &str) -> Self {
        let mut fixture = Self::root(ctx);
        fixture.spec.name = name.to_string();
        fixture.spec.parent = Some(Arc::clone(parent));
        fixture
    }

    pub fn name(mut self, name: &str) -> Self {
        self.spec.name = name.to_string();
        self
    }

    pub fn engine(mut self, engine: ScriptedEngine) -> Self {
        self.spec.engine = Arc::new(engine);
        self
    }

    pub fn tool(mut self, tool: ToolConfig) -> Self {
        self.spec.tools.push(tool);
        self
    }

    pub fn delegation(mut self, scheme: DelegationScheme) -> Self {
        self.spec.delegation = Some(scheme);
        self
    }

    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.spec.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn history(mut self, history: Vec<ChatMessage>) -> Self {
        self.spec.chat_history = history;
        self
    }

    pub fn max_function_rounds(mut self, rounds: usize) -> Self {
        self.spec.max_function_rounds = Some(rounds);
        self
    }

    pub fn into_spec(self) -> AgentSpec {
        self.spec
    }

    pub async fn build(self) -> Arc<Agent> {
        Agent::build(&self.ctx, self.spec).await.unwrap()
    }
}
