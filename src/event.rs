//! Events emitted by agents and sessions
//!
//! Every event serializes to one flat JSON object carrying a `type` tag and a
//! `timestamp`, which is also the record format of the on-disk event log.

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId};
use crate::message::{ChatMessage, ChatRole};
use crate::state::{AgentSnapshot, RunState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// An agent was created. Carries its full state; a repeated id overwrites.
    AgentSpawn(AgentSnapshot),
    AgentStateChange { id: AgentId, state: RunState },
    /// An agent appended a message to its history
    AgentMessage { id: AgentId, msg: ChatMessage },
    /// The root appended a message; sent in addition to `AgentMessage`
    RootMessage { msg: ChatMessage },
    TokensUsed {
        id: AgentId,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// Streaming text, for live viewers only
    StreamDelta {
        id: AgentId,
        delta: String,
        role: ChatRole,
    },
    /// The root finished a full round; control goes back to the user
    RoundComplete { session_id: SessionId },
    Error { msg: String },
    /// Inbound message from a live viewer
    SendMessage { content: String },
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: now_timestamp(),
            kind,
        }
    }

    pub fn spawn(snapshot: AgentSnapshot) -> Self {
        Self::new(EventKind::AgentSpawn(snapshot))
    }

    pub fn state_change(id: AgentId, state: RunState) -> Self {
        Self::new(EventKind::AgentStateChange { id, state })
    }

    pub fn message(id: AgentId, msg: ChatMessage) -> Self {
        Self::new(EventKind::AgentMessage { id, msg })
    }

    pub fn root_message(msg: ChatMessage) -> Self {
        Self::new(EventKind::RootMessage { msg })
    }

    pub fn tokens_used(id: AgentId, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self::new(EventKind::TokensUsed {
            id,
            prompt_tokens,
            completion_tokens,
        })
    }

    pub fn stream_delta(id: AgentId, delta: impl Into<String>, role: ChatRole) -> Self {
        Self::new(EventKind::StreamDelta {
            id,
            delta: delta.into(),
            role,
        })
    }

    pub fn round_complete(session_id: SessionId) -> Self {
        Self::new(EventKind::RoundComplete { session_id })
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::new(EventKind::Error { msg: msg.into() })
    }

    pub fn send_message(content: impl Into<String>) -> Self {
        Self::new(EventKind::SendMessage {
            content: content.into(),
        })
    }

    /// Whether this event belongs in the durable log
    pub fn is_loggable(&self) -> bool {
        !matches!(self.kind, EventKind::StreamDelta { .. })
    }

    /// The `type` tag as written to the log
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::AgentSpawn(_) => "agent_spawn",
            EventKind::AgentStateChange { .. } => "agent_state_change",
            EventKind::AgentMessage { .. } => "agent_message",
            EventKind::RootMessage { .. } => "root_message",
            EventKind::TokensUsed { .. } => "tokens_used",
            EventKind::StreamDelta { .. } => "stream_delta",
            EventKind::RoundComplete { .. } => "round_complete",
            EventKind::Error { .. } => "error",
            EventKind::SendMessage { .. } => "send_message",
        }
    }

    /// True for the end-of-round marker of the given session
    pub fn is_round_complete_for(&self, session: &SessionId) -> bool {
        matches!(&self.kind, EventKind::RoundComplete { session_id } if session_id == session)
    }
}

pub(crate) fn now_timestamp() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}
