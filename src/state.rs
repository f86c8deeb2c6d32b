//! Run states and save-state models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId};
use crate::message::ChatMessage;

/// What an agent is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Not running anything or waiting on a child
    #[default]
    Stopped,
    /// The engine is generating
    Running,
    /// Waiting on a child
    Waiting,
    Errored,
}

/// Everything needed to rebuild one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub depth: usize,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
    pub always_included_messages: Vec<ChatMessage>,
    pub chat_history: Vec<ChatMessage>,
    pub state: RunState,
}

/// Summary of a session, live or saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub title: Option<String>,
    pub last_modified: f64,
    pub n_events: u64,
}

/// A session found on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMeta {
    #[serde(flatten)]
    pub meta: SessionMeta,
    /// Path components of the directory containing the save directory
    pub grouping_prefix: Vec<String>,
    pub state_path: PathBuf,
    pub event_path: PathBuf,
}

/// Contents of the snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub meta: SessionMeta,
    pub state: Vec<AgentSnapshot>,
}

impl SessionSnapshot {
    /// The parentless agent, if any
    pub fn root(&self) -> Option<&AgentSnapshot> {
        self.state.iter().find(|agent| agent.parent.is_none())
    }
}
