//! # Conclave
//!
//! Recursive agent delegation - a tree of agents that hand work down and
//! report back.
//!
//! A session starts with one root agent. Any agent allowed to delegate can
//! spin up helpers, each a full agent with its own history, tools and (depth
//! permitting) the power to delegate further.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              SESSION                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Event Bus   │  │ Event Logger │  │ Agent Index  │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!                       ┌──────┴──────┐
//!                       │    root     │  depth 0
//!                       └──────┬──────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │    alpha    │     │    beta     │     │    gamma    │  depth 1
//!   └──────┬──────┘     └─────────────┘     └──────┬──────┘
//!          ▼                                       ▼
//!        ┌───┐                                   ┌───┐
//!        │ … │                                   │ … │        up to the
//!        └───┘                                   └───┘        depth limit
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: one model conversation with its own history and functions
//! - **Delegation scheme**: how an agent hands work to helpers, either
//!   blocking on one helper ([`DelegateOne`]) or fanning out and collecting
//!   with `wait()` ([`DelegateWait`])
//! - **Session**: the tree, its event stream and its on-disk log
//! - **Event**: everything observable that happens, in dispatch order

pub mod agent;
pub mod bus;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod ids;
pub mod logger;
pub mod message;
pub mod server;
pub mod session;
pub mod state;
pub mod tool;
pub mod worker;

#[cfg(test)]
mod testing;

pub use agent::{Agent, RunStateGuard, TokenUsage};
pub use bus::{ChannelListener, EventBus, FnListener, Listener, ListenerId};
pub use config::{DelegationScheme, SessionConfig, SessionSettings, TitleSetting};
pub use delegation::{DelegateOne, DelegateWait, Delegator};
pub use engine::{Completion, Engine};
pub use error::{AgentError, BridgeError, EngineError, ServerError, SessionError, ToolError};
pub use event::{Event, EventKind};
pub use hierarchy::AgentHierarchy;
pub use ids::{AgentId, SessionId};
pub use logger::{read_event_log, EventLogger};
pub use message::{ChatMessage, ChatRole, FunctionCall, ToolCall};
pub use server::{SessionManager, SessionServer};
pub use session::{LoadMode, Query, Session, SessionContext};
pub use state::{AgentSnapshot, RunState, SaveMeta, SessionMeta, SessionSnapshot};
pub use tool::{FunctionSpec, Tool, ToolBinding, ToolConfig};
