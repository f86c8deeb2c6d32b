//! Error types

use thiserror::Error;

use crate::ids::{AgentId, SessionId};

/// Errors raised by an engine while producing a completion
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model call itself failed
    #[error("Model request failed: {0}")]
    Request(String),

    /// The model answered with something unusable
    #[error("Invalid completion: {0}")]
    InvalidResponse(String),
}

/// Errors raised while calling a bound function
#[derive(Debug, Error)]
pub enum ToolError {
    /// No capability exposes this function
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Arguments did not match the function's schema
    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    /// The function ran and failed
    #[error("{0}")]
    Execution(String),

    /// The agent this capability is bound to is gone
    #[error("Agent is no longer alive")]
    AgentGone,
}

/// Errors raised by an agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// Engine failure during a round
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Two bound capabilities expose the same function name
    #[error("Function {0:?} is already registered")]
    DuplicateFunction(String),

    /// Setting up a bound capability failed
    #[error("Tool setup failed: {0}")]
    Setup(#[from] ToolError),
}

/// Errors that can occur at the session level
#[derive(Debug, Error)]
pub enum SessionError {
    /// Agent failure surfaced through the session
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Agent not found in the registry
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// A snapshot has no parentless agent to use as the root
    #[error("Snapshot for session {0} has no root agent")]
    MissingRoot(SessionId),

    /// The background round task panicked or was cancelled
    #[error("Round task failed: {0}")]
    RoundTask(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by the save/session server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Save not found: {0}")]
    SaveNotFound(String),

    #[error("Session is not loaded: {0}")]
    SessionNotFound(String),

    /// The server was started without a way to build new sessions
    #[error("This server has no session factory")]
    NoFactory,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors on the request/response channel to a worker process
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker did not answer in time
    #[error("Worker timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The worker's pipes are closed or the process died
    #[error("Broken pipe to worker: {0}")]
    BrokenPipe(String),

    /// The worker answered with something that is not a response
    #[error("Malformed response from worker: {0}")]
    Malformed(String),

    /// The worker ran the command and reported a failure
    #[error("Worker raised: {0}")]
    Remote(String),

    #[error("Could not spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BridgeError {
    /// Whether the worker must be killed and replaced before it is used again
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::Remote(_))
    }
}
