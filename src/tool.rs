//! Tool capabilities bound to agents

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agent::Agent;
use crate::error::ToolError;
use crate::message::ChatRole;
use crate::session::SessionContext;

/// Schema and calling policy of one function offered to the model
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
    /// Clip results longer than this many characters
    pub auto_truncate: Option<usize>,
    /// Who speaks after the result: `Assistant` keeps the round going,
    /// `User` ends it
    pub after: ChatRole,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            auto_truncate: None,
            after: ChatRole::Assistant,
        }
    }

    pub fn auto_truncate(mut self, limit: usize) -> Self {
        self.auto_truncate = Some(limit);
        self
    }

    pub fn after(mut self, role: ChatRole) -> Self {
        self.after = role;
        self
    }
}

/// A capability bound to exactly one agent.
///
/// Lifecycle hooks mirror the owning agent: `setup` once after binding,
/// `cleanup` after each finished task, `close` at session shutdown.
#[async_trait]
pub trait Tool: Send + Sync {
    fn functions(&self) -> Vec<FunctionSpec>;

    async fn call(&self, function: &str, arguments: Value) -> Result<String, ToolError>;

    async fn setup(&self) -> Result<(), ToolError> {
        Ok(())
    }

    async fn cleanup(&self) {}

    async fn close(&self) {}
}

/// What a capability gets to see of the world it is bound into
#[derive(Clone)]
pub struct ToolBinding {
    pub session: Arc<SessionContext>,
    pub agent: Weak<Agent>,
}

impl ToolBinding {
    /// Strong reference to the bound agent
    pub fn agent(&self) -> Result<Arc<Agent>, ToolError> {
        self.agent.upgrade().ok_or(ToolError::AgentGone)
    }
}

/// Builds a fresh capability instance for each agent that receives it
pub trait ToolFactory: Send + Sync {
    fn build(&self, binding: ToolBinding) -> Arc<dyn Tool>;
}

impl<F> ToolFactory for F
where
    F: Fn(ToolBinding) -> Arc<dyn Tool> + Send + Sync,
{
    fn build(&self, binding: ToolBinding) -> Arc<dyn Tool> {
        self(binding)
    }
}

/// Static configuration deciding which agents receive a capability
#[derive(Clone)]
pub struct ToolConfig {
    pub factory: Arc<dyn ToolFactory>,
    /// Every delegate receives this tool
    pub always_include: bool,
    /// The root receives this tool even when the root has no tools otherwise
    pub always_include_root: bool,
}

impl ToolConfig {
    pub fn new(factory: impl ToolFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            always_include: false,
            always_include_root: false,
        }
    }

    pub fn always_include(mut self) -> Self {
        self.always_include = true;
        self
    }

    pub fn always_include_root(mut self) -> Self {
        self.always_include_root = true;
        self
    }

    /// Whether the root agent receives this tool
    pub fn for_root(&self, root_has_tools: bool) -> bool {
        self.always_include_root || (self.always_include && root_has_tools)
    }

    /// Whether a delegate receives this tool
    pub fn for_delegate(&self) -> bool {
        self.always_include
    }
}

impl fmt::Debug for ToolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolConfig")
            .field("always_include", &self.always_include)
            .field("always_include_root", &self.always_include_root)
            .finish_non_exhaustive()
    }
}

/// Decode a function's arguments object into a typed struct
pub fn parse_arguments<T: DeserializeOwned>(function: &str, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

/// Clip `text` to at most `limit` characters, marking the cut
pub fn truncate_result(text: String, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text;
    }
    let mut clipped: String = text.chars().take(limit).collect();
    clipped.push_str("\n...");
    clipped
}
