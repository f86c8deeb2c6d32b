//! Delegation capabilities
//!
//! A delegator is a [`Tool`] bound to one agent that lets the model hand work
//! to child agents. Two protocols exist: [`DelegateOne`] blocks the caller
//! until its single helper finishes, [`DelegateWait`] returns at once and
//! collects results later through `wait()`.

pub mod namer;
pub mod one;
pub mod similarity;
pub mod wait;

use std::sync::Arc;

use crate::agent::Agent;
use crate::config::DelegationScheme;
use crate::error::ToolError;
use crate::message::{ChatMessage, ChatRole};
use crate::tool::{Tool, ToolBinding};

pub use namer::Namer;
pub use one::DelegateOne;
pub use wait::DelegateWait;

/// Returned instead of spawning when the instructions just repeat the request
pub const WHOLE_TASK_REFUSAL: &str = "You shouldn't delegate the entire task to a helper. Handle it yourself, \
or if it's still too complex, try breaking it up into smaller steps and call this again.";

/// A delegation protocol bound to one agent
pub trait Delegator: Tool {
    fn scheme(&self) -> DelegationScheme;

    /// Take ownership of an existing child, e.g. one restored from a save
    fn adopt(&self, child: Arc<Agent>);

    /// Names of helpers whose result has not been collected yet
    fn pending(&self) -> Vec<String>;
}

/// Build the delegator for `scheme`, returned both as itself and as the tool
/// that exposes its functions
pub(crate) fn build(scheme: DelegationScheme, binding: ToolBinding) -> (Arc<dyn Delegator>, Arc<dyn Tool>) {
    match scheme {
        DelegationScheme::DelegateOne => {
            let delegator = Arc::new(DelegateOne::new(binding));
            (Arc::clone(&delegator) as Arc<dyn Delegator>, delegator as Arc<dyn Tool>)
        }
        DelegationScheme::DelegateWait => {
            let delegator = Arc::new(DelegateWait::new(binding));
            (Arc::clone(&delegator) as Arc<dyn Delegator>, delegator as Arc<dyn Tool>)
        }
    }
}

/// Whether `instructions` essentially restate what `agent` was itself asked
pub(crate) fn repeats_request(agent: &Agent, instructions: &str) -> bool {
    agent
        .last_user_message()
        .and_then(|m| m.content)
        .is_some_and(|request| similarity::is_near_duplicate(instructions, &request))
}

/// Assistant-authored text of a finished round, one message per line
pub(crate) fn collect_output(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == ChatRole::Assistant)
        .filter_map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Spawn a named child of the bound agent through the session
pub(crate) async fn create_helper(binding: &ToolBinding, name: String) -> Result<Arc<Agent>, ToolError> {
    let parent = binding.agent()?;
    binding
        .session
        .create_delegate(&parent, name)
        .await
        .map_err(|e| ToolError::Execution(format!("could not create a helper: {}", e)))
}
