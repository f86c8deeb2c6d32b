//! Blocking delegation to a single helper

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{collect_output, create_helper, repeats_request, Delegator, Namer, WHOLE_TASK_REFUSAL};
use crate::agent::Agent;
use crate::config::DelegationScheme;
use crate::error::ToolError;
use crate::state::RunState;
use crate::tool::{parse_arguments, FunctionSpec, Tool, ToolBinding};

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    instructions: String,
    #[serde(default)]
    new: bool,
}

#[derive(Default)]
struct HelperSlot {
    current: Option<Arc<Agent>>,
    /// Earlier helpers handed over by replay
    retained: Vec<Arc<Agent>>,
}

impl HelperSlot {
    fn is_taken(&self, name: &str) -> bool {
        self.current.iter().chain(&self.retained).any(|a| a.name == name)
    }
}

/// `delegate()` runs one helper to completion before returning its answer.
///
/// The helper is built on first use and reused afterwards, so follow-ups see
/// the earlier conversation unless the model asks for a new one.
pub struct DelegateOne {
    binding: ToolBinding,
    slot: Mutex<HelperSlot>,
    namer: Mutex<Namer>,
    busy: tokio::sync::Mutex<()>,
}

impl DelegateOne {
    pub fn new(binding: ToolBinding) -> Self {
        Self {
            binding,
            slot: Mutex::new(HelperSlot::default()),
            namer: Mutex::new(Namer::new()),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    pub fn helper(&self) -> Option<Arc<Agent>> {
        self.slot.lock().current.clone()
    }

    async fn delegate(&self, args: DelegateArgs) -> Result<String, ToolError> {
        let agent = self.binding.agent()?;
        info!(agent_id = %agent.id, instructions = %args.instructions, "Delegating");
        if repeats_request(&agent, &args.instructions) {
            return Ok(WHOLE_TASK_REFUSAL.to_string());
        }

        let _busy = self.busy.lock().await;
        let helper = self.helper_for(args.new).await?;

        let result = {
            let _waiting = agent.run_state(RunState::Waiting);
            helper.full_round_stream(&args.instructions).await
        };
        helper.cleanup().await;

        match result {
            Ok(messages) => Ok(collect_output(&messages)),
            Err(e) => {
                warn!(agent_id = %helper.id, name = %helper.name, error = %e, "Helper failed");
                Ok(format!("encountered an exception: {}", e))
            }
        }
    }

    async fn helper_for(&self, fresh: bool) -> Result<Arc<Agent>, ToolError> {
        let current = self.slot.lock().current.clone();
        if let Some(helper) = &current {
            if !fresh {
                return Ok(Arc::clone(helper));
            }
            helper.cleanup().await;
        }

        let name = {
            let slot = self.slot.lock();
            self.namer.lock().next_name(|n| slot.is_taken(n))
        };
        let helper = create_helper(&self.binding, name).await?;
        self.slot.lock().current = Some(Arc::clone(&helper));
        Ok(helper)
    }
}

#[async_trait]
impl Tool for DelegateOne {
    fn functions(&self) -> Vec<FunctionSpec> {
        vec![FunctionSpec::new(
            "delegate",
            "Ask a capable helper for help looking up a piece of information or performing an action. \
             Do not simply repeat what the user said as instructions. You can call this multiple times \
             to take multiple actions; for example, you might break up a complex user query into \
             multiple steps.",
            json!({
                "type": "object",
                "properties": {
                    "instructions": {
                        "type": "string",
                        "description": "Detailed instructions on what your helper should do to help you."
                    },
                    "new": {
                        "type": "boolean",
                        "description": "Continue the conversation with the same helper (false) or ask a new helper (true)."
                    }
                },
                "required": ["instructions"]
            }),
        )]
    }

    async fn call(&self, function: &str, arguments: Value) -> Result<String, ToolError> {
        match function {
            "delegate" => self.delegate(parse_arguments(function, arguments)?).await,
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }
}

impl Delegator for DelegateOne {
    fn scheme(&self) -> DelegationScheme {
        DelegationScheme::DelegateOne
    }

    fn adopt(&self, child: Arc<Agent>) {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.current.replace(child) {
            slot.retained.push(previous);
        }
    }

    fn pending(&self) -> Vec<String> {
        if self.busy.try_lock().is_ok() {
            return Vec::new();
        }
        self.helper().map(|h| vec![h.name.clone()]).unwrap_or_default()
    }
}
