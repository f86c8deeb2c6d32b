//! Fire-and-collect delegation to many named helpers

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, select_all, BoxFuture, Shared};
use futures::FutureExt;
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

const WAIT_TRUNCATE: usize = 6000;
const RESULT_SEPARATOR: &str = "\n\n=====\n\n";

pub const INVALID_UNTIL: &str = "The \"until\" param must be the name of a running helper, \"next\", or \"all\".";
pub const NOTHING_PENDING: &str = "No helpers are currently working on anything. Use delegate() to ask a helper first.";

#[derive(Debug, Clone)]
struct HelperResult {
    name: String,
    output: String,
}

impl HelperResult {
    fn render(&self) -> String {
        format!("{}:\n{}", self.name, self.output)
    }
}

type HelperTask = Shared<BoxFuture<'static, HelperResult>>;

struct PendingHelper {
    name: String,
    task: HelperTask,
}

#[derive(Default)]
struct WaitState {
    helpers: HashMap<String, Arc<Agent>>,
    namer: Namer,
    /// In delegation order
    pending: Vec<PendingHelper>,
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    instructions: String,
    #[serde(default)]
    who: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaitArgs {
    until: String,
}

/// `delegate()` starts a helper in the background and returns immediately;
/// `wait()` collects finished results.
///
/// Helpers stay alive for the lifetime of this capability so the model can
/// send follow-ups by name. Tasks still pending at close are left to finish
/// on their own.
pub struct DelegateWait {
    binding: ToolBinding,
    state: Mutex<WaitState>,
}

impl DelegateWait {
    pub fn new(binding: ToolBinding) -> Self {
        Self {
            binding,
            state: Mutex::new(WaitState::default()),
        }
    }

    pub fn helper(&self, name: &str) -> Option<Arc<Agent>> {
        self.state.lock().helpers.get(name).cloned()
    }

    async fn delegate(&self, args: DelegateArgs) -> Result<String, ToolError> {
        let agent = self.binding.agent()?;
        info!(agent_id = %agent.id, instructions = %args.instructions, "Delegating");
        if repeats_request(&agent, &args.instructions) {
            return Ok(WHOLE_TASK_REFUSAL.to_string());
        }

        let existing = {
            let state = self.state.lock();
            match args.who.as_deref().filter(|w| !w.is_empty()) {
                Some(who) if state.helpers.contains_key(who) => {
                    if state.pending.iter().any(|p| p.name == who) {
                        return Ok(format!(
                            "'{who}' is currently busy. You can leave `who` empty to find a new available \
                             helper or wait on '{who}' and retry."
                        ));
                    }
                    state.helpers.get(who).cloned()
                }
                _ => None,
            }
        };

        let helper = match existing {
            Some(helper) => helper,
            None => {
                let name = {
                    let mut guard = self.state.lock();
                    let WaitState { helpers, namer, .. } = &mut *guard;
                    namer.next_name(|n| helpers.contains_key(n))
                };
                let helper = create_helper(&self.binding, name).await?;
                self.state
                    .lock()
                    .helpers
                    .insert(helper.name.clone(), Arc::clone(&helper));
                helper
            }
        };

        let name = helper.name.clone();
        let task = spawn_helper(helper, args.instructions);
        self.state.lock().pending.push(PendingHelper {
            name: name.clone(),
            task,
        });
        Ok(format!("'{}' is helping you with this request.", name))
    }

    async fn wait(&self, until: &str) -> Result<String, ToolError> {
        let agent = self.binding.agent()?;
        match until {
            "next" => {
                let tasks = self.pending_tasks();
                if tasks.is_empty() {
                    return Ok(NOTHING_PENDING.to_string());
                }
                let result = {
                    let _waiting = agent.run_state(RunState::Waiting);
                    select_all(tasks).await.0
                };
                self.state.lock().pending.retain(|p| p.name != result.name);
                Ok(result.render())
            }
            "all" => {
                let tasks = self.pending_tasks();
                if tasks.is_empty() {
                    return Ok(NOTHING_PENDING.to_string());
                }
                let results = {
                    let _waiting = agent.run_state(RunState::Waiting);
                    join_all(tasks).await
                };
                let collected: HashSet<&str> = results.iter().map(|r| r.name.as_str()).collect();
                self.state
                    .lock()
                    .pending
                    .retain(|p| !collected.contains(p.name.as_str()));
                Ok(results
                    .iter()
                    .map(HelperResult::render)
                    .collect::<Vec<_>>()
                    .join(RESULT_SEPARATOR))
            }
            name => {
                let task = {
                    let mut state = self.state.lock();
                    match state.pending.iter().position(|p| p.name == name) {
                        Some(index) => state.pending.remove(index).task,
                        None => return Ok(INVALID_UNTIL.to_string()),
                    }
                };
                let result = {
                    let _waiting = agent.run_state(RunState::Waiting);
                    task.await
                };
                Ok(result.render())
            }
        }
    }

    fn pending_tasks(&self) -> Vec<HelperTask> {
        self.state.lock().pending.iter().map(|p| p.task.clone()).collect()
    }
}

/// Run `helper` on `instructions` in the background.
///
/// A failing helper yields its error as text so one bad branch never takes
/// the others down with it.
fn spawn_helper(helper: Arc<Agent>, instructions: String) -> HelperTask {
    let name = helper.name.clone();
    let handle = tokio::spawn(async move {
        let output = match helper.full_round_stream(&instructions).await {
            Ok(messages) => collect_output(&messages),
            Err(e) => {
                warn!(agent_id = %helper.id, name = %helper.name, error = %e, "Helper failed");
                format!("encountered an exception: {}", e)
            }
        };
        helper.cleanup().await;
        output
    });
    async move {
        let output = match handle.await {
            Ok(output) => output,
            Err(e) => {
                warn!(name = %name, error = %e, "Helper task did not finish");
                format!("encountered an exception: {}", e)
            }
        };
        HelperResult { name, output }
    }
    .boxed()
    .shared()
}

#[async_trait]
impl Tool for DelegateWait {
    fn functions(&self) -> Vec<FunctionSpec> {
        vec![
            FunctionSpec::new(
                "delegate",
                "Ask a capable helper for help looking up a piece of information or performing an action. \
                 Use wait() to get a helper's result. You can call this multiple times to take multiple \
                 actions. You should break up user queries into multiple smaller queries if possible. \
                 Do not delegate the entire task you were given. If the user's query can be resolved in \
                 parallel, call this multiple times then use wait(\"all\").",
                json!({
                    "type": "object",
                    "properties": {
                        "instructions": {
                            "type": "string",
                            "description": "Detailed instructions on what your helper should do to help you. \
                                This should include all the information the helper needs."
                        },
                        "who": {
                            "type": "string",
                            "description": "If you need to ask a previous helper a follow-up, pass their name here; otherwise omit."
                        }
                    },
                    "required": ["instructions"]
                }),
            ),
            FunctionSpec::new(
                "wait",
                "Wait for a helper to finish their task and get their result.",
                json!({
                    "type": "object",
                    "properties": {
                        "until": {
                            "type": "string",
                            "description": "The name of the helper. Pass \"next\" for the next helper, or \"all\" for all running helpers."
                        }
                    },
                    "required": ["until"]
                }),
            )
            .auto_truncate(WAIT_TRUNCATE),
        ]
    }

    async fn call(&self, function: &str, arguments: Value) -> Result<String, ToolError> {
        match function {
            "delegate" => self.delegate(parse_arguments(function, arguments)?).await,
            "wait" => {
                let args: WaitArgs = parse_arguments(function, arguments)?;
                self.wait(&args.until).await
            }
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }

    async fn close(&self) {
        let abandoned = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending)
        };
        if !abandoned.is_empty() {
            let names: Vec<String> = abandoned.into_iter().map(|p| p.name).collect();
            warn!(count = names.len(), helpers = ?names, "Abandoning helpers that were never waited on");
        }
    }
}

impl Delegator for DelegateWait {
    fn scheme(&self) -> DelegationScheme {
        DelegationScheme::DelegateWait
    }

    fn adopt(&self, child: Arc<Agent>) {
        self.state.lock().helpers.insert(child.name.clone(), child);
    }

    fn pending(&self) -> Vec<String> {
        self.state.lock().pending.iter().map(|p| p.name.clone()).collect()
    }
}
