//! Agent implementation - one conversational node in the delegation tree

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::{render_prompt, DelegationScheme};
use crate::delegation::{self, Delegator};
use crate::engine::Engine;
use crate::error::AgentError;
use crate::event::Event;
use crate::ids::AgentId;
use crate::message::{ChatMessage, ChatRole, ToolCall};
use crate::session::SessionContext;
use crate::state::{AgentSnapshot, RunState};
use crate::tool::{truncate_result, FunctionSpec, Tool, ToolBinding, ToolConfig};

/// Prompt and completion tokens spent by one agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Default)]
struct RunStateStack {
    current: RunState,
    saved: Vec<RunState>,
}

struct BoundFunction {
    spec: FunctionSpec,
    tool: Arc<dyn Tool>,
}

/// Everything needed to construct an agent
pub(crate) struct AgentSpec {
    pub id: AgentId,
    pub name: String,
    pub parent: Option<Arc<Agent>>,
    pub engine: Arc<dyn Engine>,
    pub system_prompt: Option<String>,
    pub always_included: Vec<ChatMessage>,
    pub chat_history: Vec<ChatMessage>,
    pub tools: Vec<ToolConfig>,
    pub delegation: Option<DelegationScheme>,
    pub max_function_rounds: Option<usize>,
}

impl AgentSpec {
    /// Build parameters for a parentless agent named `name`
    pub fn new(name: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            parent: None,
            engine,
            system_prompt: None,
            always_included: Vec::new(),
            chat_history: Vec::new(),
            tools: Vec::new(),
            delegation: None,
            max_function_rounds: None,
        }
    }
}

/// One conversational node: message history, bound capabilities, run state
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub depth: usize,
    parent: Option<Weak<Agent>>,
    parent_id: Option<AgentId>,
    /// Non-owning: ids only, liveness lives elsewhere
    children: RwLock<Vec<AgentId>>,
    state: Mutex<RunStateStack>,
    system_prompt: Option<String>,
    always_included: RwLock<Vec<ChatMessage>>,
    history: RwLock<Vec<ChatMessage>>,
    engine: Arc<dyn Engine>,
    tools: Vec<Arc<dyn Tool>>,
    delegator: Option<Arc<dyn Delegator>>,
    functions: Vec<BoundFunction>,
    max_function_rounds: Option<usize>,
    session: Arc<SessionContext>,
    round_lock: tokio::sync::Mutex<()>,
    usage: Mutex<TokenUsage>,
}

impl Agent {
    /// Construct an agent, bind its capabilities and run their setup.
    ///
    /// Does not register the agent with the session.
    pub(crate) async fn build(
        session: &Arc<SessionContext>,
        spec: AgentSpec,
    ) -> Result<Arc<Agent>, AgentError> {
        let AgentSpec {
            id,
            name,
            parent,
            engine,
            system_prompt,
            always_included,
            chat_history,
            tools: tool_configs,
            delegation,
            max_function_rounds,
        } = spec;

        let depth = parent.as_ref().map_or(0, |p| p.depth + 1);

        let agent = Arc::new_cyclic(|weak: &Weak<Agent>| {
            let binding = ToolBinding {
                session: Arc::clone(session),
                agent: weak.clone(),
            };

            let mut functions = Vec::new();
            let delegator = delegation.map(|scheme| {
                let (delegator, tool) = delegation::build(scheme, binding.clone());
                for spec in tool.functions() {
                    functions.push(BoundFunction { spec, tool: Arc::clone(&tool) });
                }
                delegator
            });
            let tools: Vec<Arc<dyn Tool>> = tool_configs
                .iter()
                .map(|config| config.factory.build(binding.clone()))
                .collect();
            for tool in &tools {
                for spec in tool.functions() {
                    functions.push(BoundFunction { spec, tool: Arc::clone(tool) });
                }
            }

            let mut always_included = always_included;
            if always_included.is_empty() {
                if let Some(template) = &system_prompt {
                    always_included.push(ChatMessage::system(render_prompt(
                        template,
                        &name,
                        chrono::Local::now(),
                    )));
                }
            }

            Agent {
                id,
                name: name.clone(),
                depth,
                parent: parent.as_ref().map(Arc::downgrade),
                parent_id: parent.as_ref().map(|p| p.id),
                children: RwLock::new(Vec::new()),
                state: Mutex::new(RunStateStack::default()),
                system_prompt,
                always_included: RwLock::new(always_included),
                history: RwLock::new(chat_history),
                engine,
                tools,
                delegator,
                functions,
                max_function_rounds,
                session: Arc::clone(session),
                round_lock: tokio::sync::Mutex::new(()),
                usage: Mutex::new(TokenUsage::default()),
            }
        });

        let mut seen = HashSet::new();
        for function in &agent.functions {
            if !seen.insert(function.spec.name.as_str()) {
                return Err(AgentError::DuplicateFunction(function.spec.name.clone()));
            }
        }

        if let Some(delegator) = &agent.delegator {
            delegator.setup().await?;
        }
        for result in join_all(agent.tools.iter().map(|t| t.setup())).await {
            result?;
        }

        info!(
            agent_id = %agent.id,
            name = %agent.name,
            depth = agent.depth,
            parent = ?agent.parent_id,
            delegates = agent.delegator.is_some(),
            "Created agent"
        );
        Ok(agent)
    }

    // ==== tree ====

    /// The parent agent, if it is still alive
    pub fn parent(&self) -> Option<Arc<Agent>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Id of the parent, even if it has been dropped
    pub fn parent_id(&self) -> Option<AgentId> {
        self.parent_id
    }

    /// Whether this agent has no parent
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Record a child id; does not keep the child alive
    pub(crate) fn add_child(&self, child_id: AgentId) {
        let mut guard = self.children.write();
        if !guard.contains(&child_id) {
            guard.push(child_id);
        }
    }

    /// Ids of every child ever registered under this agent
    pub fn children(&self) -> Vec<AgentId> {
        self.children.read().clone()
    }

    /// Session this agent belongs to
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Engine driving this agent
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Delegation capability, absent at the depth limit
    pub fn delegator(&self) -> Option<&Arc<dyn Delegator>> {
        self.delegator.as_ref()
    }

    /// Whether this agent may spawn helpers
    pub fn can_delegate(&self) -> bool {
        self.delegator.is_some()
    }

    /// Every function offered to the model, delegation first
    pub fn functions(&self) -> Vec<FunctionSpec> {
        self.functions.iter().map(|f| f.spec.clone()).collect()
    }

    // ==== run state ====

    /// Current run state
    pub fn state(&self) -> RunState {
        self.state.lock().current
    }

    /// Set the run state, emitting an event only when it actually changes
    pub fn set_run_state(&self, state: RunState) {
        let changed = {
            let mut guard = self.state.lock();
            let changed = guard.current != state;
            guard.current = state;
            changed
        };
        if changed {
            self.session.dispatch(Event::state_change(self.id, state));
        }
    }

    /// Enter `state` until the returned guard drops, then restore whatever
    /// state was current on entry
    pub fn run_state(&self, state: RunState) -> RunStateGuard<'_> {
        {
            let mut guard = self.state.lock();
            let previous = guard.current;
            guard.saved.push(previous);
        }
        self.set_run_state(state);
        RunStateGuard { agent: self }
    }

    fn restore_run_state(&self) {
        let previous = self.state.lock().saved.pop();
        if let Some(previous) = previous {
            self.set_run_state(previous);
        }
    }

    // ==== history ====

    /// Copy of the chat history, oldest first
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.history.read().clone()
    }

    /// Messages sent with every prompt regardless of budget
    pub fn always_included_messages(&self) -> Vec<ChatMessage> {
        self.always_included.read().clone()
    }

    /// Most recent user message in the history
    pub fn last_user_message(&self) -> Option<ChatMessage> {
        self.last_message_by(ChatRole::User)
    }

    /// Most recent assistant message in the history
    pub fn last_assistant_message(&self) -> Option<ChatMessage> {
        self.last_message_by(ChatRole::Assistant)
    }

    fn last_message_by(&self, role: ChatRole) -> Option<ChatMessage> {
        self.history.read().iter().rev().find(|m| m.role == role).cloned()
    }

    /// Append a message and announce it
    pub fn add_to_history(&self, message: ChatMessage) {
        self.history.write().push(message.clone());
        if self.is_root() {
            self.session.dispatch(Event::message(self.id, message.clone()));
            self.session.dispatch(Event::root_message(message));
        } else {
            self.session.dispatch(Event::message(self.id, message));
        }
    }

    /// Tokens spent by this agent so far
    pub fn usage(&self) -> TokenUsage {
        *self.usage.lock()
    }

    /// Current state in save format
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            depth: self.depth,
            parent: self.parent_id,
            children: self
                .children()
                .into_iter()
                .filter(|id| self.session.is_alive(id))
                .collect(),
            always_included_messages: self.always_included_messages(),
            chat_history: self.chat_history(),
            state: self.state(),
        }
    }

    // ==== rounds ====

    /// Run one full round for `query`, returning every message the round
    /// appended after the query itself
    pub async fn full_round(&self, query: &str) -> Result<Vec<ChatMessage>, AgentError> {
        self.run_round(query, false).await
    }

    /// Like [`Agent::full_round`], streaming text deltas to live listeners
    pub async fn full_round_stream(&self, query: &str) -> Result<Vec<ChatMessage>, AgentError> {
        self.run_round(query, true).await
    }

    #[instrument(skip(self, query), fields(agent_id = %self.id, name = %self.name))]
    async fn run_round(&self, query: &str, stream: bool) -> Result<Vec<ChatMessage>, AgentError> {
        let _round = self.round_lock.lock().await;
        let result = {
            let _running = self.run_state(RunState::Running);
            self.round_body(query, stream).await
        };
        if let Err(e) = &result {
            warn!(agent_id = %self.id, error = %e, "Round failed");
            self.set_run_state(RunState::Errored);
        }
        result
    }

    async fn round_body(&self, query: &str, stream: bool) -> Result<Vec<ChatMessage>, AgentError> {
        self.add_to_history(ChatMessage::user(query));

        let mut produced = Vec::new();
        let mut tool_rounds = 0usize;
        loop {
            let offer_functions = self.max_function_rounds.map_or(true, |max| tool_rounds < max);
            let functions = if offer_functions {
                self.functions()
            } else {
                Vec::new()
            };
            let prompt = self.build_prompt();

            let completion = if stream {
                let session = Arc::clone(&self.session);
                let id = self.id;
                let mut on_delta = move |delta: &str| {
                    session.dispatch(Event::stream_delta(id, delta, ChatRole::Assistant));
                };
                self.engine.stream(&prompt, &functions, &mut on_delta).await?
            } else {
                self.engine.predict(&prompt, &functions).await?
            };

            let mut message = completion.message;
            normalize_function_names(&mut message);
            self.add_to_history(message.clone());
            if let (Some(prompt_tokens), Some(completion_tokens)) =
                (completion.prompt_tokens, completion.completion_tokens)
            {
                {
                    let mut usage = self.usage.lock();
                    usage.prompt_tokens += prompt_tokens;
                    usage.completion_tokens += completion_tokens;
                }
                self.session
                    .dispatch(Event::tokens_used(self.id, prompt_tokens, completion_tokens));
            }
            produced.push(message.clone());

            let calls = match message.tool_calls {
                Some(calls) if offer_functions && !calls.is_empty() => calls,
                _ => break,
            };
            tool_rounds += 1;

            let results = join_all(calls.iter().map(|call| self.execute_call(call))).await;
            let mut hand_back = false;
            for (result, ends_round) in results {
                self.add_to_history(result.clone());
                produced.push(result);
                hand_back |= ends_round;
            }
            if hand_back {
                break;
            }
        }
        Ok(produced)
    }

    /// Run one requested call; returns the result message and whether the
    /// function hands control back to the user
    async fn execute_call(&self, call: &ToolCall) -> (ChatMessage, bool) {
        let name = call.function.name.as_str();
        let Some(bound) = self.functions.iter().find(|f| f.spec.name == name) else {
            warn!(agent_id = %self.id, function = name, "Model called an unknown function");
            let msg = format!("ERROR: {:?} is not a valid function name.", name);
            return (ChatMessage::function(name, msg, Some(call.id.clone())), false);
        };

        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        let content = match arguments {
            Err(e) => format!("ERROR: could not parse the arguments to {}: {}", name, e),
            Ok(arguments) => {
                debug!(agent_id = %self.id, function = name, "Calling function");
                match bound.tool.call(name, arguments).await {
                    Ok(output) => match bound.spec.auto_truncate {
                        Some(limit) => truncate_result(output, limit),
                        None => output,
                    },
                    Err(e) => {
                        warn!(agent_id = %self.id, function = name, error = %e, "Function failed");
                        format!("ERROR: {}", e)
                    }
                }
            }
        };
        let ends_round = bound.spec.after == ChatRole::User;
        (ChatMessage::function(name, content, Some(call.id.clone())), ends_round)
    }

    /// Always-included messages plus as much recent history as fits the
    /// engine's context window
    fn build_prompt(&self) -> Vec<ChatMessage> {
        if let Some(template) = &self.system_prompt {
            let rendered = ChatMessage::system(render_prompt(template, &self.name, chrono::Local::now()));
            let mut always = self.always_included.write();
            match always.first_mut() {
                Some(first) if first.role == ChatRole::System => *first = rendered,
                _ => always.insert(0, rendered),
            }
        }

        let always = self.always_included_messages();
        let history = self.chat_history();
        let used: usize = always.iter().map(|m| self.engine.message_len(m)).sum();
        let budget = self.engine.max_context_size().saturating_sub(used);

        let mut start = history.len();
        let mut total = 0usize;
        while start > 0 {
            let len = self.engine.message_len(&history[start - 1]);
            if total + len > budget {
                break;
            }
            total += len;
            start -= 1;
        }
        if start == history.len() && !history.is_empty() {
            warn!(agent_id = %self.id, "Latest message alone exceeds the context window");
            start = history.len() - 1;
        }
        // a function result without its call confuses the model
        while start + 1 < history.len() && history[start].role == ChatRole::Function {
            start += 1;
        }

        let mut prompt = always;
        prompt.extend_from_slice(&history[start..]);
        prompt
    }

    // ==== lifecycle ====

    /// Release per-task resources; the agent may run again
    pub async fn cleanup(&self) {
        if let Some(delegator) = &self.delegator {
            delegator.cleanup().await;
        }
        join_all(self.tools.iter().map(|t| t.cleanup())).await;
    }

    /// Final teardown at session shutdown
    pub async fn close(&self) {
        if let Some(delegator) = &self.delegator {
            delegator.close().await;
        }
        join_all(self.tools.iter().map(|t| t.close())).await;
        debug!(agent_id = %self.id, "Closed agent");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("parent", &self.parent_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Restores the previous run state on drop
#[must_use = "the run state is restored as soon as the guard drops"]
pub struct RunStateGuard<'a> {
    agent: &'a Agent,
}

impl Drop for RunStateGuard<'_> {
    fn drop(&mut self) {
        self.agent.restore_run_state();
    }
}

/// Some models prefix function names with `functions.`
fn normalize_function_names(message: &mut ChatMessage) {
    if let Some(calls) = message.tool_calls.as_mut() {
        for call in calls {
            if let Some(stripped) = call.function.name.strip_prefix("functions.") {
                call.function.name = stripped.to_string();
            }
        }
    }
}
