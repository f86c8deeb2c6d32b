//! Session configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::tool::ToolConfig;

/// Environment variable pointing at the directory that holds saved sessions
pub const HOME_ENV: &str = "CONCLAVE_HOME";

pub const DEFAULT_ROOT_PROMPT: &str = "# Goals\n\n\
Answer the user's questions and help them by performing actions. Some questions can be \
answered from memory; others need actions taken. Use the provided functions to ask capable \
helpers to take those actions for you.\nThe current time is {time}.";

pub const DEFAULT_DELEGATE_PROMPT: &str = "You are {name}, a helpful assistant whose goal is to \
answer the user's questions as precisely as possible and to help them by performing actions.\n\
Use the provided functions to take actions yourself, or split the request into smaller pieces \
and hand those pieces to capable helpers.\nWhen a request has several steps, break it up and \
delegate each piece, for example one helper per site to look up. State your plan first. Pieces \
that do not depend on each other should be delegated at the same time; later steps that depend \
on earlier results can be delegated in another round.\nThe current time is {time}.";

/// How agents hand work to their children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationScheme {
    /// `delegate()` blocks until the single helper finishes
    DelegateOne,
    /// `delegate()` returns at once; results are collected with `wait()`
    DelegateWait,
}

/// How the session gets its title
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleSetting {
    #[default]
    None,
    Fixed(String),
    /// Ask the root engine for a title once the conversation is underway
    Autogenerate,
}

/// Serializable part of a session's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// `None` disables delegation entirely
    pub delegation_scheme: Option<DelegationScheme>,
    /// Agents at this depth or deeper cannot delegate
    pub max_delegation_depth: usize,
    /// Whether the root receives the tools configured with `always_include`
    pub root_has_tools: bool,
    pub title: TitleSetting,
    /// Where this session's log and snapshot live.
    /// Defaults to `{save dir}/{session id}`.
    pub log_dir: Option<PathBuf>,
    /// Truncate an existing log instead of appending to it
    pub clear_existing_log: bool,
    /// Tool-using completions allowed per round before the model must answer
    pub max_function_rounds: Option<usize>,
    pub root_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            delegation_scheme: Some(DelegationScheme::DelegateWait),
            max_delegation_depth: 8,
            root_has_tools: false,
            title: TitleSetting::None,
            log_dir: None,
            clear_existing_log: false,
            max_function_rounds: None,
            root_name: "root".to_string(),
        }
    }
}

/// Full session configuration, including the collaborators that can't be
/// serialized
#[derive(Clone)]
pub struct SessionConfig {
    pub settings: SessionSettings,
    pub root_engine: Arc<dyn Engine>,
    pub delegate_engine: Arc<dyn Engine>,
    pub root_system_prompt: Option<String>,
    pub delegate_system_prompt: Option<String>,
    pub tools: Vec<ToolConfig>,
}

impl SessionConfig {
    /// Configuration using one engine for the root and every delegate
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            settings: SessionSettings::default(),
            root_engine: Arc::clone(&engine),
            delegate_engine: engine,
            root_system_prompt: Some(DEFAULT_ROOT_PROMPT.to_string()),
            delegate_system_prompt: Some(DEFAULT_DELEGATE_PROMPT.to_string()),
            tools: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn delegate_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.delegate_engine = engine;
        self
    }

    pub fn root_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.root_system_prompt = prompt;
        self
    }

    pub fn delegate_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.delegate_system_prompt = prompt;
        self
    }

    pub fn tool(mut self, tool: ToolConfig) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn delegation_scheme(mut self, scheme: Option<DelegationScheme>) -> Self {
        self.settings.delegation_scheme = scheme;
        self
    }

    pub fn max_delegation_depth(mut self, depth: usize) -> Self {
        self.settings.max_delegation_depth = depth;
        self
    }

    pub fn root_has_tools(mut self, root_has_tools: bool) -> Self {
        self.settings.root_has_tools = root_has_tools;
        self
    }

    pub fn title(mut self, title: TitleSetting) -> Self {
        self.settings.title = title;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.log_dir = Some(dir.into());
        self
    }

    pub fn clear_existing_log(mut self, clear: bool) -> Self {
        self.settings.clear_existing_log = clear;
        self
    }

    pub fn max_function_rounds(mut self, rounds: Option<usize>) -> Self {
        self.settings.max_function_rounds = rounds;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("settings", &self.settings)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

/// Directory under which sessions are saved by default.
///
/// `$CONCLAVE_HOME/instances`, else `~/.conclave/instances`, else
/// `.conclave/instances` relative to the working directory.
pub fn default_save_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home).join("instances");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".conclave").join("instances"),
        None => PathBuf::from(".conclave").join("instances"),
    }
}

/// Fill `{name}` and `{time}` in a system prompt template
pub fn render_prompt(template: &str, name: &str, now: DateTime<Local>) -> String {
    let time = now.format("%a %d %b %Y, %I:%M%p").to_string();
    template.replace("{name}", name).replace("{time}", &time)
}
