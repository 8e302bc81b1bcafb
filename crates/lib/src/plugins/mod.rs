//! Plugin system: hooks that run before and after each backend call.
//!
//! A plugin is a named unit that optionally implements the Before capability
//! (inspect/modify the inbound message, inject canned replies, short-circuit
//! the backend call) and/or the After capability (rewrite the completed
//! turn's response). Plugins are compiled in and selected by name from
//! configuration — there is no runtime binary loading.

mod builtin;
mod pipeline;

pub use builtin::build_plugin;
pub use pipeline::{run_after, run_before, PluginError};

use crate::backend::Turn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pipeline-local view of an inbound message handed to Before hooks.
#[derive(Debug, Clone, Default)]
pub struct BeforeRequest {
    pub bot_id: u64,
    pub lang: String,
    pub user_identity: String,
    pub conv_key: String,
    pub content: String,
    pub reply_content: Option<String>,
}

/// A Before hook's decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeforeResponse {
    /// Skip the backend call; reply with the accumulated custom responses.
    pub terminate_request: bool,
    /// Stop invoking further plugins in this phase.
    pub terminate_plugins: bool,
    /// Replace the message content sent to the backend (ignored when empty).
    pub modified_request: String,
    /// Canned reply texts, appended across plugins in invocation order.
    pub custom_response: Vec<String>,
}

/// After hooks see the completed turn.
pub type AfterRequest = Turn;

/// An After hook's decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AfterResponse {
    pub terminate_plugins: bool,
    /// Replace the turn's response text (ignored when empty).
    pub modified_response: String,
}

/// Before capability. A hook may perform arbitrary I/O; any timeout is the
/// hook's own responsibility.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn execute_before(&self, req: &BeforeRequest) -> anyhow::Result<BeforeResponse>;
}

/// After capability.
#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn execute_after(&self, req: &AfterRequest) -> anyhow::Result<AfterResponse>;
}

/// A named plugin. The capability queries return `None` for phases the
/// plugin does not participate in; such plugins are skipped for that phase.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn as_before(&self) -> Option<&dyn BeforeHook> {
        None
    }
    fn as_after(&self) -> Option<&dyn AfterHook> {
        None
    }
}

/// A plugin plus its pipeline gating flags from configuration.
#[derive(Clone)]
pub struct PluginEntry {
    pub plugin: Arc<dyn Plugin>,
    /// When true, a failing hook is skipped instead of aborting the phase.
    pub ignore_if_error: bool,
    pub allowed_to_terminate_plugins: bool,
    pub allowed_to_terminate_request: bool,
}
