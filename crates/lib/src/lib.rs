//! Parley core library — conversation store, plugin pipeline, message
//! orchestrator, backend client, and chat-platform adapters used by the CLI.

pub mod adapters;
pub mod backend;
pub mod config;
pub mod format;
pub mod plugins;
pub mod service;
pub mod store;
