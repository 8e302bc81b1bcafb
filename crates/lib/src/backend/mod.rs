//! Remote conversational backend: trait and HTTP client.
//!
//! The handler only depends on the [`ConversationBackend`] trait; the HTTP
//! implementation talks to a hosted conversation API.

mod client;

pub use client::{BackendError, Conversation, ConversationBackend, HttpBackend, Turn, TurnRef, TurnStatus};
