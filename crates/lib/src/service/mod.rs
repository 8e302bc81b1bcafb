//! Message orchestration: the adapter-facing protocol and the handler that
//! ties store, plugin pipeline, and backend together per inbound message.

mod handler;
mod message;

pub use handler::{Handler, HandlerError};
pub use message::{Adapter, AdapterContext, Completion, HandlerResult, Message};
