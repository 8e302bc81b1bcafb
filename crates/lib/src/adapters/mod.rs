//! Platform connectors implementing the [`Adapter`](crate::service::Adapter)
//! contract.
//!
//! Telegram demonstrates the asynchronous shape (independent inbound stream
//! and outbound API calls); WeChat demonstrates the synchronous-completion
//! shape (the inbound HTTP request blocks until the result is delivered).

mod telegram;
mod wechat;

pub use telegram::TelegramAdapter;
pub use wechat::{verify_signature, WeChatAdapter};
