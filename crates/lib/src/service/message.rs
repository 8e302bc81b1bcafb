//! Adapter-facing message and result protocol.

use crate::backend::Turn;
use crate::service::HandlerError;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Opaque correlation handle owned by the adapter. The handler passes it
/// through untouched and never inspects it; adapters downcast it back in
/// their result-delivery step.
pub type AdapterContext = Arc<dyn Any + Send + Sync>;

/// One unit of work from an adapter.
#[derive(Clone)]
pub struct Message {
    /// Zero means "use the configured default".
    pub bot_id: u64,
    /// Empty means "use the configured default".
    pub lang: String,
    pub user_identity: String,
    /// Stable routing key per end-user+channel pairing, chosen by the
    /// adapter (e.g. `chat_id` or `channel:user`).
    pub conv_key: String,
    pub content: String,
    /// Quoted/replied-to text, prepended to the backend request.
    pub reply_content: Option<String>,
    pub context: Option<AdapterContext>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("bot_id", &self.bot_id)
            .field("lang", &self.lang)
            .field("user_identity", &self.user_identity)
            .field("conv_key", &self.conv_key)
            .field("content", &self.content)
            .field("reply_content", &self.reply_content)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            bot_id: 0,
            lang: String::new(),
            user_identity: String::new(),
            conv_key: String::new(),
            content: String::new(),
            reply_content: None,
            context: None,
        }
    }
}

/// What the handler emits back to the adapter: the turns in order (plugin
/// custom responses first, remote turn last; possibly empty) and the error,
/// if any. `ignore_if_error` carries the configured display policy so the
/// adapter can decide whether to render errors.
pub struct HandlerResult {
    pub turns: Vec<Turn>,
    pub err: Option<HandlerError>,
    pub ignore_if_error: bool,
}

impl HandlerResult {
    /// Concatenated response texts, in turn order.
    pub fn response_text(&self) -> String {
        self.turns
            .iter()
            .map(|t| t.response.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One-shot rendezvous for synchronous transports. The adapter embeds this
/// in a message's context; its own result-delivery step signals it so the
/// original inbound call (e.g. an HTTP handler awaiting a reply body) can
/// return. The handler never waits on it.
pub struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub fn pair() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver the value to the waiting side. Signalling twice, or after the
    /// waiter is gone, is a no-op.
    pub async fn signal(&self, value: T) {
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.send(value);
        }
    }
}

/// The contract each platform connector implements. The handler's dispatch
/// loop reads messages one at a time and emits exactly one result per
/// message.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Start the connector and return its inbound message stream. The
    /// adapter should stop producing and drop the sender once `shutdown`
    /// flips to true.
    async fn open(&self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Message>;

    /// Deliver one result for one message. For synchronous transports this
    /// is where the message's completion gets signalled.
    async fn handle_result(&self, message: &Message, result: &HandlerResult);
}
