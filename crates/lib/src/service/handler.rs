//! The message handler: resolve the session, run the Before phase, call the
//! backend, run the After phase, format, and hand the result back to the
//! adapter. One dispatch loop per adapter instance; messages are processed
//! strictly sequentially.

use crate::backend::{BackendError, ConversationBackend, Turn, TurnStatus};
use crate::config::GeneralConfig;
use crate::format::format_links;
use crate::plugins::{self, BeforeRequest, PluginEntry, PluginError};
use crate::service::{Adapter, HandlerResult, Message};
use crate::store::{ConversationStore, Session, StoreError};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("create conversation failed: {0}")]
    CreateConversation(#[source] BackendError),
    #[error("post to conversation failed: {0}")]
    Post(#[source] BackendError),
    #[error("get turn failed: {0}")]
    GetTurn(#[source] BackendError),
    #[error("unexpected turn status: {0}")]
    UnexpectedStatus(i64),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Ties store, plugin pipeline, and backend together for one adapter.
pub struct Handler {
    general: GeneralConfig,
    backend: Arc<dyn ConversationBackend>,
    store: Arc<dyn ConversationStore>,
    plugins: Vec<PluginEntry>,
}

impl Handler {
    /// Build a handler; plugin entries are constructed from the config's
    /// plugin items via the static registry.
    pub fn new(
        general: GeneralConfig,
        backend: Arc<dyn ConversationBackend>,
        store: Arc<dyn ConversationStore>,
    ) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(general.plugins.items.len());
        for item in &general.plugins.items {
            let plugin = plugins::build_plugin(&item.name, &item.options)?;
            entries.push(PluginEntry {
                plugin,
                ignore_if_error: item.ignore_if_error,
                allowed_to_terminate_plugins: item.allowed_to_terminate_plugins,
                allowed_to_terminate_request: item.allowed_to_terminate_request,
            });
        }
        Ok(Self {
            general,
            backend,
            store,
            plugins: entries,
        })
    }

    /// Read messages from the adapter one at a time, process each, and emit
    /// exactly one result per message. Returns when the adapter's stream
    /// closes or `shutdown` flips to true.
    pub async fn run(&self, adapter: Arc<dyn Adapter>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = adapter.open(shutdown.clone()).await;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(mut msg) = maybe else {
                        log::info!("adapter {}: message stream closed", adapter.name());
                        return;
                    };
                    if msg.bot_id == 0 {
                        msg.bot_id = self.general.bot.bot_id;
                    }
                    if msg.lang.is_empty() {
                        msg.lang = self.general.bot.lang.clone();
                    }
                    log::info!("adapter {}: received message {:?}", adapter.name(), msg);
                    let (turns, err) = self.handle(&msg).await;
                    if let Some(e) = &err {
                        log::warn!("adapter {}: message failed: {}", adapter.name(), e);
                    }
                    let result = HandlerResult {
                        turns,
                        err,
                        ignore_if_error: self.general.options.ignore_if_error,
                    };
                    adapter.handle_result(&msg, &result).await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender can never signal shutdown later, and
                    // changed() stays ready forever; treat it as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("adapter {}: shutting down", adapter.name());
                        return;
                    }
                }
            }
        }
    }

    /// Process one message. The returned turns are ordered: plugin custom
    /// responses first, the remote turn last. On error the list holds
    /// whatever custom-response turns were synthesized before the failure.
    /// No call is ever retried here.
    pub async fn handle(&self, m: &Message) -> (Vec<Turn>, Option<HandlerError>) {
        let mut turns = Vec::new();

        let session = match self.store.get(&m.conv_key).await {
            Ok(s) => s,
            Err(e) => return (turns, Some(e.into())),
        };
        let session = match session {
            Some(s) => s,
            None => {
                let conv = match self
                    .backend
                    .create_conversation(m.bot_id, &m.user_identity, &m.lang)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => return (turns, Some(HandlerError::CreateConversation(e))),
                };
                let session = Session {
                    conv_key: m.conv_key.clone(),
                    conversation_id: conv.id,
                };
                if let Err(e) = self.store.put(&m.conv_key, session.clone()).await {
                    return (turns, Some(e.into()));
                }
                session
            }
        };

        let before_req = BeforeRequest {
            bot_id: m.bot_id,
            lang: m.lang.clone(),
            user_identity: m.user_identity.clone(),
            conv_key: m.conv_key.clone(),
            content: m.content.clone(),
            reply_content: m.reply_content.clone(),
        };
        let before = match plugins::run_before(&self.plugins, &before_req).await {
            Ok(r) => r,
            Err(e) => return (turns, Some(e.into())),
        };

        let mut content = m.content.clone();
        let mut terminated = false;
        if let Some(before) = before {
            for text in before.custom_response {
                turns.push(Turn {
                    id: 0,
                    conversation_id: session.conversation_id.clone(),
                    request: m.content.clone(),
                    response: text,
                    status: TurnStatus::Completed,
                    is_plugin_custom_response: true,
                    response_modified: false,
                });
            }
            if !before.modified_request.is_empty() {
                content = before.modified_request;
            }
            terminated = before.terminate_request;
        }
        if terminated {
            return (turns, None);
        }

        if let Some(reply) = m.reply_content.as_deref().filter(|s| !s.is_empty()) {
            content = format!("\"{}\" {}", reply, content);
        }

        let turn_ref = match self
            .backend
            .post_to_conversation(&session.conversation_id, &content)
            .await
        {
            Ok(r) => r,
            Err(e) => return (turns, Some(HandlerError::Post(e))),
        };
        let mut turn = match self
            .backend
            .get_turn(&session.conversation_id, turn_ref.id, true)
            .await
        {
            Ok(t) => t,
            // TODO: retry the poll once the backend exposes a deadline hint.
            Err(e) => return (turns, Some(HandlerError::GetTurn(e))),
        };
        if turn.status != TurnStatus::Completed {
            return (
                turns,
                Some(HandlerError::UnexpectedStatus(turn.status.into())),
            );
        }

        let after = match plugins::run_after(&self.plugins, &turn).await {
            Ok(r) => r,
            Err(e) => return (turns, Some(e.into())),
        };
        if let Some(after) = after {
            if !after.modified_response.is_empty() {
                turn.response = after.modified_response;
                turn.response_modified = true;
            }
        }

        if self.general.options.format_links && !turn.response.is_empty() {
            turn.response = format_links(&turn.response);
        }

        turns.push(turn);
        (turns, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Conversation, TurnRef};
    use crate::config::{GeneralConfig, PluginItemConfig, PluginsConfig};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted backend counting calls; replies with a fixed status and text.
    struct FakeBackend {
        creates: AtomicU64,
        posts: AtomicU64,
        status: TurnStatus,
        response: String,
    }

    impl FakeBackend {
        fn completed(response: &str) -> Self {
            Self {
                creates: AtomicU64::new(0),
                posts: AtomicU64::new(0),
                status: TurnStatus::Completed,
                response: response.to_string(),
            }
        }

        fn with_status(status: TurnStatus) -> Self {
            Self {
                creates: AtomicU64::new(0),
                posts: AtomicU64::new(0),
                status,
                response: "ignored".to_string(),
            }
        }
    }

    #[async_trait]
    impl ConversationBackend for FakeBackend {
        async fn create_conversation(
            &self,
            _bot_id: u64,
            user_identity: &str,
            lang: &str,
        ) -> Result<Conversation, BackendError> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Conversation {
                id: format!("conv-{}", n),
                lang: lang.to_string(),
                user_identity: user_identity.to_string(),
            })
        }

        async fn post_to_conversation(
            &self,
            _conversation_id: &str,
            _content: &str,
        ) -> Result<TurnRef, BackendError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(TurnRef { id: 42 })
        }

        async fn get_turn(
            &self,
            conversation_id: &str,
            turn_id: u64,
            _wait: bool,
        ) -> Result<Turn, BackendError> {
            Ok(Turn {
                id: turn_id,
                conversation_id: conversation_id.to_string(),
                request: "hi".to_string(),
                response: self.response.clone(),
                status: self.status,
                is_plugin_custom_response: false,
                response_modified: false,
            })
        }
    }

    /// Store whose reads always fail.
    struct BrokenStore;

    #[async_trait]
    impl ConversationStore for BrokenStore {
        async fn get(&self, _conv_key: &str) -> Result<Option<Session>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn put(&self, _conv_key: &str, _session: Session) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn message(conv_key: &str, content: &str) -> Message {
        Message {
            bot_id: 1,
            lang: "en".to_string(),
            user_identity: "u1".to_string(),
            conv_key: conv_key.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn general_with_plugins(items: Vec<PluginItemConfig>) -> GeneralConfig {
        GeneralConfig {
            plugins: PluginsConfig { items },
            ..Default::default()
        }
    }

    fn echo_item(allowed_to_terminate_request: bool) -> PluginItemConfig {
        PluginItemConfig {
            name: "echo".to_string(),
            ignore_if_error: false,
            allowed_to_terminate_plugins: true,
            allowed_to_terminate_request,
            options: serde_yaml::Value::Null,
        }
    }

    #[tokio::test]
    async fn first_message_creates_session_and_returns_remote_turn() {
        let backend = Arc::new(FakeBackend::completed("hello"));
        let store = Arc::new(MemoryStore::new());
        let handler =
            Handler::new(GeneralConfig::default(), backend.clone(), store.clone()).unwrap();

        let (turns, err) = handler.handle(&message("c1", "hi")).await;
        assert!(err.is_none());
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].response, "hello");
        assert!(!turns[0].is_plugin_custom_response);

        let session = store.get("c1").await.unwrap().unwrap();
        assert_eq!(session.conversation_id, "conv-0");
    }

    #[tokio::test]
    async fn create_conversation_called_at_most_once_per_conv_key() {
        let backend = Arc::new(FakeBackend::completed("hello"));
        let store = Arc::new(MemoryStore::new());
        let handler =
            Handler::new(GeneralConfig::default(), backend.clone(), store.clone()).unwrap();

        handler.handle(&message("c1", "first")).await;
        handler.handle(&message("c1", "second")).await;
        assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
        assert_eq!(backend.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_error_aborts_with_no_turns() {
        let backend = Arc::new(FakeBackend::completed("hello"));
        let handler =
            Handler::new(GeneralConfig::default(), backend, Arc::new(BrokenStore)).unwrap();

        let (turns, err) = handler.handle(&message("c1", "hi")).await;
        assert!(turns.is_empty());
        assert!(matches!(err, Some(HandlerError::Store(_))));
    }

    #[tokio::test]
    async fn terminate_request_skips_backend_and_returns_custom_turns() {
        let backend = Arc::new(FakeBackend::completed("never"));
        let handler = Handler::new(
            general_with_plugins(vec![echo_item(true)]),
            backend.clone(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (turns, err) = handler.handle(&message("c1", "ping")).await;
        assert!(err.is_none());
        assert_eq!(turns.len(), 1);
        assert!(turns[0].is_plugin_custom_response);
        assert_eq!(turns[0].response, "ping");
        assert_eq!(backend.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gated_terminate_request_still_calls_backend() {
        let backend = Arc::new(FakeBackend::completed("remote"));
        let handler = Handler::new(
            general_with_plugins(vec![echo_item(false)]),
            backend.clone(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (turns, err) = handler.handle(&message("c1", "ping")).await;
        assert!(err.is_none());
        // Custom turn from the plugin, then the remote turn.
        assert_eq!(turns.len(), 2);
        assert!(turns[0].is_plugin_custom_response);
        assert_eq!(turns[1].response, "remote");
        assert_eq!(backend.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_completed_status_is_an_error_with_partial_turns() {
        let backend = Arc::new(FakeBackend::with_status(TurnStatus::Pending));
        let handler = Handler::new(
            general_with_plugins(vec![echo_item(false)]),
            backend,
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (turns, err) = handler.handle(&message("c1", "hi")).await;
        assert!(matches!(err, Some(HandlerError::UnexpectedStatus(1))));
        // Only the custom-response turn survives.
        assert_eq!(turns.len(), 1);
        assert!(turns[0].is_plugin_custom_response);
    }

    #[tokio::test]
    async fn after_phase_modified_response_marks_turn() {
        let signature = PluginItemConfig {
            name: "signature".to_string(),
            ignore_if_error: false,
            allowed_to_terminate_plugins: false,
            allowed_to_terminate_request: false,
            options: serde_yaml::from_str("text: \"-- bot\"").unwrap(),
        };
        let handler = Handler::new(
            general_with_plugins(vec![signature]),
            Arc::new(FakeBackend::completed("hello")),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (turns, err) = handler.handle(&message("c1", "hi")).await;
        assert!(err.is_none());
        assert_eq!(turns[0].response, "hello\n\n-- bot");
        assert!(turns[0].response_modified);
    }

    #[tokio::test]
    async fn format_links_applied_when_enabled() {
        let mut general = GeneralConfig::default();
        general.options.format_links = true;
        let handler = Handler::new(
            general,
            Arc::new(FakeBackend::completed("seehttp://a.comnow")),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let (turns, err) = handler.handle(&message("c1", "hi")).await;
        assert!(err.is_none());
        assert_eq!(turns[0].response, "see http://a.com now");
    }

    #[tokio::test]
    async fn reply_content_is_quoted_before_the_content() {
        struct CapturingBackend {
            inner: FakeBackend,
            last_content: tokio::sync::Mutex<String>,
        }

        #[async_trait]
        impl ConversationBackend for CapturingBackend {
            async fn create_conversation(
                &self,
                bot_id: u64,
                user_identity: &str,
                lang: &str,
            ) -> Result<Conversation, BackendError> {
                self.inner.create_conversation(bot_id, user_identity, lang).await
            }
            async fn post_to_conversation(
                &self,
                conversation_id: &str,
                content: &str,
            ) -> Result<TurnRef, BackendError> {
                *self.last_content.lock().await = content.to_string();
                self.inner.post_to_conversation(conversation_id, content).await
            }
            async fn get_turn(
                &self,
                conversation_id: &str,
                turn_id: u64,
                wait: bool,
            ) -> Result<Turn, BackendError> {
                self.inner.get_turn(conversation_id, turn_id, wait).await
            }
        }

        let backend = Arc::new(CapturingBackend {
            inner: FakeBackend::completed("ok"),
            last_content: tokio::sync::Mutex::new(String::new()),
        });
        let handler = Handler::new(
            GeneralConfig::default(),
            backend.clone(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let mut msg = message("c1", "and this?");
        msg.reply_content = Some("earlier answer".to_string());
        let (_, err) = handler.handle(&msg).await;
        assert!(err.is_none());
        assert_eq!(*backend.last_content.lock().await, "\"earlier answer\" and this?");
    }
}
