//! WeChat official-account webhook adapter.
//!
//! WeChat pushes each user message as an HTTP POST carrying an XML body and
//! expects the reply XML in the HTTP response. The POST handler therefore
//! parks on a one-shot rendezvous embedded in the message context; the
//! result-delivery step renders the reply and signals it. Echo verification
//! (GET with a SHA-1 signature over the sorted token/timestamp/nonce) is
//! served on the same path.

use crate::config::WeChatConfig;
use crate::service::{Adapter, Completion, HandlerResult, Message};
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// Inbound and reply payload. WeChat uses the same envelope both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "xml")]
struct TextMessage {
    #[serde(rename = "ToUserName")]
    to_user_name: String,
    #[serde(rename = "FromUserName")]
    from_user_name: String,
    #[serde(rename = "CreateTime")]
    create_time: i64,
    #[serde(rename = "MsgType")]
    msg_type: String,
    #[serde(rename = "Content", default)]
    content: String,
    #[serde(rename = "MsgId", default)]
    msg_id: i64,
}

/// Correlation handle: the received envelope plus the rendezvous the POST
/// handler is parked on.
struct WeChatContext {
    received: TextMessage,
    completion: Completion<String>,
}

struct WebhookState {
    token: String,
    tx: mpsc::Sender<Message>,
}

pub(crate) fn sign(token: &str, timestamp: &str, nonce: &str) -> String {
    let mut parts = [token, timestamp, nonce];
    parts.sort();
    let combined = parts.join("");
    hex::encode(Sha1::digest(combined.as_bytes()))
}

/// Check a webhook signature: SHA-1 over the lexicographically sorted
/// (token, timestamp, nonce), hex-encoded.
pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    sign(token, timestamp, nonce) == signature
}

const EMPTY_REPLY: &str = "<xml></xml>";

/// WeChat connector (synchronous-completion shape).
pub struct WeChatAdapter {
    name: String,
    cfg: WeChatConfig,
}

impl WeChatAdapter {
    pub fn new(name: impl Into<String>, cfg: WeChatConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
        }
    }
}

fn xml_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn check_signature(state: &WebhookState, params: &HashMap<String, String>) -> bool {
    let get = |k: &str| params.get(k).map(String::as_str).unwrap_or_default();
    verify_signature(
        &state.token,
        get("timestamp"),
        get("nonce"),
        get("signature"),
    )
}

async fn handle_verify(
    State(state): State<Arc<WebhookState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !check_signature(&state, &params) {
        return (StatusCode::FORBIDDEN, "invalid signature").into_response();
    }
    let echostr = params.get("echostr").cloned().unwrap_or_default();
    echostr.into_response()
}

async fn handle_message(
    State(state): State<Arc<WebhookState>>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    if !check_signature(&state, &params) {
        return (StatusCode::FORBIDDEN, "invalid signature").into_response();
    }
    let received: TextMessage = match serde_xml_rs::from_str(&body) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("wechat: bad message body: {}", e);
            return (StatusCode::BAD_REQUEST, "bad request body").into_response();
        }
    };

    let (completion, reply_rx) = Completion::pair();
    let message = Message {
        user_identity: received.from_user_name.clone(),
        conv_key: received.from_user_name.clone(),
        content: received.content.clone(),
        context: Some(Arc::new(WeChatContext {
            received,
            completion,
        })),
        ..Default::default()
    };
    if state.tx.send(message).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "handler unavailable").into_response();
    }
    // Parked until the adapter's result-delivery step signals the reply.
    match reply_rx.await {
        Ok(xml) => xml_response(xml),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "handler unavailable").into_response(),
    }
}

#[async_trait]
impl Adapter for WeChatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(WebhookState {
            token: self.cfg.token.clone(),
            tx,
        });
        let app = Router::new()
            .route(&self.cfg.path, get(handle_verify).post(handle_message))
            .with_state(state);
        let address = self.cfg.address.clone();
        let name = self.name.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&address).await {
                Ok(l) => l,
                Err(e) => {
                    log::error!("wechat {}: bind {} failed: {}", name, address, e);
                    return;
                }
            };
            log::info!("wechat {}: listening on {}", name, address);
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            });
            if let Err(e) = serve.await {
                log::error!("wechat {}: server error: {}", name, e);
            }
            log::info!("wechat {}: server stopped", name);
        });
        rx
    }

    async fn handle_result(&self, message: &Message, result: &HandlerResult) {
        let Some(ctx) = message
            .context
            .as_ref()
            .and_then(|c| c.downcast_ref::<WeChatContext>())
        else {
            log::warn!("wechat {}: result without webhook context", self.name);
            return;
        };

        if result.err.is_some() && result.ignore_if_error {
            ctx.completion.signal(EMPTY_REPLY.to_string()).await;
            return;
        }
        let text = match &result.err {
            Some(e) => e.to_string(),
            None => result.response_text(),
        };
        if text.is_empty() {
            ctx.completion.signal(EMPTY_REPLY.to_string()).await;
            return;
        }

        let reply = TextMessage {
            to_user_name: ctx.received.from_user_name.clone(),
            from_user_name: ctx.received.to_user_name.clone(),
            create_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
            msg_type: "text".to_string(),
            content: text,
            msg_id: 0,
        };
        let xml = match serde_xml_rs::to_string(&reply) {
            Ok(xml) => xml,
            Err(e) => {
                log::warn!("wechat {}: reply serialization failed: {}", self.name, e);
                EMPTY_REPLY.to_string()
            }
        };
        ctx.completion.signal(xml).await;
    }
}
