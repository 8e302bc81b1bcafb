//! Telegram adapter: long-poll getUpdates, reply via sendMessage.

use crate::config::TelegramConfig;
use crate::service::{Adapter, HandlerResult, Message};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

/// Correlation handle: which chat/message a result belongs to.
struct TelegramMsgRef {
    chat_id: i64,
    message_id: i64,
}

/// Telegram connector. In groups the bot only answers when @mentioned or
/// when the update replies to one of its own messages.
pub struct TelegramAdapter {
    name: String,
    cfg: TelegramConfig,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramAdapter {
    pub fn new(name: impl Into<String>, cfg: TelegramConfig) -> Self {
        Self::with_base_url(name, cfg, TELEGRAM_API_BASE)
    }

    /// Point the adapter at a different Bot API host (a self-hosted
    /// telegram-bot-api server, or a scripted one in tests).
    pub fn with_base_url(
        name: impl Into<String>,
        cfg: TelegramConfig,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cfg,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.cfg.token, method)
    }

    /// GET getMe — the bot's own identity, needed for group mention gating.
    async fn get_me(&self) -> Result<TelegramUser, String> {
        let res = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getMe failed: {} {}", status, body));
        }
        let data: ApiResponse<TelegramUser> = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getMe returned ok: false".to_string());
        }
        data.result.ok_or_else(|| "getMe returned no result".to_string())
    }

    /// Call getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let mut url = format!(
            "{}?timeout={}",
            self.method_url("getUpdates"),
            LONG_POLL_TIMEOUT
        );
        if let Some(off) = offset {
            url = format!("{}&offset={}", url, off);
        }
        let res = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: ApiResponse<Vec<TelegramUpdate>> =
            res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let updates = data.result.unwrap_or_default();
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    async fn send_message(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "reply_to_message_id": reply_to,
            "text": text,
        });
        let res = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }

    fn allowed(&self, update_msg: &TelegramMessage) -> bool {
        if self.cfg.whitelist.is_empty() {
            return true;
        }
        let chat_id = update_msg.chat.id.to_string();
        let from_id = update_msg.from.as_ref().map(|u| u.id.to_string());
        self.cfg
            .whitelist
            .iter()
            .any(|id| *id == chat_id || Some(id) == from_id.as_ref())
    }

    /// Decide whether the update is addressed to the bot and extract the
    /// message content. Returns `None` when the update should be skipped.
    fn inbound_from_update(&self, me: &TelegramUser, update: TelegramUpdate) -> Option<Message> {
        let msg = update.message?;
        let text = msg.text.clone().filter(|t| !t.is_empty())?;
        if !self.allowed(&msg) {
            return None;
        }

        let username = me.username.as_deref().unwrap_or_default();
        let prefix = format!("@{}", username);
        let is_group = msg.chat.kind == "group" || msg.chat.kind == "supergroup";
        if is_group {
            let replied_to_bot = msg
                .reply_to_message
                .as_ref()
                .and_then(|r| r.from.as_ref())
                .map(|u| u.id == me.id)
                .unwrap_or(false);
            if !replied_to_bot && !text.starts_with(&prefix) {
                return None;
            }
        }

        let reply_content = msg
            .reply_to_message
            .as_ref()
            .and_then(|r| r.text.clone())
            .filter(|t| !t.is_empty());
        let content = text.trim_start_matches(&prefix).trim().to_string();
        let from_id = msg.from.as_ref().map(|u| u.id).unwrap_or_default();
        Some(Message {
            user_identity: from_id.to_string(),
            conv_key: msg.chat.id.to_string(),
            content,
            reply_content,
            context: Some(Arc::new(TelegramMsgRef {
                chat_id: msg.chat.id,
                message_id: msg.message_id,
            })),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, mut shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        let adapter = TelegramAdapter {
            name: self.name.clone(),
            cfg: self.cfg.clone(),
            base_url: self.base_url.clone(),
            client: self.client.clone(),
        };
        tokio::spawn(async move {
            let me = loop {
                match adapter.get_me().await {
                    Ok(me) => break me,
                    Err(e) => {
                        log::warn!("telegram {}: getMe failed: {}", adapter.name, e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                    }
                }
                if shutdown.has_changed().is_err() || *shutdown.borrow() {
                    return;
                }
            };
            log::info!(
                "telegram {}: polling as @{}",
                adapter.name,
                me.username.as_deref().unwrap_or("?")
            );

            let mut offset: Option<i64> = None;
            loop {
                let updates = tokio::select! {
                    res = adapter.get_updates(offset) => res,
                    changed = shutdown.changed() => {
                        // Err means the sender is gone; changed() would stay
                        // ready and cancel every long poll. Stop instead.
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("telegram {}: stopping", adapter.name);
                            return;
                        }
                        continue;
                    }
                };
                match updates {
                    Ok((updates, next)) => {
                        offset = next;
                        if adapter.cfg.debug && !updates.is_empty() {
                            log::debug!("telegram {}: {} update(s)", adapter.name, updates.len());
                        }
                        for update in updates {
                            if let Some(inbound) = adapter.inbound_from_update(&me, update) {
                                if tx.send(inbound).await.is_err() {
                                    log::debug!("telegram {}: handler gone, stopping", adapter.name);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("telegram {}: getUpdates error: {}", adapter.name, e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                    }
                }
            }
        });
        rx
    }

    async fn handle_result(&self, message: &Message, result: &HandlerResult) {
        if result.err.is_some() && result.ignore_if_error {
            return;
        }
        let text = match &result.err {
            Some(e) => e.to_string(),
            None => result.response_text(),
        };
        if text.is_empty() {
            return;
        }
        let Some(msg_ref) = message
            .context
            .as_ref()
            .and_then(|c| c.downcast_ref::<TelegramMsgRef>())
        else {
            log::warn!("telegram {}: result without message context", self.name);
            return;
        };
        if let Err(e) = self
            .send_message(msg_ref.chat_id, msg_ref.message_id, &text)
            .await
        {
            log::warn!("telegram {}: sendMessage failed: {}", self.name, e);
        }
    }
}
