//! Built-in plugins and the by-name registry used by configuration.

use super::{AfterHook, AfterRequest, AfterResponse, BeforeHook, BeforeRequest, BeforeResponse, Plugin};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Build a plugin by registry name with its YAML options block.
pub fn build_plugin(name: &str, options: &serde_yaml::Value) -> anyhow::Result<Arc<dyn Plugin>> {
    match name {
        "echo" => Ok(Arc::new(EchoPlugin)),
        "keyword_reply" => {
            let opts: KeywordReplyOptions = parse_options(options)
                .with_context(|| format!("invalid options for plugin {}", name))?;
            Ok(Arc::new(KeywordReplyPlugin { rules: opts.rules }))
        }
        "signature" => {
            let opts: SignatureOptions = parse_options(options)
                .with_context(|| format!("invalid options for plugin {}", name))?;
            Ok(Arc::new(SignaturePlugin { text: opts.text }))
        }
        other => anyhow::bail!("unknown plugin: {}", other),
    }
}

fn parse_options<T: Default + serde::de::DeserializeOwned>(
    v: &serde_yaml::Value,
) -> anyhow::Result<T> {
    if v.is_null() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_value(v.clone())?)
}

/// Replies with the inbound content itself and skips the backend. Mostly
/// useful for wiring tests and as a template for new plugins.
pub struct EchoPlugin;

#[async_trait]
impl BeforeHook for EchoPlugin {
    async fn execute_before(&self, req: &BeforeRequest) -> anyhow::Result<BeforeResponse> {
        Ok(BeforeResponse {
            terminate_request: true,
            terminate_plugins: true,
            custom_response: vec![req.content.clone()],
            ..Default::default()
        })
    }
}

impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }
    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KeywordReplyOptions {
    #[serde(default)]
    rules: Vec<KeywordRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub reply: String,
}

/// Answers configured keywords with canned replies, skipping the backend on
/// a match. Matching is a case-insensitive substring check; the first
/// matching rule wins.
pub struct KeywordReplyPlugin {
    rules: Vec<KeywordRule>,
}

#[async_trait]
impl BeforeHook for KeywordReplyPlugin {
    async fn execute_before(&self, req: &BeforeRequest) -> anyhow::Result<BeforeResponse> {
        let content = req.content.to_lowercase();
        for rule in &self.rules {
            if content.contains(&rule.keyword.to_lowercase()) {
                return Ok(BeforeResponse {
                    terminate_request: true,
                    terminate_plugins: true,
                    custom_response: vec![rule.reply.clone()],
                    ..Default::default()
                });
            }
        }
        Ok(BeforeResponse::default())
    }
}

impl Plugin for KeywordReplyPlugin {
    fn name(&self) -> &str {
        "keyword_reply"
    }
    fn as_before(&self) -> Option<&dyn BeforeHook> {
        Some(self)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SignatureOptions {
    #[serde(default)]
    text: String,
}

/// Appends a signature line to every backend response.
pub struct SignaturePlugin {
    text: String,
}

#[async_trait]
impl AfterHook for SignaturePlugin {
    async fn execute_after(&self, req: &AfterRequest) -> anyhow::Result<AfterResponse> {
        if self.text.is_empty() || req.response.is_empty() {
            return Ok(AfterResponse::default());
        }
        Ok(AfterResponse {
            terminate_plugins: false,
            modified_response: format!("{}\n\n{}", req.response, self.text),
        })
    }
}

impl Plugin for SignaturePlugin {
    fn name(&self) -> &str {
        "signature"
    }
    fn as_after(&self) -> Option<&dyn AfterHook> {
        Some(self)
    }
}
