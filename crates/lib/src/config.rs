//! Configuration types and loading.
//!
//! Config is a YAML file with a `general` section (bot defaults, backend
//! credentials, options, plugins) and an `adapters` section. Each enabled
//! adapter may override any part of `general` via `override_general`;
//! omitted parts inherit the top-level values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub adapters: AdaptersConfig,
}

/// Bot defaults applied to messages that do not carry their own values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub bot_id: u64,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_id: 0,
            lang: default_lang(),
        }
    }
}

/// Remote conversation backend credentials and endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub debug: bool,
}

/// Behavior toggles for result handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// When true, adapters suppress errors instead of rendering them.
    #[serde(default = "default_true")]
    pub ignore_if_error: bool,
    /// When true, bare URLs in responses get surrounded with spaces.
    #[serde(default)]
    pub format_links: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            ignore_if_error: true,
            format_links: false,
        }
    }
}

/// One configured plugin: registry name, gating flags, and an opaque
/// options block passed to the plugin constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginItemConfig {
    pub name: String,
    #[serde(default)]
    pub ignore_if_error: bool,
    #[serde(default)]
    pub allowed_to_terminate_plugins: bool,
    #[serde(default)]
    pub allowed_to_terminate_request: bool,
    #[serde(default)]
    pub options: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub items: Vec<PluginItemConfig>,
}

/// The `general` section: defaults shared by all adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

/// Per-adapter override of the `general` section. Absent parts inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideGeneralConfig {
    pub bot: Option<BotConfig>,
    pub backend: Option<BackendConfig>,
    pub options: Option<OptionsConfig>,
    pub plugins: Option<PluginsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub items: HashMap<String, AdapterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub driver: String,
    #[serde(default)]
    pub override_general: OverrideGeneralConfig,
    pub telegram: Option<TelegramConfig>,
    pub wechat: Option<WeChatConfig>,
}

impl AdapterConfig {
    /// The effective `general` section for this adapter: overridden parts
    /// replace the base wholesale, everything else inherits.
    pub fn general(&self, base: &GeneralConfig) -> GeneralConfig {
        GeneralConfig {
            bot: self.override_general.bot.clone().unwrap_or_else(|| base.bot.clone()),
            backend: self
                .override_general
                .backend
                .clone()
                .unwrap_or_else(|| base.backend.clone()),
            options: self
                .override_general
                .options
                .clone()
                .unwrap_or_else(|| base.options.clone()),
            plugins: self
                .override_general
                .plugins
                .clone()
                .unwrap_or_else(|| base.plugins.clone()),
        }
    }
}

/// Telegram long-poll adapter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    #[serde(default)]
    pub debug: bool,
    /// Allowed chat or user ids; empty means everyone.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// WeChat official-account webhook adapter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeChatConfig {
    /// Listen address, e.g. "127.0.0.1:8080".
    pub address: String,
    /// Webhook path, e.g. "/wechat".
    pub path: String,
    /// Shared token for signature verification.
    pub token: String,
}

/// Load and validate config from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&s).with_context(|| format!("parsing config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check that enabled adapters exist, carry their driver section, and
    /// that all referenced plugins resolve in the registry.
    pub fn validate(&self) -> Result<()> {
        for name in &self.adapters.enabled {
            let adapter = self
                .adapters
                .items
                .get(name)
                .with_context(|| format!("adapter not found: {}", name))?;
            match adapter.driver.as_str() {
                "telegram" => {
                    if adapter.telegram.is_none() {
                        anyhow::bail!("telegram config missing for adapter: {}", name);
                    }
                }
                "wechat" => {
                    if adapter.wechat.is_none() {
                        anyhow::bail!("wechat config missing for adapter: {}", name);
                    }
                }
                other => anyhow::bail!("invalid driver for adapter {}: {}", name, other),
            }
            let general = adapter.general(&self.general);
            for item in &general.plugins.items {
                crate::plugins::build_plugin(&item.name, &item.options)
                    .with_context(|| format!("adapter {}: plugin {}", name, item.name))?;
            }
        }
        Ok(())
    }
}

/// A filled-in config for `parley config gen`.
pub fn example_config() -> Config {
    let mut items = HashMap::new();
    items.insert(
        "my_telegram".to_string(),
        AdapterConfig {
            driver: "telegram".to_string(),
            override_general: OverrideGeneralConfig {
                bot: Some(BotConfig {
                    bot_id: 2,
                    lang: "zh".to_string(),
                }),
                ..Default::default()
            },
            telegram: Some(TelegramConfig {
                token: "1234567890:ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
                debug: false,
                whitelist: vec!["-10540154212".to_string()],
            }),
            wechat: None,
        },
    );
    items.insert(
        "my_wechat".to_string(),
        AdapterConfig {
            driver: "wechat".to_string(),
            override_general: OverrideGeneralConfig::default(),
            telegram: None,
            wechat: Some(WeChatConfig {
                address: "127.0.0.1:8080".to_string(),
                path: "/wechat".to_string(),
                token: "123456".to_string(),
            }),
        },
    );
    Config {
        general: GeneralConfig {
            bot: BotConfig {
                bot_id: 1,
                lang: "en".to_string(),
            },
            backend: BackendConfig {
                app_id: "cab1582e-9c30-4d1e-9246-a5c80f74f8f9".to_string(),
                host: "https://conversations.example.com".to_string(),
                debug: false,
            },
            options: OptionsConfig {
                ignore_if_error: true,
                format_links: true,
            },
            plugins: PluginsConfig {
                items: vec![PluginItemConfig {
                    name: "keyword_reply".to_string(),
                    ignore_if_error: true,
                    allowed_to_terminate_plugins: true,
                    allowed_to_terminate_request: true,
                    options: serde_yaml::from_str(
                        "rules:\n  - keyword: help\n    reply: Ask me anything.\n",
                    )
                    .unwrap_or_default(),
                }],
            },
        },
        adapters: AdaptersConfig {
            enabled: vec!["my_telegram".to_string(), "my_wechat".to_string()],
            items,
        },
    }
}
