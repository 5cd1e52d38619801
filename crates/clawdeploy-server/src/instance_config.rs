use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::runtime::CONTAINER_GATEWAY_PORT;

pub const SUPPORTED_MODELS: &[&str] = &["claude-opus-4.5", "gpt-5.2", "gemini-3-flash"];
pub const SUPPORTED_CHANNELS: &[&str] = &["telegram", "discord", "whatsapp", ""];
pub const MAX_NAME_LEN: usize = 100;

const CONTAINER_WORKSPACE: &str = "/home/node/.openclaw/workspace";
const CONTAINER_UID: u32 = 1000;
const CONTAINER_GID: u32 = 1000;

/// Request to create an instance, as submitted by its owner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstanceSpec {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub ai_provider: Option<String>,
}

impl InstanceSpec {
    /// Checks the request and returns it with the name trimmed and the
    /// provider lowercased. Blank optional fields become `None`.
    pub fn validate(self) -> LifecycleResult<InstanceSpec> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(LifecycleError::InvalidSpec("name is required".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(LifecycleError::InvalidSpec(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if !SUPPORTED_MODELS.contains(&self.model.as_str()) {
            return Err(LifecycleError::InvalidSpec(format!(
                "unsupported model {:?}",
                self.model
            )));
        }
        if !SUPPORTED_CHANNELS.contains(&self.channel.as_str()) {
            return Err(LifecycleError::InvalidSpec(format!(
                "unsupported channel {:?}",
                self.channel
            )));
        }
        let ai_provider = non_blank(self.ai_provider).map(|p| p.to_lowercase());
        if let Some(provider) = &ai_provider {
            if provider_env_var(provider).is_none() {
                return Err(LifecycleError::InvalidSpec(format!(
                    "unsupported ai provider {provider:?}"
                )));
            }
        }

        let bot_token = non_blank(self.bot_token);
        let api_key = non_blank(self.api_key);
        // Credentials are written one per line into the instance `.env`.
        for (field, value) in [("botToken", &bot_token), ("apiKey", &api_key)] {
            if value.as_deref().is_some_and(|v| v.chars().any(char::is_control)) {
                return Err(LifecycleError::InvalidSpec(format!(
                    "{field} must not contain control characters"
                )));
            }
        }

        Ok(InstanceSpec {
            name,
            model: self.model,
            channel: self.channel,
            bot_token,
            api_key,
            ai_provider,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn provider_env_var(provider: &str) -> Option<&'static str> {
    match provider.to_lowercase().as_str() {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_gateway_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Provider and channel credentials of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSecrets {
    pub ai_provider: Option<String>,
    pub api_key: Option<String>,
    pub channel: String,
    pub bot_token: Option<String>,
}

impl InstanceSecrets {
    /// `KEY=VALUE` pairs in the order they appear in the env file.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let (Some(provider), Some(key)) = (&self.ai_provider, &self.api_key) {
            if let Some(var) = provider_env_var(provider) {
                pairs.push((var, key.clone()));
            }
        }
        if let Some(token) = &self.bot_token {
            match self.channel.as_str() {
                "telegram" => pairs.push(("TELEGRAM_BOT_TOKEN", token.clone())),
                "discord" => pairs.push(("DISCORD_BOT_TOKEN", token.clone())),
                _ => {}
            }
        }
        pairs
    }

    pub fn container_env(&self) -> BTreeMap<String, String> {
        self.env_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    pub fn env_file(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.env_pairs() {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub base: PathBuf,
    pub config: PathBuf,
    pub workspace: PathBuf,
    pub config_file: PathBuf,
    pub env_file: PathBuf,
}

impl InstancePaths {
    pub fn new(data_root: &Path, instance_id: &str) -> Self {
        let base = data_root.join(instance_id);
        let config = base.join("config");
        Self {
            workspace: base.join("workspace"),
            config_file: config.join("openclaw.json"),
            env_file: config.join(".env"),
            config,
            base,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenClawConfig {
    pub agents: AgentsConfig,
    pub gateway: GatewayConfig,
    pub wizard: WizardConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefaults {
    pub workspace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub mode: String,
    pub port: u16,
    pub bind: String,
    pub auth: GatewayAuth,
    pub tailscale: TailscaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayAuth {
    pub mode: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TailscaleConfig {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WizardConfig {
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannel {
    pub enabled: bool,
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscordChannel {
    pub enabled: bool,
    pub token: String,
}

impl OpenClawConfig {
    pub fn new(gateway_token: &str, secrets: &InstanceSecrets) -> Self {
        let channels = secrets.bot_token.as_ref().and_then(|token| {
            match secrets.channel.as_str() {
                "telegram" => Some(ChannelsConfig {
                    telegram: Some(TelegramChannel {
                        enabled: true,
                        bot_token: token.clone(),
                    }),
                    ..Default::default()
                }),
                "discord" => Some(ChannelsConfig {
                    discord: Some(DiscordChannel {
                        enabled: true,
                        token: token.clone(),
                    }),
                    ..Default::default()
                }),
                _ => None,
            }
        });

        Self {
            agents: AgentsConfig {
                defaults: AgentDefaults {
                    workspace: CONTAINER_WORKSPACE.to_string(),
                },
            },
            gateway: GatewayConfig {
                mode: "local".to_string(),
                port: CONTAINER_GATEWAY_PORT,
                bind: "lan".to_string(),
                auth: GatewayAuth {
                    mode: "token".to_string(),
                    token: gateway_token.to_string(),
                },
                tailscale: TailscaleConfig {
                    mode: "off".to_string(),
                },
            },
            wizard: WizardConfig { completed: true },
            channels,
        }
    }
}

/// Per-instance storage trees under one data root.
#[derive(Debug, Clone)]
pub struct InstanceStorage {
    data_root: PathBuf,
    chown: bool,
}

impl InstanceStorage {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            chown: true,
        }
    }

    pub fn without_chown(mut self) -> Self {
        self.chown = false;
        self
    }

    pub fn paths(&self, instance_id: &str) -> InstancePaths {
        InstancePaths::new(&self.data_root, instance_id)
    }

    /// Creates the config and workspace trees and writes the config document
    /// and env file. The env file is skipped when there are no secrets.
    pub async fn provision(
        &self,
        instance_id: &str,
        config: &OpenClawConfig,
        secrets: &InstanceSecrets,
    ) -> anyhow::Result<InstancePaths> {
        let paths = self.paths(instance_id);
        tokio::fs::create_dir_all(&paths.config)
            .await
            .with_context(|| format!("create {}", paths.config.display()))?;
        tokio::fs::create_dir_all(&paths.workspace)
            .await
            .with_context(|| format!("create {}", paths.workspace.display()))?;

        let document = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&paths.config_file, document)
            .await
            .with_context(|| format!("write {}", paths.config_file.display()))?;

        let env = secrets.env_file();
        if !env.trim().is_empty() {
            tokio::fs::write(&paths.env_file, env)
                .await
                .with_context(|| format!("write {}", paths.env_file.display()))?;
        }

        if self.chown {
            let base = paths.base.clone();
            let result = tokio::task::spawn_blocking(move || {
                chown_tree(&base, CONTAINER_UID, CONTAINER_GID)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(instance_id, error = %e, "failed to chown instance storage"),
                Err(e) => warn!(instance_id, error = %e, "chown task failed"),
            }
        }

        debug!(instance_id, base = %paths.base.display(), "provisioned instance storage");
        Ok(paths)
    }

    /// Idempotent. Errors are logged and swallowed.
    pub async fn remove(&self, instance_id: &str) {
        let paths = self.paths(instance_id);
        match tokio::fs::remove_dir_all(&paths.base).await {
            Ok(()) => debug!(instance_id, "removed instance storage"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(instance_id, error = %e, "failed to remove instance storage"),
        }
    }
}

fn chown_tree(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
