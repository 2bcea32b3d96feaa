//! The typed configuration tree.

use std::path::PathBuf;

use brewva_core::RoutingStrategy;
use serde::{Deserialize, Serialize};

/// Webhook authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` only.
    #[default]
    Bearer,
    /// Timestamp + nonce + HMAC-SHA256 signature headers only.
    Hmac,
    /// Bearer AND hmac must both pass.
    Both,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bearer" => Ok(Self::Bearer),
            "hmac" => Ok(Self::Hmac),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

/// Behavior of the owner ACL when no owners are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclMode {
    /// Anyone may issue control commands.
    #[default]
    Open,
    /// Control commands are denied for everyone.
    Closed,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel-level behavior.
    pub channel: ChannelSection,
    /// Webhook ingress.
    pub ingress: IngressSection,
    /// Telegram transport.
    pub telegram: TelegramSection,
    /// Runtime pool, WAL, and durable-store roots.
    pub runtime: RuntimeSection,
}

/// Channel-level behavior: routing, orchestration, approvals, limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Channel name used in scope keys and dedupe keys.
    pub name: String,
    /// How turns are grouped into serial scopes.
    pub routing_strategy: RoutingStrategy,
    /// Whether `/commands` and `@mentions` are interpreted.
    pub orchestration_enabled: bool,
    /// Agent whose identity signs controller replies.
    pub controller_agent_id: String,
    /// Sender ids allowed to issue control commands.
    pub owners: Vec<String>,
    /// ACL behavior when `owners` is empty.
    pub acl_mode_when_owners_empty: AclMode,
    /// Max agents per fan-out or broadcast.
    pub fanout_max_agents: usize,
    /// Upper bound on discussion rounds regardless of the command argument.
    pub max_discussion_rounds: u32,
    /// Max A2A chain depth.
    pub a2a_max_depth: u32,
    /// Max A2A hops.
    pub a2a_max_hops: u32,
    /// Block an agent from A2A-messaging itself.
    pub forbid_self_a2a: bool,
    /// Render approvals as inline keyboards when a callback secret is set.
    pub inline_approvals: bool,
    /// Shared secret for signing callback tokens.
    pub callback_secret: Option<String>,
    /// Outbound text chunk limit.
    pub max_text_length: usize,
    /// Shutdown drain budget.
    pub graceful_timeout_ms: u64,
    /// Skill recommended to agents for interactive UI output.
    pub preferred_ui_skill: Option<String>,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            name: "telegram".to_string(),
            routing_strategy: RoutingStrategy::Chat,
            orchestration_enabled: true,
            controller_agent_id: brewva_core::DEFAULT_AGENT_ID.to_string(),
            owners: Vec::new(),
            acl_mode_when_owners_empty: AclMode::Open,
            fanout_max_agents: 4,
            max_discussion_rounds: 4,
            a2a_max_depth: 3,
            a2a_max_hops: 8,
            forbid_self_a2a: true,
            inline_approvals: true,
            callback_secret: None,
            max_text_length: 4096,
            graceful_timeout_ms: 10_000,
            preferred_ui_skill: None,
        }
    }
}

/// Webhook ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSection {
    /// Serve the webhook; when false the polling transport is used.
    pub enabled: bool,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Webhook path.
    pub path: String,
    /// Request body cap in bytes.
    pub max_body_bytes: usize,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// Bearer token for `bearer`/`both`.
    pub bearer_token: Option<String>,
    /// HMAC secret for `hmac`/`both`.
    pub hmac_secret: Option<String>,
    /// Max clock skew for signed requests; `None` or `0` disables the check.
    pub hmac_max_skew_ms: Option<u64>,
    /// How long a nonce is remembered for replay rejection.
    pub nonce_ttl_ms: u64,
}

impl Default for IngressSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8787,
            path: "/ingest/telegram".to_string(),
            max_body_bytes: 1_048_576,
            auth_mode: AuthMode::default(),
            bearer_token: None,
            hmac_secret: None,
            hmac_max_skew_ms: Some(300_000),
            nonce_ttl_ms: 600_000,
        }
    }
}

/// Telegram transport settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    /// Bot API token (from `@BotFather`).
    pub bot_token: Option<String>,
    /// Bot API base URL; override for tests.
    pub api_base: String,
    /// Long-poll timeout in seconds.
    pub poll_timeout_secs: u64,
    /// Updates per poll batch.
    pub poll_limit: u32,
    /// Delay before retrying a failed poll.
    pub retry_delay_ms: u64,
    /// Process messages authored by other bots.
    pub allow_bot_messages: bool,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
            poll_limit: 100,
            retry_delay_ms: 2_000,
            allow_bot_messages: false,
        }
    }
}

impl std::fmt::Debug for TelegramSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSection")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("poll_limit", &self.poll_limit)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("allow_bot_messages", &self.allow_bot_messages)
            .finish()
    }
}

/// Runtime pool and durable-store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Workspace-rooted state directory.
    pub state_dir: PathBuf,
    /// Cap on live per-agent runtimes.
    pub max_live_runtimes: usize,
    /// Idle TTL after which zero-ref runtimes are evicted.
    pub idle_runtime_ttl_ms: u64,
    /// Whether the turn WAL is written at all.
    pub wal_enabled: bool,
    /// WAL directory; defaults to `<state_dir>/turn-wal`.
    pub wal_dir: Option<PathBuf>,
    /// Terminal WAL records older than this are dropped by compaction.
    pub compact_after_ms: u64,
    /// Per-conversation cap for approval stores.
    pub approval_max_entries: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".brewva"),
            max_live_runtimes: 8,
            idle_runtime_ttl_ms: 900_000,
            wal_enabled: true,
            wal_dir: None,
            compact_after_ms: 3_600_000,
            approval_max_entries: 2048,
        }
    }
}

impl RuntimeSection {
    /// Effective WAL directory.
    #[must_use]
    pub fn effective_wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("turn-wal"))
    }

    /// Directory holding the channel's durable JSON stores.
    #[must_use]
    pub fn channel_dir(&self) -> PathBuf {
        self.state_dir.join("channel")
    }

    /// Root directory for one agent's scaffold and namespaced state.
    #[must_use]
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ChannelConfig::default();
        assert_eq!(config.ingress.host, "0.0.0.0");
        assert_eq!(config.ingress.port, 8787);
        assert_eq!(config.ingress.path, "/ingest/telegram");
        assert_eq!(config.channel.max_text_length, 4096);
        assert_eq!(config.runtime.approval_max_entries, 2048);
    }

    #[test]
    fn auth_mode_from_str() {
        assert_eq!("hmac".parse(), Ok(AuthMode::Hmac));
        assert_eq!("bearer".parse(), Ok(AuthMode::Bearer));
        assert_eq!("both".parse(), Ok(AuthMode::Both));
        assert!("none".parse::<AuthMode>().is_err());
    }

    #[test]
    fn telegram_debug_redacts_token() {
        let section = TelegramSection {
            bot_token: Some("123:abc".to_string()),
            ..TelegramSection::default()
        };
        let rendered = format!("{section:?}");
        assert!(!rendered.contains("123:abc"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn effective_wal_dir_defaults_under_state_dir() {
        let runtime = RuntimeSection::default();
        assert_eq!(runtime.effective_wal_dir(), PathBuf::from(".brewva/turn-wal"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ChannelConfig = toml::from_str(
            r#"
            [channel]
            owners = ["1001"]

            [ingress]
            enabled = true
            auth_mode = "hmac"
            "#,
        )
        .unwrap();
        assert_eq!(config.channel.owners, vec!["1001".to_string()]);
        assert!(config.ingress.enabled);
        assert_eq!(config.ingress.auth_mode, AuthMode::Hmac);
        assert_eq!(config.ingress.port, 8787);
    }
}
