//! Config loading: `.brewva/channel.toml` plus environment overrides.
//!
//! Environment variables take precedence over file values. The ingress
//! settings accept two prefixes — `BREWVA_TELEGRAM_INGRESS_` and the older
//! `BREWVA_TELEGRAM_WEBHOOK_` — with the ingress prefix winning when both
//! are set.

use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::ConfigError;
use crate::types::{AuthMode, ChannelConfig};

const CONFIG_RELATIVE_PATH: &str = ".brewva/channel.toml";

/// Load configuration for `workspace_root` (cwd when `None`).
///
/// # Errors
///
/// Returns an error when the file is unreadable or malformed, an env
/// override cannot be parsed, or semantic validation fails.
pub fn load(workspace_root: Option<&Path>) -> Result<ChannelConfig, ConfigError> {
    let root = workspace_root.unwrap_or_else(|| Path::new("."));
    let path = root.join(CONFIG_RELATIVE_PATH);

    let mut config = if path.is_file() {
        let raw = std::fs::read_to_string(&path)?;
        let parsed: ChannelConfig = toml::from_str(&raw)?;
        debug!(path = %path.display(), "loaded channel config file");
        parsed
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        ChannelConfig::default()
    };

    apply_env(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Read an ingress env var, preferring the `INGRESS_` prefix over the
/// `WEBHOOK_` alias.
fn ingress_var(suffix: &str) -> Option<(String, String)> {
    for prefix in ["BREWVA_TELEGRAM_INGRESS_", "BREWVA_TELEGRAM_WEBHOOK_"] {
        let name = format!("{prefix}{suffix}");
        if let Ok(value) = std::env::var(&name)
            && !value.is_empty()
        {
            return Some((name, value));
        }
    }
    None
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn apply_env(config: &mut ChannelConfig) -> Result<(), ConfigError> {
    if let Some((name, value)) = ingress_var("ENABLED") {
        config.ingress.enabled = parse_var::<bool>(&name, &value)?;
    }
    if let Some((_, value)) = ingress_var("HOST") {
        config.ingress.host = value;
    }
    if let Some((name, value)) = ingress_var("PORT") {
        config.ingress.port = parse_var::<u16>(&name, &value)?;
    }
    if let Some((_, value)) = ingress_var("PATH") {
        config.ingress.path = value;
    }
    if let Some((name, value)) = ingress_var("MAX_BODY_BYTES") {
        config.ingress.max_body_bytes = parse_var::<usize>(&name, &value)?;
    }
    if let Some((name, value)) = ingress_var("AUTH_MODE") {
        config.ingress.auth_mode =
            AuthMode::from_str(&value).map_err(|message| ConfigError::Env { name, message })?;
    }
    if let Some((_, value)) = ingress_var("BEARER_TOKEN") {
        config.ingress.bearer_token = Some(value);
    }
    if let Some((_, value)) = ingress_var("HMAC_SECRET") {
        config.ingress.hmac_secret = Some(value);
    }
    if let Some((name, value)) = ingress_var("HMAC_MAX_SKEW_MS") {
        let ms = parse_var::<u64>(&name, &value)?;
        config.ingress.hmac_max_skew_ms = if ms == 0 { None } else { Some(ms) };
    }
    if let Some((name, value)) = ingress_var("NONCE_TTL_MS") {
        config.ingress.nonce_ttl_ms = parse_var::<u64>(&name, &value)?;
    }

    if let Ok(value) = std::env::var("TELEGRAM_BOT_TOKEN")
        && !value.is_empty()
    {
        config.telegram.bot_token = Some(value);
    }

    Ok(())
}

/// Semantic validation. Failures here are fatal at boot.
fn validate(config: &ChannelConfig) -> Result<(), ConfigError> {
    if config.channel.name.trim().is_empty() {
        return Err(ConfigError::Invalid("channel.name must be set".to_string()));
    }
    if config.runtime.max_live_runtimes == 0 {
        return Err(ConfigError::Invalid(
            "runtime.max_live_runtimes must be at least 1".to_string(),
        ));
    }
    if config.ingress.enabled {
        let needs_bearer = matches!(config.ingress.auth_mode, AuthMode::Bearer | AuthMode::Both);
        let needs_hmac = matches!(config.ingress.auth_mode, AuthMode::Hmac | AuthMode::Both);
        if needs_bearer && config.ingress.bearer_token.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "ingress.auth_mode requires ingress.bearer_token".to_string(),
            ));
        }
        if needs_hmac && config.ingress.hmac_secret.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "ingress.auth_mode requires ingress.hmac_secret".to_string(),
            ));
        }
    }
    Ok(())
}
