//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tether/config.json`) and environment.
//! Covers the relay connection, the tracked session, and correlation timing knobs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay server connection settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Tracked session settings (id, master secret).
    #[serde(default)]
    pub session: SessionConfig,

    /// Correlation timing knobs (timeouts, debounce, network buffer).
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Relay WebSocket URL and optional auth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// WebSocket URL of the relay (default "ws://127.0.0.1:15151/ws").
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Shared auth token sent on connect. Overridden by TETHER_RELAY_TOKEN env.
    pub token: Option<String>,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:15151/ws".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            token: None,
        }
    }
}

/// Session identity and key material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session id to track on the shared channel. Frames for other sessions are ignored.
    pub id: Option<String>,

    /// Base64 master secret for session key derivation. Overridden by TETHER_SESSION_SECRET env.
    pub secret: Option<String>,
}

/// Timing knobs for correlation and response assembly (all milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    /// Default per-request timeout when the caller does not pass one.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Quiet period after the last streamed chunk before the response is finalized.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Clock-skew allowance when matching message timestamps against a conversation window.
    #[serde(default = "default_network_buffer_ms")]
    pub network_buffer_ms: u64,

    /// Fallback: finalize a conversation with buffered messages after this much silence
    /// when no ready event arrives.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    90_000
}

fn default_debounce_ms() -> u64 {
    3_000
}

fn default_network_buffer_ms() -> u64 {
    2_000
}

fn default_silence_timeout_ms() -> u64 {
    15_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            network_buffer_ms: default_network_buffer_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
        }
    }
}

/// Resolve the relay token: env TETHER_RELAY_TOKEN overrides config.
pub fn resolve_relay_token(config: &Config) -> Option<String> {
    std::env::var("TETHER_RELAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .relay
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the session master secret: env TETHER_SESSION_SECRET overrides config.
pub fn resolve_session_secret(config: &Config) -> Option<String> {
    std::env::var("TETHER_SESSION_SECRET")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .session
                .secret
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TETHER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tether").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or TETHER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Write the config as pretty JSON. Creates parent dirs if needed.
pub fn save_config(config: &Config, path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config dir {}", parent.display()))?;
    }
    let s = serde_json::to_string_pretty(config).context("serializing config")?;
    std::fs::write(path, s).with_context(|| format!("writing config to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_relay_url_and_timing() {
        let c = Config::default();
        assert_eq!(c.relay.url, "ws://127.0.0.1:15151/ws");
        assert_eq!(c.timing.request_timeout_ms, 90_000);
        assert_eq!(c.timing.debounce_ms, 3_000);
        assert_eq!(c.timing.network_buffer_ms, 2_000);
    }

    #[test]
    fn parse_partial_config_fills_defaults() {
        let c: Config = serde_json::from_str(
            r#"{ "relay": { "url": "ws://relay.example:9100/ws" }, "timing": { "debounceMs": 500 } }"#,
        )
        .expect("parse");
        assert_eq!(c.relay.url, "ws://relay.example:9100/ws");
        assert_eq!(c.timing.debounce_ms, 500);
        assert_eq!(c.timing.request_timeout_ms, 90_000);
        assert!(c.session.id.is_none());
    }

    #[test]
    fn token_resolution_prefers_nonempty_config_value() {
        let mut c = Config::default();
        c.relay.token = Some("  abc  ".to_string());
        assert_eq!(resolve_relay_token(&c), Some("abc".to_string()));
        c.relay.token = Some("   ".to_string());
        assert_eq!(resolve_relay_token(&c), None);
    }
}
