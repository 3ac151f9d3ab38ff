use crate::updates::ChannelPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "playlist-task-client";
const ENV_PREFIX: &str = "PLAYLIST_CLIENT_";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub channel: ChannelConfig,
    pub dev_backend: DevBackendConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub api_base_url: String,
    /// Overrides the channel base derived from `api_base_url`.
    pub ws_base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            ws_base_url: None,
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub open_timeout_ms: u64,
    pub hello_delay_ms: u64,
    pub hello_ack_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub stale_check_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub probe_grace_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    /// 0 keeps finished tasks subscribed until the caller lets go.
    pub terminal_cleanup_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 15_000,
            hello_delay_ms: 500,
            hello_ack_timeout_ms: 5_000,
            keepalive_interval_ms: 15_000,
            stale_check_interval_ms: 15_000,
            heartbeat_timeout_ms: 25_000,
            probe_grace_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 10,
            terminal_cleanup_ms: 5_000,
        }
    }
}

impl ChannelConfig {
    pub fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            hello_delay: Duration::from_millis(self.hello_delay_ms),
            hello_ack_timeout: Duration::from_millis(self.hello_ack_timeout_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            stale_check_interval: Duration::from_millis(self.stale_check_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            probe_grace: Duration::from_millis(self.probe_grace_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            terminal_cleanup: (self.terminal_cleanup_ms > 0)
                .then(|| Duration::from_millis(self.terminal_cleanup_ms)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DevBackendConfig {
    pub bind: String,
    pub progress_interval_ms: u64,
    pub server_ping_interval_ms: u64,
    /// Drop every channel abnormally after this many progress frames.
    pub drop_after_frames: Option<u32>,
}

impl Default for DevBackendConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            progress_interval_ms: 1_000,
            server_ping_interval_ms: 30_000,
            drop_after_frames: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|err| format!("{}: {err}", config_path.display()))?,
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `lookup` receives the variable name without the prefix.
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Backend
        if let Some(val) = lookup("API_BASE_URL") {
            self.backend.api_base_url = val;
        }
        if let Some(val) = lookup("WS_BASE_URL") {
            self.backend.ws_base_url = Some(val).filter(|url| !url.trim().is_empty());
        }
        override_number(&lookup, "REQUEST_TIMEOUT_MS", &mut self.backend.request_timeout_ms)?;

        // Channel policy
        override_number(&lookup, "OPEN_TIMEOUT_MS", &mut self.channel.open_timeout_ms)?;
        override_number(
            &lookup,
            "KEEPALIVE_INTERVAL_MS",
            &mut self.channel.keepalive_interval_ms,
        )?;
        override_number(
            &lookup,
            "HEARTBEAT_TIMEOUT_MS",
            &mut self.channel.heartbeat_timeout_ms,
        )?;
        override_number(
            &lookup,
            "MAX_RECONNECT_ATTEMPTS",
            &mut self.channel.max_reconnect_attempts,
        )?;
        override_number(
            &lookup,
            "TERMINAL_CLEANUP_MS",
            &mut self.channel.terminal_cleanup_ms,
        )?;

        // Dev backend
        if let Some(val) = lookup("DEV_BIND") {
            self.dev_backend.bind = val;
        }
        if let Some(val) = lookup("DEV_DROP_AFTER_FRAMES") {
            self.dev_backend.drop_after_frames = match val.trim() {
                "" | "0" => None,
                raw => Some(raw.parse().map_err(|_| {
                    format!("{ENV_PREFIX}DEV_DROP_AFTER_FRAMES must be a number, got {raw:?}")
                })?),
            };
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let api = self.backend.api_base_url.trim();
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            return Err("backend.api_base_url must be an http(s) url".into());
        }
        if let Some(ws) = self.backend.ws_base_url.as_deref() {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                return Err("backend.ws_base_url must be a ws(s) url".into());
            }
        }
        if self.backend.request_timeout_ms == 0 {
            return Err("backend.request_timeout_ms must be non-zero".into());
        }

        let channel = &self.channel;
        for (name, value) in [
            ("channel.open_timeout_ms", channel.open_timeout_ms),
            ("channel.keepalive_interval_ms", channel.keepalive_interval_ms),
            ("channel.stale_check_interval_ms", channel.stale_check_interval_ms),
            ("channel.heartbeat_timeout_ms", channel.heartbeat_timeout_ms),
            ("channel.probe_grace_ms", channel.probe_grace_ms),
            ("channel.backoff_base_ms", channel.backoff_base_ms),
        ] {
            if value == 0 {
                return Err(format!("{name} must be non-zero").into());
            }
        }
        if channel.backoff_max_ms < channel.backoff_base_ms {
            return Err("channel.backoff_max_ms must be >= channel.backoff_base_ms".into());
        }
        if channel.heartbeat_timeout_ms <= channel.keepalive_interval_ms {
            return Err(
                "channel.heartbeat_timeout_ms must exceed channel.keepalive_interval_ms".into(),
            );
        }

        if self.dev_backend.bind.trim().is_empty() {
            return Err("dev_backend.bind must be set".into());
        }
        if self.dev_backend.progress_interval_ms == 0 {
            return Err("dev_backend.progress_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn override_number<F, T>(
    lookup: &F,
    key: &str,
    target: &mut T,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(val) = lookup(key) {
        *target = val
            .trim()
            .parse()
            .map_err(|_| format!("{ENV_PREFIX}{key} must be a number, got {val:?}"))?;
    }
    Ok(())
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let cfg: Config = toml::from_str(
            r#"
            [channel]
            max_reconnect_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.channel.max_reconnect_attempts, 3);
        assert_eq!(cfg.channel.keepalive_interval_ms, 15_000);
        assert_eq!(cfg.backend, BackendConfig::default());
    }

    #[test]
    fn default_channel_policy_matches_library_defaults_except_cleanup() {
        let policy = ChannelConfig::default().policy();
        assert_eq!(policy.terminal_cleanup, Some(Duration::from_secs(5)));
        assert_eq!(
            ChannelPolicy {
                terminal_cleanup: None,
                ..policy
            },
            ChannelPolicy::default()
        );
    }

    #[test]
    fn zero_cleanup_disables_terminal_cleanup() {
        let channel = ChannelConfig {
            terminal_cleanup_ms: 0,
            ..ChannelConfig::default()
        };
        assert_eq!(channel.policy().terminal_cleanup, None);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[
            ("API_BASE_URL", "https://dl.example.test/api/v1"),
            ("WS_BASE_URL", "wss://dl.example.test/api/v1/downloads"),
            ("MAX_RECONNECT_ATTEMPTS", "4"),
            ("TERMINAL_CLEANUP_MS", "0"),
            ("DEV_DROP_AFTER_FRAMES", "3"),
        ]))
        .unwrap();

        assert_eq!(cfg.backend.api_base_url, "https://dl.example.test/api/v1");
        assert_eq!(
            cfg.backend.ws_base_url.as_deref(),
            Some("wss://dl.example.test/api/v1/downloads")
        );
        assert_eq!(cfg.channel.max_reconnect_attempts, 4);
        assert_eq!(cfg.channel.terminal_cleanup_ms, 0);
        assert_eq!(cfg.dev_backend.drop_after_frames, Some(3));
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_numeric_override_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(overrides(&[("OPEN_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("OPEN_TIMEOUT_MS"));
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut cfg = Config::default();
        cfg.backend.api_base_url = "ftp://backend".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.backend.ws_base_url = Some("http://backend/ws".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals_and_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.channel.stale_check_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.channel.backoff_max_ms = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_heartbeat_timeout_above_keepalive() {
        let mut cfg = Config::default();
        cfg.channel.heartbeat_timeout_ms = cfg.channel.keepalive_interval_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = env::temp_dir().join(format!("playlist-client-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join(CONFIG_FILE);

        Config::write_default(&path).unwrap();
        let written: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, Config::default());
        assert!(Config::write_default(&path).is_err());

        fs::remove_dir_all(dir).unwrap();
    }
}
