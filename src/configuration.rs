//! Configuration file handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use config::Config;
use log::{error, info, warn};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use url::Url;

use crate::errors::RuntimeError;
use crate::logging::LoggerSettings;

/// Default configuration file.
pub const DEF_CONFIG_FILE: &str = "configuration.yaml";

pub const DEF_HA_URL: &str = "ws://homeassistant.local:8123/api/websocket";
pub const DEF_APP_SUFFIX: &str = "_apps";
pub const DEF_TIMEZONE: &str = "UTC";

/// Environment variable for a directory holding an external HA URL/token pair,
/// used in place of the values in the configuration file.
const ENV_TOKENS_HOME: &str = "RT_TOKENS_HOME";
const TOKEN_ID: &str = "ws-ha-api";

/// Enable Home Assistant WebSocket message tracing (`all`, `in`, `out`).
pub const ENV_HASS_MSG_TRACING: &str = "RT_HASS_MSG_TRACING";

#[derive(Default, serde::Deserialize, serde::Serialize)]
pub struct Settings {
    pub app_path: PathBuf,
    #[serde(default = "default_app_suffix")]
    pub app_suffix: String,
    pub hass: HomeAssistantSettings,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub location: Option<AstralLocation>,
    #[serde(default)]
    pub logging: HashMap<String, LoggerSettings>,
    pub introspection: WebServerSettings,
}

fn default_app_suffix() -> String {
    DEF_APP_SUFFIX.to_string()
}

fn default_timezone() -> String {
    DEF_TIMEZONE.to_string()
}

#[derive(Clone, serde::Deserialize, serde::Serialize)]
pub struct WebServerSettings {
    pub interface: String,
    pub port: u16,
}

impl Default for WebServerSettings {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, serde::Deserialize, serde::Serialize)]
pub struct AstralLocation {
    pub name: String,
    pub region: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone, serde::Deserialize, serde::Serialize)]
pub struct HomeAssistantSettings {
    url: Url,
    token: String,
    /// WebSocket connection timeout in seconds.
    pub connection_timeout: u8,
    /// WebSocket request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u8,
    pub reconnect: ReconnectSettings,
    pub heartbeat: HeartbeatSettings,
}

impl Default for HomeAssistantSettings {
    fn default() -> Self {
        Self {
            url: Url::parse(DEF_HA_URL).unwrap(),
            token: "".to_string(),
            connection_timeout: 6,
            request_timeout: default_request_timeout(),
            reconnect: Default::default(),
            heartbeat: Default::default(),
        }
    }
}

impl HomeAssistantSettings {
    /// Return the configured HA server URL, preferring an external token-file override.
    pub fn get_url(&self) -> Url {
        if let Some(url) = self.get_token_value(&format!("{TOKEN_ID}-URL")) {
            if let Ok(url) = Url::parse(&url) {
                return url;
            }
        }
        self.url.clone()
    }

    /// Return the configured HA access token, preferring an external token-file override.
    pub fn get_token(&self) -> String {
        self.get_token_value(TOKEN_ID).unwrap_or_else(|| self.token.clone())
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn set_token(&mut self, token: impl AsRef<str>) {
        self.token = token.as_ref().trim().to_string();
    }

    fn get_token_value(&self, key: &str) -> Option<String> {
        let mut path = PathBuf::from(env::var(ENV_TOKENS_HOME).ok()?);
        path.push(key);
        if !path.is_file() {
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(v) => Some(v.trim().to_string()),
            Err(e) => {
                error!("Error reading token file '{key}': {e}");
                None
            }
        }
    }
}

fn default_request_timeout() -> u8 {
    6
}

#[serde_as]
#[derive(Clone, serde::Deserialize, serde::Serialize)]
pub struct ReconnectSettings {
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "duration_ms")]
    pub duration: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "duration_max_ms")]
    pub duration_max: Duration,
    pub backoff_factor: f32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            duration_max: Duration::from_secs(30),
            backoff_factor: 1.5,
        }
    }
}

/// WebSocket heartbeat settings for sending ping frames.
#[serde_as]
#[derive(Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct HeartbeatSettings {
    #[serde_as(as = "DurationSeconds")]
    #[serde(rename = "interval_sec")]
    pub interval: Duration,
    #[serde_as(as = "DurationSeconds")]
    #[serde(rename = "timeout_sec")]
    pub timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(40),
        }
    }
}

/// Load the configuration settings.
///
/// Precedence, lowest to highest: built-in defaults, the optional config
/// file, environment variables prefixed `RT_`.
pub fn get_configuration(filename: Option<&str>) -> Result<Settings, RuntimeError> {
    let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
    if let Some(filename) = filename {
        builder = builder.add_source(config::File::with_name(filename));
    }
    let built = builder
        .add_source(config::Environment::with_prefix("RT").separator("_"))
        .build()?;

    let settings: Settings = built.try_deserialize()?;
    check_cfg_values(settings)
}

fn check_cfg_values(mut settings: Settings) -> Result<Settings, RuntimeError> {
    if settings.hass.reconnect.backoff_factor < 1.0
        || settings.hass.reconnect.duration.as_millis() < 100
        || settings.hass.reconnect.duration_max.as_millis() < 1000
    {
        warn!("Invalid HA reconnect settings, using defaults.");
        settings.hass.reconnect = Default::default();
    }

    if settings.hass.heartbeat.interval.as_secs() < 5
        || settings.hass.heartbeat.timeout.as_secs() <= settings.hass.heartbeat.interval.as_secs()
    {
        warn!("Invalid HA heartbeat settings, using defaults.");
        settings.hass.heartbeat = Default::default();
    }

    match settings.hass.get_url().scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(RuntimeError::Configuration(format!(
                "invalid scheme in hass.url: {scheme}. Valid: [ws, wss]"
            )));
        }
    }

    if settings.app_suffix.is_empty() {
        info!("Empty app_suffix configured, falling back to default `{DEF_APP_SUFFIX}`");
        settings.app_suffix = DEF_APP_SUFFIX.to_string();
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let settings = check_cfg_values(Settings::default()).expect("defaults must validate");
        assert_eq!(settings.app_suffix, DEF_APP_SUFFIX);
        assert_eq!(settings.hass.get_url().scheme(), "ws");
    }

    #[test]
    fn invalid_backoff_resets_to_default() {
        let mut settings = Settings::default();
        settings.hass.reconnect.backoff_factor = 0.1;
        let settings = check_cfg_values(settings).unwrap();
        assert_eq!(settings.hass.reconnect.backoff_factor, 1.5);
    }
}
