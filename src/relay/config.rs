//! Relay configuration.
//!
//! Read from a JSON file whose keys match the classic `config.json` layout
//! (`Hostname`, `Port`, `LogFile`, the `Has...Message` templates, ...).
//! Every key is optional. A handful of environment variables override the
//! file for container deployments.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::info;

use super::codec::DEFAULT_MAX_LINE_LENGTH;

/// Config file consulted when `RELAY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Per-event display templates. `%s` placeholders are filled in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Templates {
    /// Username, room.
    pub has_entered_the_room_message: String,
    /// Username, room.
    pub has_left_the_room_message: String,
    /// Username.
    pub has_entered_the_lobby_message: String,
    /// Username.
    pub has_left_the_lobby_message: String,
    /// Username, message.
    pub received_a_message: String,
    /// Username.
    pub ignoring_message: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            has_entered_the_room_message: "%s has entered the room \"%s\"".into(),
            has_left_the_room_message: "%s has left the room \"%s\"".into(),
            has_entered_the_lobby_message: "%s has entered the lobby".into(),
            has_left_the_lobby_message: "%s has left the lobby".into(),
            received_a_message: "%s: %s".into(),
            ignoring_message: "You are ignoring %s".into(),
        }
    }
}

/// Fill `%s` placeholders from `args`, left to right. Surplus placeholders
/// render empty; surplus args are dropped.
pub fn render(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(idx) = rest.find("%s") {
        out.push_str(&rest[..idx]);
        out.push_str(args.next().copied().unwrap_or_default());
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RelayConfig {
    /// Host the client dials.
    pub hostname: String,
    /// Chat listener port.
    #[serde(deserialize_with = "port")]
    pub port: u16,
    /// Port for the HTTP action query endpoint. Disabled when absent.
    #[serde(rename = "JSONEndpointPort", deserialize_with = "optional_port")]
    pub query_port: Option<u16>,
    /// CSV action log. In-memory only when absent.
    pub log_file: Option<PathBuf>,
    /// Longest accepted line, terminator excluded.
    pub max_line_length: usize,
    /// Lines buffered per session before senders start waiting.
    pub outbound_queue: usize,
    /// How long a broadcast waits on one slow recipient.
    pub write_timeout_ms: u64,
    #[serde(flatten)]
    pub templates: Templates,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 5555,
            query_port: None,
            log_file: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            outbound_queue: 64,
            write_timeout_ms: 5_000,
            templates: Templates::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&json).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(json)?;
        // `"LogFile": ""` in older configs means no file.
        if config
            .log_file
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            config.log_file = None;
        }
        Ok(config)
    }

    /// Load from `RELAY_CONFIG` (or `./config.json`), then apply
    /// `RELAY_PORT`, `RELAY_QUERY_PORT` and `RELAY_LOG_FILE`.
    ///
    /// A missing default file is not an error; an explicitly named one is.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("RELAY_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)?
                } else {
                    info!("no {DEFAULT_CONFIG_PATH} found, using defaults");
                    Self::default()
                }
            }
        };

        if let Ok(port) = std::env::var("RELAY_PORT") {
            config.port = parse_port("RELAY_PORT", port)?;
        }
        if let Ok(port) = std::env::var("RELAY_QUERY_PORT") {
            config.query_port = Some(parse_port("RELAY_QUERY_PORT", port)?);
        }
        if let Ok(path) = std::env::var("RELAY_LOG_FILE") {
            config.log_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }

        Ok(config)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Older config files quote their ports (`"Port": "5555"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

/// Like [`port`], with `null` and `""` meaning no port.
fn optional_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env { var, value })
}
