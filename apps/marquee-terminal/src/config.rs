use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

/// Fixed path of the push channel on the control plane.
pub const PUSH_CHANNEL_PATH: &str = "/ws/state";

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub display_id: String,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_base: env::var("MARQUEE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            display_id: env::var("MARQUEE_DISPLAY_ID")
                .unwrap_or_else(|_| "default".to_string()),
            data_dir: env::var("MARQUEE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./marquee-data")),
            sync_interval: Duration::from_secs(
                env::var("MARQUEE_SYNC_INTERVAL")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    pub fn api_base_url(&self) -> Result<Url> {
        Url::parse(&self.api_base)
            .with_context(|| format!("invalid API base {}", self.api_base))
    }

    /// Push-channel URL derived from the API base: scheme swapped to the
    /// socket equivalent, fixed channel path appended. With no explicit base
    /// configured this works off the default local origin.
    pub fn push_url(&self) -> Result<Url> {
        let base = self.api_base_url()?;
        let scheme = match base.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        let host = base.host_str().context("API base has no host")?;
        let mut push = format!("{}://{}", scheme, host);
        if let Some(port) = base.port() {
            push.push_str(&format!(":{}", port));
        }
        push.push_str(PUSH_CHANNEL_PATH);
        Url::parse(&push).with_context(|| format!("invalid push URL {}", push))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            display_id: "default".to_string(),
            data_dir: PathBuf::from("./marquee-data"),
            sync_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_url_swaps_scheme_and_appends_path() {
        let config = Config {
            api_base: "http://control.example:9000".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.push_url().unwrap().as_str(),
            "ws://control.example:9000/ws/state"
        );
    }

    #[test]
    fn https_base_derives_secure_socket() {
        let config = Config {
            api_base: "https://control.example".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.push_url().unwrap().as_str(),
            "wss://control.example/ws/state"
        );
    }

    #[test]
    fn default_origin_still_derives_a_push_url() {
        let config = Config::default();
        assert_eq!(
            config.push_url().unwrap().as_str(),
            "ws://127.0.0.1:8080/ws/state"
        );
    }
}
