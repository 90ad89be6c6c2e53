use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dates;

const DEFAULT_BASE_URL: &str = "http://localhost:23373";
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub secrets_path: PathBuf,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let base_url = env::var("DESKCHAT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let base_url = base_url.trim_end_matches('/').to_string();

        let data_dir = env::var("DESKCHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let secrets_path = env::var("DESKCHAT_SECRETS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("secrets.json"));

        let reconnect_delay = duration_var("DESKCHAT_RECONNECT_DELAY", DEFAULT_RECONNECT_DELAY)?;
        let handshake_timeout = duration_var("DESKCHAT_HANDSHAKE_TIMEOUT", DEFAULT_HANDSHAKE_TIMEOUT)?;

        Ok(Self {
            base_url,
            data_dir,
            secrets_path,
            reconnect_delay,
            handshake_timeout,
        })
    }
}

fn duration_var(name: &str, default: Duration) -> Result<Duration, String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            dates::parse_duration(&value).map_err(|error| format!("{name}: {error}"))
        }
        _ => Ok(default),
    }
}

fn default_data_dir() -> PathBuf {
    let base = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join(".local").join("share").join("deskchat")
}
