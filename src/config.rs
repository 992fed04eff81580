//! Configuration loader and validator for the notification service.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Service configuration, one section per concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub push: Push,
    pub sweeper: Sweeper,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
}

/// Web push (VAPID) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    /// Uncompressed P-256 public key, base64url. Handed to browsers as `applicationServerKey`.
    pub vapid_public_key: String,
    /// Raw 32-byte P-256 private scalar, base64url.
    pub vapid_private_key: String,
    /// VAPID `sub` claim, a `mailto:` or `https:` URI.
    pub subject: String,
    pub ttl_seconds: u32,
}

/// Settings for the externally triggered sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sweeper {
    /// Bearer token the timer must present on the sweep endpoints.
    pub cron_secret: String,
    #[serde(default = "default_due_soon_minutes")]
    pub due_soon_minutes: i64,
    /// Suppress a derived reminder if an identical one was created this recently.
    #[serde(default)]
    pub dedup_window_minutes: Option<i64>,
}

fn default_due_soon_minutes() -> i64 {
    60
}

impl Config {
    /// Create `app.data_dir` so the SQLite file can be opened in it.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file-backed default under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/life-agent.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.app
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("app.bind_addr must be host:port"))
    }

    pub fn due_soon(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.sweeper.due_soon_minutes)
    }

    pub fn dedup_window(&self) -> Option<chrono::Duration> {
        self.sweeper
            .dedup_window_minutes
            .map(chrono::Duration::minutes)
    }
}

/// Read and validate the YAML file at `path` (`./config.yaml` when `None`).
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

pub const VAPID_PUBLIC_KEY_LEN: usize = 65;
pub const VAPID_PRIVATE_KEY_LEN: usize = 32;

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    cfg.bind_addr()?;

    // web-push asserts on the private key length instead of returning an error.
    match BASE64URL.decode(cfg.push.vapid_public_key.trim()) {
        Ok(bytes) if bytes.len() == VAPID_PUBLIC_KEY_LEN && bytes[0] == 0x04 => {}
        Ok(_) => {
            return Err(ConfigError::Invalid(
                "push.vapid_public_key must be a 65-byte uncompressed P-256 point",
            ))
        }
        Err(_) => return Err(ConfigError::Invalid("push.vapid_public_key must be base64url")),
    }
    match BASE64URL.decode(cfg.push.vapid_private_key.trim()) {
        Ok(bytes) if bytes.len() == VAPID_PRIVATE_KEY_LEN => {}
        Ok(_) => {
            return Err(ConfigError::Invalid(
                "push.vapid_private_key must be a raw 32-byte P-256 scalar (not DER)",
            ))
        }
        Err(_) => return Err(ConfigError::Invalid("push.vapid_private_key must be base64url")),
    }
    let subject = cfg.push.subject.trim();
    if !(subject.starts_with("mailto:") || subject.starts_with("https:")) {
        return Err(ConfigError::Invalid(
            "push.subject must be a mailto: or https: URI",
        ));
    }
    if cfg.push.ttl_seconds == 0 {
        return Err(ConfigError::Invalid("push.ttl_seconds must be > 0"));
    }

    if cfg.sweeper.cron_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("sweeper.cron_secret must be non-empty"));
    }
    if cfg.sweeper.due_soon_minutes <= 0 {
        return Err(ConfigError::Invalid("sweeper.due_soon_minutes must be > 0"));
    }
    if matches!(cfg.sweeper.dedup_window_minutes, Some(m) if m <= 0) {
        return Err(ConfigError::Invalid(
            "sweeper.dedup_window_minutes must be > 0 when set",
        ));
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "127.0.0.1:8080"

push:
  # Replace both keys with a freshly generated P-256 pair (base64url, no padding).
  vapid_public_key: "BGsX0fLhLEJH-Lzm5WOkQPJ3A32BLeszoPShOUXYmMKWT-NC4v4af5uO5-tKfA-eFivOM1drMV7Oy7ZAaDe_UfU"
  vapid_private_key: "ERERERERERERERERERERERERERERERERERERERERERE"
  subject: "mailto:admin@example.com"
  ttl_seconds: 86400

sweeper:
  cron_secret: "YOUR_CRON_SECRET"
  due_soon_minutes: 60
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    fn rejected_for(cfg: &Config, field: &str) -> bool {
        matches!(validate(cfg), Err(ConfigError::Invalid(msg)) if msg.contains(field))
    }

    #[test]
    fn parse_example_ok() {
        let cfg = sample();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sweeper.dedup_window_minutes, None);
        assert_eq!(cfg.due_soon(), chrono::Duration::minutes(60));
    }

    #[test]
    fn due_soon_defaults_when_omitted() {
        let yaml = example().replace("  due_soon_minutes: 60\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.sweeper.due_soon_minutes, 60);
    }

    #[test]
    fn invalid_bind_addr() {
        let mut cfg = sample();
        cfg.app.bind_addr = "localhost".into();
        assert!(rejected_for(&cfg, "bind_addr"));
    }

    #[test]
    fn invalid_push_settings() {
        let mut cfg = sample();
        cfg.push.vapid_private_key = "".into();
        assert!(rejected_for(&cfg, "vapid_private_key"));

        let mut cfg = sample();
        cfg.push.subject = "admin@example.com".into();
        assert!(rejected_for(&cfg, "subject"));

        let mut cfg = sample();
        cfg.push.ttl_seconds = 0;
        assert!(rejected_for(&cfg, "ttl_seconds"));
    }

    #[test]
    fn invalid_sweeper_settings() {
        let mut cfg = sample();
        cfg.sweeper.cron_secret = " ".into();
        assert!(rejected_for(&cfg, "cron_secret"));

        let mut cfg = sample();
        cfg.sweeper.dedup_window_minutes = Some(0);
        assert!(rejected_for(&cfg, "dedup_window_minutes"));
    }

    #[test]
    fn der_encoded_private_key_is_rejected() {
        let mut cfg = sample();
        // Length of a SEC1 DER P-256 key; web-push would panic on it.
        cfg.push.vapid_private_key = BASE64URL.encode([0x30u8; 109]);
        assert!(rejected_for(&cfg, "32-byte"));
    }

    #[test]
    fn vapid_keys_must_be_base64url() {
        let mut cfg = sample();
        cfg.push.vapid_private_key = "not base64!".into();
        assert!(rejected_for(&cfg, "vapid_private_key must be base64url"));

        let mut cfg = sample();
        cfg.push.vapid_public_key = "YOUR_VAPID_PUBLIC_KEY!".into();
        assert!(rejected_for(&cfg, "vapid_public_key must be base64url"));
    }

    #[test]
    fn keys_in_the_wrong_fields_are_rejected() {
        let mut cfg = sample();
        std::mem::swap(&mut cfg.push.vapid_public_key, &mut cfg.push.vapid_private_key);
        assert!(rejected_for(&cfg, "vapid_public_key"));

        let mut cfg = sample();
        let mut compressed = BASE64URL.decode(&cfg.push.vapid_public_key).unwrap();
        compressed[0] = 0x03;
        cfg.push.vapid_public_key = BASE64URL.encode(compressed);
        assert!(rejected_for(&cfg, "uncompressed"));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("nested").join("data");
        let mut cfg = sample();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("life-agent.yaml");
        fs::write(&path, example()).unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.push.ttl_seconds, 86400);
        assert_eq!(cfg.bind_addr().unwrap().port(), 8080);
    }
}
