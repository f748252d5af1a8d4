//! Daemon configuration
//!
//! Settings come from an optional JSON file, then environment variables
//! override individual fields.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::coordinator::DEFAULT_COOLDOWN;
use crate::ipc::SOCKET_PATH;
use crate::origin::REQUEST_TIMEOUT;

pub const ENV_CONFIG: &str = "OFFLINE_CACHE_CONFIG";
pub const ENV_ORIGIN: &str = "OFFLINE_CACHE_ORIGIN";
pub const ENV_PREFIX: &str = "OFFLINE_CACHE_PREFIX";
pub const ENV_SOCKET: &str = "OFFLINE_CACHE_SOCKET";
pub const ENV_STORE_DIR: &str = "OFFLINE_CACHE_STORE_DIR";
pub const ENV_DEPLOYMENT_URL: &str = "OFFLINE_CACHE_DEPLOYMENT_URL";
pub const ENV_MANIFEST: &str = "OFFLINE_CACHE_MANIFEST";

const DEFAULT_ORIGIN: &str = "http://localhost:8080";
const DEFAULT_PREFIX: &str = "offline-cache";
const DEFAULT_DEPLOYMENT_PATH: &str = "/deployment.json";

/// Shortest period of the background update check
const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Resource store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Disk,
    Memory,
}

/// Where the current deployment descriptor lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentLocation {
    Url(Url),
    File(PathBuf),
}

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Hosting origin URL
    pub origin: String,
    /// Generation name prefix
    pub prefix: String,
    /// Control socket path
    pub socket_path: PathBuf,
    pub store: StoreBackend,
    /// Disk store root (platform cache dir if unset)
    pub store_dir: Option<PathBuf>,
    /// Deployment descriptor URL, absolute or relative to the origin
    pub deployment_url: Option<String>,
    /// Local deployment descriptor, used when no URL is set
    pub manifest_path: Option<PathBuf>,
    pub update_cooldown_secs: u64,
    pub request_timeout_secs: u64,
    pub skip_waiting_on_install: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            socket_path: PathBuf::from(SOCKET_PATH),
            store: StoreBackend::Disk,
            store_dir: None,
            deployment_url: None,
            manifest_path: None,
            update_cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
            request_timeout_secs: REQUEST_TIMEOUT.as_secs(),
            skip_waiting_on_install: true,
        }
    }
}

impl Config {
    /// Load from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| env::var(key).ok())
    }

    /// Load from an optional file plus the given variable lookup
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let data = std::fs::read(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_slice(&data)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Config::default(),
        };

        config.apply_env(lookup);
        config.origin_url()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = lookup(ENV_ORIGIN) {
            self.origin = origin;
        }
        if let Some(prefix) = lookup(ENV_PREFIX) {
            self.prefix = prefix;
        }
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(dir) = lookup(ENV_STORE_DIR) {
            if dir == "memory" {
                self.store = StoreBackend::Memory;
            } else {
                self.store = StoreBackend::Disk;
                self.store_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(url) = lookup(ENV_DEPLOYMENT_URL) {
            self.deployment_url = Some(url);
        }
        if let Some(manifest) = lookup(ENV_MANIFEST) {
            self.manifest_path = Some(PathBuf::from(manifest));
        }
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).with_context(|| format!("Invalid origin URL '{}'", self.origin))
    }

    pub fn agent_config(&self) -> Result<AgentConfig> {
        Ok(AgentConfig {
            origin: self.origin_url()?,
            prefix: self.prefix.clone(),
            skip_waiting_on_install: self.skip_waiting_on_install,
        })
    }

    /// Resolve the deployment descriptor location
    ///
    /// A URL wins over a manifest path; with neither, the descriptor is
    /// fetched from `/deployment.json` on the origin.
    pub fn deployment_location(&self) -> Result<DeploymentLocation> {
        let origin = self.origin_url()?;
        match (&self.deployment_url, &self.manifest_path) {
            (Some(url), _) => origin
                .join(url)
                .map(DeploymentLocation::Url)
                .with_context(|| format!("Invalid deployment URL '{}'", url)),
            (None, Some(path)) => Ok(DeploymentLocation::File(path.clone())),
            (None, None) => origin
                .join(DEFAULT_DEPLOYMENT_PATH)
                .map(DeploymentLocation::Url)
                .context("Invalid default deployment URL"),
        }
    }

    pub fn update_cooldown(&self) -> Duration {
        Duration::from_secs(self.update_cooldown_secs)
    }

    /// Period of the background update check; the cooldown, never zero
    pub fn update_interval(&self) -> Duration {
        self.update_cooldown().max(MIN_UPDATE_INTERVAL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with(None, no_env).unwrap();
        assert_eq!(config.prefix, "offline-cache");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/offline-cache.sock"));
        assert_eq!(config.update_cooldown(), Duration::from_secs(300));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.skip_waiting_on_install);
        assert_eq!(config.store, StoreBackend::Disk);
        assert_eq!(
            config.deployment_location().unwrap(),
            DeploymentLocation::Url(Url::parse("http://localhost:8080/deployment.json").unwrap())
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"origin":"https://game.example.com","updateCooldownSecs":60,"manifestPath":"/srv/deployment.json"}"#,
        )
        .unwrap();

        let config = Config::load_with(Some(&path), no_env).unwrap();
        assert_eq!(config.origin, "https://game.example.com");
        assert_eq!(config.update_cooldown(), Duration::from_secs(60));
        assert_eq!(config.prefix, "offline-cache");
        assert_eq!(
            config.deployment_location().unwrap(),
            DeploymentLocation::File(PathBuf::from("/srv/deployment.json"))
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"prefix":"from-file","deploymentUrl":"/v.json"}"#).unwrap();

        let env: HashMap<&str, &str> = [
            (ENV_PREFIX, "from-env"),
            (ENV_STORE_DIR, "memory"),
            (ENV_ORIGIN, "http://127.0.0.1:3000"),
        ]
        .into_iter()
        .collect();
        let config =
            Config::load_with(Some(&path), |key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.prefix, "from-env");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(
            config.deployment_location().unwrap(),
            DeploymentLocation::Url(Url::parse("http://127.0.0.1:3000/v.json").unwrap())
        );

        let agent = config.agent_config().unwrap();
        assert_eq!(agent.prefix, "from-env");
        assert_eq!(agent.origin.as_str(), "http://127.0.0.1:3000/");
    }

    #[test]
    fn test_zero_cooldown_keeps_a_nonzero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"updateCooldownSecs":0}"#).unwrap();

        let config = Config::load_with(Some(&path), no_env).unwrap();
        assert_eq!(config.update_cooldown(), Duration::ZERO);
        assert_eq!(config.update_interval(), Duration::from_secs(1));

        let default = Config::load_with(None, no_env).unwrap();
        assert_eq!(default.update_interval(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_interval_drives_a_timer() {
        let config = Config {
            update_cooldown_secs: 0,
            ..Config::default()
        };
        let mut interval = tokio::time::interval(config.update_interval());
        interval.tick().await;
        interval.tick().await;
    }

    #[test]
    fn test_invalid_origin_is_rejected() {
        let result = Config::load_with(None, |key| {
            (key == ENV_ORIGIN).then(|| "not a url".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_with(Some(&dir.path().join("absent.json")), no_env).is_err());
    }
}
