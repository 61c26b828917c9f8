//! Configuration file management for shepherd.
//!
//! A TOML config file plus a resolution chain: CLI flag > env var > config
//! file > default. `shepherd init` writes the file with a fresh callback
//! secret.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub callback: CallbackSection,
    #[serde(default)]
    pub vcs: VcsSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Public surface: task creation, queries, observer stream.
    pub api_listen: String,
    /// Runner and provisioner surface.
    pub internal_listen: String,
    /// Liveness endpoint.
    pub health_listen: String,
    /// Accepted for compatibility; exporters are external.
    pub metrics_listen: Option<String>,
    /// API base URL handed to runners; defaults to the internal bind.
    pub public_api_url: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            api_listen: "127.0.0.1:8080".to_string(),
            internal_listen: "127.0.0.1:8081".to_string(),
            health_listen: "127.0.0.1:8082".to_string(),
            metrics_listen: None,
            public_api_url: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub database_url: String,
    pub namespace: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite://shepherd.db".to_string(),
            namespace: "default".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub max_infra_retries: i64,
    pub default_timeout_secs: i64,
    pub grace_secs: u64,
    pub event_ring_capacity: usize,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_infra_retries: 3,
            default_timeout_secs: 30 * 60,
            grace_secs: 30,
            event_ring_capacity: 4096,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    /// Hex-encoded HMAC key for callback signatures.
    pub secret: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsSection {
    pub app_id: Option<String>,
    pub installation_id: Option<String>,
    pub private_key_path: Option<String>,
}

// -----------------------------------------------------------------------
// Paths, read / write
// -----------------------------------------------------------------------

/// Default config path: `$SHEPHERD_CONFIG` or `shepherd.toml` next to the
/// working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var("SHEPHERD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("shepherd.toml"))
}

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (it holds the callback secret).
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random callback secret: 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for `serve`.
#[derive(Debug, Clone)]
pub struct ShepherdConfig {
    pub database_url: String,
    pub namespace: String,
    pub api_listen: SocketAddr,
    pub internal_listen: SocketAddr,
    pub health_listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,
    pub public_api_url: String,
    pub callback_secret: Vec<u8>,
    pub max_infra_retries: i64,
    pub default_timeout_secs: i64,
    pub grace_duration: Duration,
    pub event_ring_capacity: usize,
    pub vcs_app_id: Option<String>,
    pub vcs_installation_id: Option<String>,
    pub vcs_private_key_path: Option<String>,
}

impl ShepherdConfig {
    /// Resolve from file and environment.
    ///
    /// - Database URL: `cli_db_url` > `SHEPHERD_DATABASE_URL` > file > default.
    /// - Namespace: `SHEPHERD_NAMESPACE` > file > "default".
    /// - Callback secret: `SHEPHERD_CALLBACK_SECRET` > file > error.
    pub fn resolve(path: &Path, cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config(path).unwrap_or_default();

        let database_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("SHEPHERD_DATABASE_URL") {
            url
        } else {
            file.store.database_url.clone()
        };

        let namespace = std::env::var("SHEPHERD_NAMESPACE")
            .ok()
            .unwrap_or_else(|| file.store.namespace.clone());

        let secret_hex = if let Ok(secret) = std::env::var("SHEPHERD_CALLBACK_SECRET") {
            secret
        } else if let Some(secret) = file.callback.secret.clone() {
            secret
        } else {
            bail!(
                "callback secret not found; set SHEPHERD_CALLBACK_SECRET or run `shepherd init`"
            );
        };
        let callback_secret =
            hex::decode(&secret_hex).context("callback secret is not valid hex")?;

        let parse_addr = |label: &str, value: &str| -> Result<SocketAddr> {
            value
                .parse()
                .with_context(|| format!("invalid {label} address {value:?}"))
        };

        let api_listen = parse_addr("api_listen", &file.server.api_listen)?;
        let internal_listen = parse_addr("internal_listen", &file.server.internal_listen)?;
        let health_listen = parse_addr("health_listen", &file.server.health_listen)?;
        let metrics_listen = file
            .server
            .metrics_listen
            .as_deref()
            .map(|v| parse_addr("metrics_listen", v))
            .transpose()?;

        let public_api_url = file
            .server
            .public_api_url
            .clone()
            .unwrap_or_else(|| format!("http://{internal_listen}"));

        Ok(Self {
            database_url,
            namespace,
            api_listen,
            internal_listen,
            health_listen,
            metrics_listen,
            public_api_url,
            callback_secret,
            max_infra_retries: file.lifecycle.max_infra_retries,
            default_timeout_secs: file.lifecycle.default_timeout_secs,
            grace_duration: Duration::from_secs(file.lifecycle.grace_secs),
            event_ring_capacity: file.lifecycle.event_ring_capacity,
            vcs_app_id: file.vcs.app_id,
            vcs_installation_id: file.vcs.installation_id,
            vcs_private_key_path: file.vcs.private_key_path,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
