use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Relay server config, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// SQLite database path.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Hex-encoded token signing key (at least 32 bytes). Generated per run
    /// when absent, which invalidates sessions on restart.
    pub token_key: Option<String>,
    /// Hex-encoded 32-byte key for secrets at rest. Without it, second-factor
    /// operations are unavailable.
    pub secret_key: Option<String>,
    /// Treat loopback callers without credentials as a local superadmin.
    /// Development only.
    #[serde(default)]
    pub allow_loopback_admin: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Requests per second per client IP on `/auth/*`.
    pub auth_rate_limit: Option<u32>,
    #[serde(default = "default_enrollment_ttl_hours")]
    pub enrollment_token_ttl_hours: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            database: default_database(),
            token_key: None,
            secret_key: None,
            allow_loopback_admin: false,
            cors_origins: Vec::new(),
            auth_rate_limit: None,
            enrollment_token_ttl_hours: default_enrollment_ttl_hours(),
        }
    }
}

/// Agent config. `endpoint_id` and `endpoint_secret` are written by
/// `deskrelay enroll`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    pub endpoint_id: Option<String>,
    pub endpoint_secret: Option<String>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server_url", &self.server_url)
            .field("staging_dir", &self.staging_dir)
            .field("endpoint_id", &self.endpoint_id)
            .field("enrolled", &self.endpoint_secret.is_some())
            .finish()
    }
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            staging_dir: default_staging_dir(),
            endpoint_id: None,
            endpoint_secret: None,
        }
    }

    pub fn is_enrolled(&self) -> bool {
        self.endpoint_id.is_some() && self.endpoint_secret.is_some()
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8443))
}

fn default_database() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("deskrelay")
        .join("relay.db")
}

fn default_enrollment_ttl_hours() -> u64 {
    24
}

#[cfg(windows)]
fn default_staging_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\deskrelay\staging")
}

#[cfg(not(windows))]
fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/deskrelay/staging")
}

/// `<config dir>/deskrelay/<file>`.
pub fn default_config_path(file: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskrelay")
        .join(file)
}

impl RelayConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    pub fn token_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.token_key
            .as_deref()
            .map(|k| decode_key("token_key", k, 32))
            .transpose()
    }

    pub fn secret_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.secret_key
            .as_deref()
            .map(|k| decode_key("secret_key", k, 32))
            .transpose()
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        load_toml(path)
    }

    /// Save, restricting the file to its owner since it holds the endpoint
    /// secret.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        save_toml(self, path)?;
        restrict_permissions(path)
    }
}

/// Decode a hex key, requiring at least `min_len` bytes.
pub fn decode_key(field: &'static str, hex_key: &str, min_len: usize) -> Result<Vec<u8>, ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::InvalidKey {
        field,
        reason: e.to_string(),
    })?;
    if bytes.len() < min_len {
        return Err(ConfigError::InvalidKey {
            field,
            reason: format!("expected at least {min_len} bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes)
}

/// Fresh random key as hex, for `deskrelay` config generation and
/// per-run fallbacks.
pub fn generate_key_hex() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    // Warn if the config file is world-readable (may contain keys).
    check_config_permissions(path);

    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
    let config = toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
    Ok(Some(config))
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    }
    let contents = toml::to_string_pretty(value)?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, std::io::Error),
    #[error("Failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("Failed to write config {}: {1}", .0.display())]
    WriteFailed(PathBuf, std::io::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("Invalid {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain keys or endpoint secrets -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
