use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WardenError};

/// Top-level configuration for the Warden agent.
///
/// Loaded from `~/.warden/config.toml` by default. Every section falls back
/// to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WardenConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = self.server.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(WardenError::Config(format!(
                "server.url must be an http(s) URL, got {:?}",
                self.server.url
            )));
        }
        if self.server.timeout_secs == 0 {
            return Err(WardenError::Config("server.timeout_secs must be > 0".into()));
        }
        if self.buffer.max_size == 0 {
            return Err(WardenError::Config("buffer.max_size must be > 0".into()));
        }
        if self.buffer.flush_size == 0 {
            return Err(WardenError::Config("buffer.flush_size must be > 0".into()));
        }
        if self.buffer.flush_size > self.buffer.max_size {
            return Err(WardenError::Config(format!(
                "buffer.flush_size ({}) exceeds buffer.max_size ({})",
                self.buffer.flush_size, self.buffer.max_size
            )));
        }
        if self.buffer.flush_period_secs == 0 {
            return Err(WardenError::Config(
                "buffer.flush_period_secs must be > 0".into(),
            ));
        }
        if self.activity.poll_interval_secs == 0 {
            return Err(WardenError::Config(
                "activity.poll_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Data directory with a leading `~` expanded to the user's home.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Directory holding the event buffer snapshot.
    pub fn buffer_dir(&self) -> PathBuf {
        if self.buffer.dir.is_empty() {
            self.data_dir().join("buffer")
        } else {
            expand_home(&self.buffer.dir)
        }
    }

    /// Computer name from config, then the environment.
    pub fn computer_name(&self) -> String {
        if !self.general.computer_name.is_empty() {
            return self.general.computer_name.clone();
        }
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Expand `~/` (or `~\`) to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the buffer snapshot and other local state.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Host name reported with every segment. Empty means auto-detect.
    pub computer_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.warden/data".to_string(),
            log_level: "info".to_string(),
            computer_name: String::new(),
        }
    }
}

/// Collector connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Collector base URL.
    pub url: String,
    /// Credential sent as `X-API-Key`. Empty disables the header.
    pub api_key: String,
    /// Path for batched event uploads.
    pub events_endpoint: String,
    /// Path for direct activity segment uploads (used when no buffer is wired).
    pub activity_endpoint: String,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Delay before each retry.
    pub retry_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            events_endpoint: "/api/events/batch".to_string(),
            activity_endpoint: "/api/activity/segment".to_string(),
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// The API key, or `None` when unset.
    pub fn api_key(&self) -> Option<String> {
        let key = self.api_key.trim();
        (!key.is_empty()).then(|| key.to_string())
    }
}

/// Event buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of events held in memory.
    pub max_size: usize,
    /// Queue length that triggers an early flush.
    pub flush_size: usize,
    /// Periodic flush interval.
    pub flush_period_secs: u64,
    /// Snapshot directory. Empty means `<data_dir>/buffer`.
    pub dir: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            flush_size: 50,
            flush_period_secs: 30,
            dir: String::new(),
        }
    }
}

impl BufferConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }
}

/// Activity tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Whether the activity tracker runs at all.
    pub enabled: bool,
    /// Seconds between idle/foreground samples.
    pub poll_interval_secs: u64,
    /// Idle seconds after which the user is considered idle.
    pub idle_threshold_secs: u64,
    /// Report window titles. When false, titles are blanked before upload.
    pub track_window_titles: bool,
    /// Report process names. When false, names are blanked before upload.
    pub track_process_names: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            idle_threshold_secs: 300,
            track_window_titles: true,
            track_process_names: true,
        }
    }
}

impl ActivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
