//! CLI argument definitions for the Warden agent.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use warden_core::config::WardenConfig;

/// Warden: endpoint telemetry agent with durable, retrying delivery.
#[derive(Parser, Debug, Default)]
#[command(name = "warden-agent", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Collector base URL, e.g. https://collector.internal:8443.
    #[arg(short = 's', long = "server-url")]
    pub server_url: Option<String>,

    /// Data directory for the event buffer.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > WARDEN_CONFIG env var > platform default (~/.warden/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_with(env)
    }

    fn resolve_config_path_with(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = env("WARDEN_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Layer CLI flags and env vars over the loaded config.
    ///
    /// The API key is only taken from `WARDEN_API_KEY`, never from a flag,
    /// so it does not show up in process listings.
    pub fn apply_overrides(&self, config: &mut WardenConfig) {
        self.apply_overrides_with(config, env)
    }

    fn apply_overrides_with(&self, config: &mut WardenConfig, env: impl Fn(&str) -> Option<String>) {
        if let Some(url) = &self.server_url {
            config.server.url = url.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(key) = env("WARDEN_API_KEY") {
            config.server.api_key = key;
        }
    }

    /// Resolve the tracing filter directive.
    ///
    /// Priority: --log-level flag > RUST_LOG env var > config file value.
    pub fn resolve_log_filter(&self, config_level: &str) -> String {
        self.resolve_log_filter_with(config_level, env)
    }

    fn resolve_log_filter_with(
        &self,
        config_level: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        if let Some(filter) = env("RUST_LOG") {
            return filter;
        }
        config_level.to_string()
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".warden").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".warden").join("config.toml");
    }
    PathBuf::from("config.toml")
}
