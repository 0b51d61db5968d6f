use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub transactions: TransactionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the seller API, e.g. "https://api.example.com/v1/"
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Age after which a cached entry is refetched on read
  #[serde(default = "default_stale_after_secs")]
  pub stale_after_secs: u64,
  /// Unread badge refresh period while it is visible
  #[serde(default = "default_unread_refresh_secs")]
  pub unread_refresh_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: default_stale_after_secs(),
      unread_refresh_secs: default_unread_refresh_secs(),
    }
  }
}

impl SyncConfig {
  pub fn stale_after(&self) -> Duration {
    Duration::from_secs(self.stale_after_secs)
  }

  pub fn unread_refresh_interval(&self) -> Duration {
    Duration::from_secs(self.unread_refresh_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsConfig {
  /// Page size used by the fallback scan in `resolve_by_id`
  #[serde(default = "default_scan_page_size")]
  pub scan_page_size: u32,
  /// Hard cap on pages the fallback scan may fetch
  #[serde(default = "default_scan_max_pages")]
  pub scan_max_pages: u32,
  /// Skip direct lookup once the service reported it as not implemented
  #[serde(default)]
  pub remember_unsupported_lookup: bool,
}

impl Default for TransactionsConfig {
  fn default() -> Self {
    Self {
      scan_page_size: default_scan_page_size(),
      scan_max_pages: default_scan_max_pages(),
      remember_unsupported_lookup: false,
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_stale_after_secs() -> u64 {
  30
}

fn default_unread_refresh_secs() -> u64 {
  30
}

fn default_scan_page_size() -> u32 {
  100
}

fn default_scan_max_pages() -> u32 {
  10
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledgersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledgersync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ledgersync/config.yaml\n\
                 with at least `api.base_url` set."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ledgersync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledgersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }
    if config.transactions.scan_page_size == 0 {
      return Err(eyre!("transactions.scan_page_size must be positive"));
    }
    if config.transactions.scan_max_pages == 0 {
      return Err(eyre!("transactions.scan_max_pages must be positive"));
    }
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks LEDGERSYNC_API_TOKEN first, then SELLER_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("LEDGERSYNC_API_TOKEN")
      .or_else(|_| std::env::var("SELLER_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set LEDGERSYNC_API_TOKEN or SELLER_API_TOKEN environment variable.")
      })
  }
}
