use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::SqliteStorage;

/// Environment variable that overrides the configured cache generation.
const GENERATION_ENV: &str = "OFFGRID_GENERATION";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server the proxy fronts; relative asset paths resolve against it
  pub origin: String,
  /// Address the proxy listens on
  pub listen: String,
  /// Cache generation identifier. Changing it retires every older cache.
  pub generation: String,
  /// Resources pre-cached at install, in order. May be absolute URLs.
  pub shell_assets: Vec<String>,
  pub routes: RoutesConfig,
  /// Sync tag that asks open contexts to flush their pending writes
  pub sync_tag: String,
  /// Message inside the 503 envelope returned for unreachable API calls
  pub offline_message: String,
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting: bool,
  /// Cache database path (default: $XDG_DATA_HOME/offgrid/cache.db)
  pub cache_path: Option<PathBuf>,
  /// Write daily rolling log files here in addition to stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefixes served cache-first. "/" matches only the root itself.
  pub shell: Vec<String>,
  /// Path prefix of data endpoints, served network-first
  pub api_root: String,
  /// Path fragment marking messaging-style write endpoints, served network-first
  pub mutation_marker: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://127.0.0.1:8000".to_string(),
      listen: "127.0.0.1:8080".to_string(),
      generation: "jaytipargal-v1".to_string(),
      shell_assets: [
        "/",
        "/dashboard/",
        "/diary/",
        "/diary/write/",
        "/goals/",
        "/notes/",
        "/astro/",
        "/static/css/custom.css",
        "/static/js/offline-sync.js",
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/js/bootstrap.bundle.min.js",
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
        "https://fonts.googleapis.com/css2?family=Playfair+Display:ital,wght@0,400;0,600;0,700;1,400&family=Lato:wght@300;400;700&family=Dancing+Script:wght@400;600&display=swap",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      routes: RoutesConfig::default(),
      sync_tag: "sync-diary-entries".to_string(),
      offline_message: "You are offline. Your data will sync when connection returns.".to_string(),
      skip_waiting: true,
      cache_path: None,
      log_dir: None,
    }
  }
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      shell: [
        "/",
        "/dashboard/",
        "/diary/",
        "/goals/",
        "/notes/",
        "/astro/",
        "/static/",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_root: "/api/".to_string(),
      mutation_marker: "/send_message/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_generation_override(std::env::var(GENERATION_ENV).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Replace the generation when an injected one is present and non-empty.
  fn with_generation_override(self, generation: Option<String>) -> Self {
    match generation {
      Some(generation) if !generation.trim().is_empty() => Self {
        generation: generation.trim().to_string(),
        ..self
      },
      _ => self,
    }
  }

  /// The origin as a URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin URL '{}': {}", self.origin, e))
  }

  /// Cache database location, defaulting to the user's data directory.
  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache_path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
