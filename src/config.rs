//! Server configuration: an optional TOML file overridden by command line flags.

use crate::error::ConfigError;
use crate::job::CronSpec;
use crate::storage::SessionTemplate;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[clap(name = "cadence-server", about = "Session scheduling server")]
pub struct CliArgs {
  /// Path to a TOML configuration file.
  #[clap(short, long)]
  pub config: Option<PathBuf>,

  /// Address to listen on, e.g. 127.0.0.1:3000.
  #[clap(long)]
  pub listen_addr: Option<SocketAddr>,

  /// Path to the SQLite database file.
  #[clap(long)]
  pub database_path: Option<PathBuf>,

  /// Keep all data in memory instead of SQLite.
  #[clap(long)]
  pub in_memory: bool,

  /// How many weeks ahead to generate sessions.
  #[clap(long)]
  pub weeks_ahead: Option<u32>,

  /// Shutdown deadline in seconds.
  #[clap(long)]
  pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
  pub listen_addr: SocketAddr,
  pub database_path: PathBuf,
  pub in_memory: bool,
  pub generation: GenerationConfig,
  pub cleanup: CleanupConfig,
  pub shutdown: ShutdownConfig,
  /// Templates upserted into storage at boot.
  pub templates: Vec<SessionTemplate>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
  pub weeks_ahead: u32,
  pub skip_existing: bool,
  pub schedule: String,
  pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
  pub schedule: String,
  pub timezone: String,
  pub retention_days: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
  pub timeout_secs: u64,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
      database_path: PathBuf::from("cadence.db"),
      in_memory: false,
      generation: GenerationConfig::default(),
      cleanup: CleanupConfig::default(),
      shutdown: ShutdownConfig::default(),
      templates: Vec::new(),
    }
  }
}

impl Default for GenerationConfig {
  fn default() -> Self {
    Self {
      weeks_ahead: 2,
      skip_existing: true,
      schedule: "0 0 * * * *".to_string(),
      timezone: "UTC".to_string(),
    }
  }
}

impl Default for CleanupConfig {
  fn default() -> Self {
    Self {
      schedule: "0 */15 * * * *".to_string(),
      timezone: "UTC".to_string(),
      retention_days: 30,
    }
  }
}

impl Default for ShutdownConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

impl ShutdownConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl AppConfig {
  pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&content, path)
  }

  /// Loads the file named by `--config` (if any), applies the remaining
  /// flags on top and validates the result.
  pub fn resolve(cli: &CliArgs) -> Result<Self, ConfigError> {
    let mut config = match &cli.config {
      Some(path) => Self::load(path)?,
      None => Self::default(),
    };

    if let Some(addr) = cli.listen_addr {
      config.listen_addr = addr;
    }
    if let Some(path) = &cli.database_path {
      config.database_path = path.clone();
    }
    if cli.in_memory {
      config.in_memory = true;
    }
    if let Some(weeks) = cli.weeks_ahead {
      config.generation.weeks_ahead = weeks;
    }
    if let Some(secs) = cli.shutdown_timeout_secs {
      config.shutdown.timeout_secs = secs;
    }

    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.generation.weeks_ahead == 0 {
      return Err(ConfigError::Invalid(
        "generation.weeks_ahead must be greater than zero".to_string(),
      ));
    }
    if self.shutdown.timeout_secs == 0 {
      return Err(ConfigError::Invalid(
        "shutdown.timeout_secs must be greater than zero".to_string(),
      ));
    }
    CronSpec::parse(&self.generation.schedule, &self.generation.timezone)
      .map_err(|e| ConfigError::Invalid(format!("generation.schedule: {}", e)))?;
    CronSpec::parse(&self.cleanup.schedule, &self.cleanup.timezone)
      .map_err(|e| ConfigError::Invalid(format!("cleanup.schedule: {}", e)))?;

    for template in &self.templates {
      if template.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(ConfigError::Invalid(format!(
          "template {} has unknown timezone '{}'",
          template.id, template.timezone
        )));
      }
      if template.weekdays.is_empty() {
        return Err(ConfigError::Invalid(format!(
          "template {} has no weekdays",
          template.id
        )));
      }
    }
    Ok(())
  }
}
