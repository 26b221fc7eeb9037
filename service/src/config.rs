//! Configuration management for the car service.
//!
//! Loaded once at startup from a TOML file; missing sections and keys fall
//! back to defaults so that an empty file is a valid configuration.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CarServiceError, Result};

/// Garage mode may never be configured shorter than this, unless overridden.
pub const MIN_MAX_GARAGE_MODE_DURATION: Duration = Duration::from_secs(15 * 60);

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
   #[serde(default)]
   pub power: PowerConfig,

   #[serde(default)]
   pub bluetooth: BluetoothConfig,

   #[serde(default)]
   pub dbus: DbusConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PowerConfig {
   #[serde(default = "default_max_garage_mode_duration")]
   pub max_garage_mode_duration_secs: u64,

   /// Debug override, not subject to the garage mode floor.
   #[serde(default)]
   pub garage_mode_duration_override_secs: Option<u64>,

   #[serde(default = "default_true")]
   pub power_state_supported: bool,

   #[serde(default = "default_true")]
   pub deep_sleep_allowed: bool,

   #[serde(default = "default_true")]
   pub timed_wakeup_allowed: bool,

   #[serde(default = "default_true")]
   pub system_supports_deep_sleep: bool,

   /// User to bring to the foreground on ON (after the boot-time ON).
   #[serde(default)]
   pub target_user: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BluetoothConfig {
   #[serde(default = "default_true")]
   pub use_default_connection_policy: bool,

   #[serde(default = "default_user_id")]
   pub user_id: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
   #[default]
   System,
   Session,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DbusConfig {
   #[serde(default)]
   pub bus: BusKind,
}

const fn default_max_garage_mode_duration() -> u64 {
   MIN_MAX_GARAGE_MODE_DURATION.as_secs()
}

const fn default_true() -> bool {
   true
}

const fn default_user_id() -> u32 {
   10
}

impl Default for PowerConfig {
   fn default() -> Self {
      Self {
         max_garage_mode_duration_secs: default_max_garage_mode_duration(),
         garage_mode_duration_override_secs: None,
         power_state_supported: true,
         deep_sleep_allowed: true,
         timed_wakeup_allowed: true,
         system_supports_deep_sleep: true,
         target_user: None,
      }
   }
}

impl Default for BluetoothConfig {
   fn default() -> Self {
      Self {
         use_default_connection_policy: true,
         user_id: default_user_id(),
      }
   }
}

impl PowerConfig {
   /// Upper bound of the shutdown-prepare (garage mode) window.
   pub fn max_garage_mode_duration(&self) -> Duration {
      if let Some(secs) = self.garage_mode_duration_override_secs {
         return Duration::from_secs(secs);
      }
      Duration::from_secs(self.max_garage_mode_duration_secs).max(MIN_MAX_GARAGE_MODE_DURATION)
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("CARSERVICE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(CarServiceError::ConfigDirNotFound);
      };

      Ok(config_dir.join("carservice").join("config.toml"))
   }
}
