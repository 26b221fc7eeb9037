//! Error types for the car service daemon.
//!
//! Collaborator calls (Bluetooth stack, D-Bus, storage) surface their
//! failures through [`CarServiceError`]; the component layer decides
//! whether a failure is logged and swallowed or propagated.

use bluer::Address;
use thiserror::Error;

use crate::{bluetooth::profile::Profile, settings};

/// Main error type for the car service.
#[derive(Error, Debug)]
pub enum CarServiceError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Settings error: {0}")]
   Settings(#[from] settings::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid connection format: {0}")]
   InvalidConnectionFormat(String),

   #[error("Unknown profile id: {0}")]
   UnknownProfile(u32),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Proxy for {0} is not available")]
   ProxyUnavailable(Profile),

   #[error("Remote call failed for {0}: {1}")]
   Remote(Address, String),

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `CarServiceError`.
pub type Result<T> = std::result::Result<T, CarServiceError>;
