//! Persistent key/value settings store using heed (LMDB).
//!
//! Values are plain strings. Keys are either scoped to an Android-style user
//! id (`user/<id>/<key>`) or global (`global/<key>`), mirroring the secure
//! and global settings tables the Bluetooth components persist into.

use std::{path::Path, path::PathBuf, sync::Arc};

use heed::{Database, Env, EnvOpenOptions, types::Str};
use log::debug;
use smol_str::{SmolStr, format_smolstr};
use thiserror::Error;

use crate::error::Result;

/// Errors that can occur in settings store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create settings directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Android-style user id.
pub type UserId = u32;

/// Global key recording whether the user left Bluetooth enabled.
pub const KEY_BLUETOOTH_ON: &str = "bluetooth_on";

struct Db {
   env: Env,
   entries: Database<Str, Str>,
}

/// Thread-safe handle to the settings database.
#[derive(Clone)]
pub struct SecureSettings {
   db: Arc<Db>,
}

impl std::fmt::Debug for SecureSettings {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SecureSettings")
         .field("path", &self.db.env.path())
         .finish()
   }
}

impl SecureSettings {
   /// Open or create the settings database at its default location.
   pub fn open() -> Result<Self> {
      let path = Self::db_path()?;
      Self::open_at(&path)
   }

   /// Open or create the settings database at `path`.
   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let entries = env
         .create_database(&mut wtxn, Some("settings"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened settings store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, entries }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("CARSERVICE_SETTINGS_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/carservice/settings.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("carservice").join("settings.db"))
   }

   fn user_key(user: UserId, key: &str) -> SmolStr {
      format_smolstr!("user/{user}/{key}")
   }

   fn global_key(key: &str) -> SmolStr {
      format_smolstr!("global/{key}")
   }

   fn get(&self, key: &str) -> Result<Option<String>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let value = self
         .db
         .entries
         .get(&rtxn, key)
         .map_err(Error::DatabaseOperation)?
         .map(str::to_owned);
      Ok(value)
   }

   fn put(&self, key: &str, value: &str) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .entries
         .put(&mut wtxn, key, value)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   /// Reads a user-scoped string.
   pub fn get_string_for_user(&self, user: UserId, key: &str) -> Result<Option<String>> {
      self.get(&Self::user_key(user, key))
   }

   /// Writes a user-scoped string.
   pub fn put_string_for_user(&self, user: UserId, key: &str, value: &str) -> Result<()> {
      self.put(&Self::user_key(user, key), value)
   }

   pub fn get_global(&self, key: &str) -> Result<Option<String>> {
      self.get(&Self::global_key(key))
   }

   pub fn put_global(&self, key: &str, value: &str) -> Result<()> {
      self.put(&Self::global_key(key), value)
   }

   /// Whether Bluetooth was left enabled. An unset value counts as enabled.
   pub fn is_bluetooth_persisted_on(&self) -> bool {
      match self.get_global(KEY_BLUETOOTH_ON) {
         Ok(Some(value)) => value.trim() != "0",
         Ok(None) => true,
         Err(e) => {
            log::warn!("Failed to read {KEY_BLUETOOTH_ON}: {e}");
            true
         },
      }
   }

   pub fn set_bluetooth_persisted_on(&self, on: bool) -> Result<()> {
      self.put_global(KEY_BLUETOOTH_ON, if on { "1" } else { "0" })
   }
}

#[cfg(test)]
pub(crate) fn open_test_settings() -> (SecureSettings, tempfile::TempDir) {
   let dir = tempfile::TempDir::new().unwrap();
   let settings = SecureSettings::open_at(&dir.path().join("settings.db")).unwrap();
   (settings, dir)
}
