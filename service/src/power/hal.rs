//! Collaborators of the power controller.
//!
//! [`PowerHal`] is the vehicle side: it delivers power state requests and
//! receives the controller's answers. [`SystemInterface`] is the local
//! system: display, wake locks, users and the actual suspend/shutdown.

use std::{
   io,
   path::{Path, PathBuf},
   time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   fs::OpenOptions,
   io::AsyncWriteExt,
   process::Command,
   sync::{mpsc, oneshot, watch},
};

use super::state::PowerState;
use crate::{config::PowerConfig, settings::UserId};

/// Id of the headless system user; never a switch target.
pub const SYSTEM_USER: UserId = 0;

/// Events pushed by the vehicle HAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerHalEvent {
   PowerStateChange(PowerState),
   DisplayBrightnessChange(i32),
}

pub type PowerHalListener = mpsc::UnboundedSender<PowerHalEvent>;

/// Vehicle power HAL.
pub trait PowerHal: Send + Sync {
   /// Installs the sink for HAL events, replacing any previous one.
   fn set_listener(&self, listener: PowerHalListener);

   fn is_power_state_supported(&self) -> bool;
   fn is_deep_sleep_allowed(&self) -> bool;
   fn is_timed_wakeup_allowed(&self) -> bool;

   fn send_wait_for_vhal(&self);
   fn send_shutdown_cancel(&self);
   fn send_sleep_exit(&self);
   fn send_on(&self);
   fn send_shutdown_prepare(&self);
   fn send_shutdown_postpone(&self, duration: Duration);
   fn send_shutdown_start(&self, wakeup_sec: u32);
   fn send_sleep_entry(&self, wakeup_sec: u32);
   fn send_display_brightness(&self, brightness: i32);
}

/// Local system operations used during power transitions.
pub trait SystemInterface: Send + Sync {
   fn set_display_state(&self, on: bool);
   fn set_display_brightness(&self, brightness: i32);
   fn refresh_display_brightness(&self);
   fn is_system_supporting_deep_sleep(&self) -> bool;
   fn switch_to_partial_wake_lock(&self);
   fn release_all_wake_locks(&self);
   fn current_user(&self) -> UserId;
   fn switch_user(&self, user: UserId);
   /// Follows the foreground user, starting from the current one.
   fn user_switches(&self) -> watch::Receiver<UserId>;

   /// Suspends to RAM. Resolves after wake-up; false if suspend failed.
   fn enter_deep_sleep(&self) -> BoxFuture<'_, bool>;
   fn shutdown(&self) -> BoxFuture<'_, ()>;
}

// === Logging HAL ===

/// HAL used when no vehicle bus bridge is present. Outgoing messages are
/// logged; requests arrive through the D-Bus interface.
pub struct LoggingPowerHal {
   listener: Mutex<Option<PowerHalListener>>,
   power_state_supported: bool,
   deep_sleep_allowed: bool,
   timed_wakeup_allowed: bool,
}

impl LoggingPowerHal {
   pub fn new(config: &PowerConfig) -> Self {
      Self {
         listener: Mutex::new(None),
         power_state_supported: config.power_state_supported,
         deep_sleep_allowed: config.deep_sleep_allowed,
         timed_wakeup_allowed: config.timed_wakeup_allowed,
      }
   }

   /// Feeds a HAL event as if the vehicle had sent it.
   pub fn inject(&self, event: PowerHalEvent) -> bool {
      match self.listener.lock().as_ref() {
         Some(listener) => listener.send(event).is_ok(),
         None => {
            warn!("Dropping HAL event {event:?}: no listener");
            false
         },
      }
   }
}

impl PowerHal for LoggingPowerHal {
   fn set_listener(&self, listener: PowerHalListener) {
      *self.listener.lock() = Some(listener);
   }

   fn is_power_state_supported(&self) -> bool {
      self.power_state_supported
   }

   fn is_deep_sleep_allowed(&self) -> bool {
      self.deep_sleep_allowed
   }

   fn is_timed_wakeup_allowed(&self) -> bool {
      self.timed_wakeup_allowed
   }

   fn send_wait_for_vhal(&self) {
      info!("HAL <- WAIT_FOR_VHAL");
   }

   fn send_shutdown_cancel(&self) {
      info!("HAL <- SHUTDOWN_CANCELLED");
   }

   fn send_sleep_exit(&self) {
      info!("HAL <- DEEP_SLEEP_EXIT");
   }

   fn send_on(&self) {
      info!("HAL <- ON");
   }

   fn send_shutdown_prepare(&self) {
      info!("HAL <- SHUTDOWN_PREPARE");
   }

   fn send_shutdown_postpone(&self, duration: Duration) {
      info!("HAL <- SHUTDOWN_POSTPONE {}ms", duration.as_millis());
   }

   fn send_shutdown_start(&self, wakeup_sec: u32) {
      info!("HAL <- SHUTDOWN_START (wakeup in {wakeup_sec}s)");
   }

   fn send_sleep_entry(&self, wakeup_sec: u32) {
      info!("HAL <- DEEP_SLEEP_ENTRY (wakeup in {wakeup_sec}s)");
   }

   fn send_display_brightness(&self, brightness: i32) {
      info!("HAL <- DISPLAY_BRIGHTNESS {brightness}");
   }
}

// === Linux System ===

const SYS_POWER_DIR: &str = "/sys/power";
const SYS_BACKLIGHT_DIR: &str = "/sys/class/backlight";
const WAKE_LOCK_NAME: &str = "carserviced";

/// One queued sysfs operation.
enum SysfsWrite {
   Value {
      path: PathBuf,
      value: String,
      done: Option<oneshot::Sender<bool>>,
   },
   /// Brightness as a percentage of `max_brightness`.
   Brightness { dir: PathBuf, percent: i32 },
}

/// [`SystemInterface`] backed by sysfs and systemd.
///
/// All sysfs writes go through one task, so they land in call order.
pub struct LinuxSystemInterface {
   supports_deep_sleep: bool,
   power_dir: PathBuf,
   backlight: Option<PathBuf>,
   brightness: Mutex<i32>,
   wake_lock_held: Mutex<bool>,
   current_user: watch::Sender<UserId>,
   writer: mpsc::UnboundedSender<SysfsWrite>,
}

impl LinuxSystemInterface {
   pub fn new(config: &PowerConfig, initial_user: UserId) -> Self {
      Self::with_paths(
         config,
         initial_user,
         PathBuf::from(SYS_POWER_DIR),
         Self::find_backlight(Path::new(SYS_BACKLIGHT_DIR)),
      )
   }

   /// Uses `power_dir` in place of `/sys/power` and `backlight` as the
   /// backlight device directory. Must be called within a runtime.
   pub fn with_paths(
      config: &PowerConfig,
      initial_user: UserId,
      power_dir: PathBuf,
      backlight: Option<PathBuf>,
   ) -> Self {
      let (writer, rx) = mpsc::unbounded_channel();
      tokio::spawn(run_sysfs_writer(rx));
      Self {
         supports_deep_sleep: config.system_supports_deep_sleep,
         power_dir,
         backlight,
         brightness: Mutex::new(100),
         wake_lock_held: Mutex::new(false),
         current_user: watch::Sender::new(initial_user),
         writer,
      }
   }

   fn find_backlight(root: &Path) -> Option<PathBuf> {
      std::fs::read_dir(root)
         .ok()?
         .filter_map(|entry| entry.ok())
         .map(|entry| entry.path())
         .next()
   }

   fn queue(&self, write: SysfsWrite) {
      if self.writer.send(write).is_err() {
         warn!("Sysfs writer is gone, dropping write");
      }
   }

   fn write(&self, path: PathBuf, value: impl Into<String>) {
      self.queue(SysfsWrite::Value {
         path,
         value: value.into(),
         done: None,
      });
   }

   fn write_backlight(&self, file: &str, value: &str) {
      if let Some(dir) = &self.backlight {
         self.write(dir.join(file), value);
      }
   }
}

async fn run_sysfs_writer(mut rx: mpsc::UnboundedReceiver<SysfsWrite>) {
   while let Some(write) = rx.recv().await {
      match write {
         SysfsWrite::Value { path, value, done } => {
            let ok = write_sysfs(&path, &value).await;
            if let Some(done) = done {
               let _ = done.send(ok);
            }
         },
         SysfsWrite::Brightness { dir, percent } => {
            let max = match tokio::fs::read_to_string(dir.join("max_brightness")).await {
               Ok(max) => max.trim().parse::<i64>().unwrap_or(100),
               Err(_) => 100,
            };
            let value = max * i64::from(percent) / 100;
            write_sysfs(&dir.join("brightness"), &value.to_string()).await;
         },
      }
   }
}

/// Writes an existing attribute; sysfs files are never created.
async fn write_sysfs(path: &Path, value: &str) -> bool {
   let result: io::Result<()> = async {
      let mut file = OpenOptions::new()
         .write(true)
         .truncate(true)
         .open(path)
         .await?;
      file.write_all(value.as_bytes()).await?;
      file.flush().await
   }
   .await;
   match result {
      Ok(()) => true,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
         debug!("{} does not exist, skipping", path.display());
         false
      },
      Err(e) => {
         warn!("Failed to write {}: {e}", path.display());
         false
      },
   }
}

impl SystemInterface for LinuxSystemInterface {
   fn set_display_state(&self, on: bool) {
      info!("Display {}", if on { "on" } else { "off" });
      // bl_power: 0 is unblanked, 4 is powerdown
      self.write_backlight("bl_power", if on { "0" } else { "4" });
   }

   fn set_display_brightness(&self, brightness: i32) {
      let brightness = brightness.clamp(0, 100);
      *self.brightness.lock() = brightness;
      self.refresh_display_brightness();
   }

   fn refresh_display_brightness(&self) {
      let Some(dir) = self.backlight.clone() else {
         return;
      };
      let percent = *self.brightness.lock();
      self.queue(SysfsWrite::Brightness { dir, percent });
   }

   fn is_system_supporting_deep_sleep(&self) -> bool {
      self.supports_deep_sleep
   }

   fn switch_to_partial_wake_lock(&self) {
      let mut held = self.wake_lock_held.lock();
      if !*held {
         debug!("Acquiring partial wake lock");
         self.write(self.power_dir.join("wake_lock"), WAKE_LOCK_NAME);
         *held = true;
      }
   }

   fn release_all_wake_locks(&self) {
      let mut held = self.wake_lock_held.lock();
      if *held {
         debug!("Releasing wake lock");
         self.write(self.power_dir.join("wake_unlock"), WAKE_LOCK_NAME);
         *held = false;
      }
   }

   fn current_user(&self) -> UserId {
      *self.current_user.borrow()
   }

   fn switch_user(&self, user: UserId) {
      info!("Switching foreground user to {user}");
      self.current_user.send_replace(user);
   }

   fn user_switches(&self) -> watch::Receiver<UserId> {
      self.current_user.subscribe()
   }

   fn enter_deep_sleep(&self) -> BoxFuture<'_, bool> {
      async {
         info!("Entering deep sleep");
         let (done, result) = oneshot::channel();
         self.queue(SysfsWrite::Value {
            path: self.power_dir.join("state"),
            value: "mem".to_owned(),
            done: Some(done),
         });
         // Resolves once the kernel returns from suspend.
         let resumed = result.await.unwrap_or(false);
         if resumed {
            info!("Resumed from deep sleep");
         } else {
            warn!("Failed to enter deep sleep");
         }
         resumed
      }
      .boxed()
   }

   fn shutdown(&self) -> BoxFuture<'_, ()> {
      async {
         info!("Shutting down the system");
         match Command::new("systemctl").arg("poweroff").status().await {
            Ok(status) if status.success() => {},
            Ok(status) => warn!("systemctl poweroff exited with {status}"),
            Err(e) => warn!("Failed to run systemctl poweroff: {e}"),
         }
      }
      .boxed()
   }
}
