//! Profile inhibits.
//!
//! An inhibit forces a (device, profile) connection off for as long as its
//! owner holds the lease it was requested with. Several owners may inhibit
//! the same connection; the profile comes back only when the last one
//! releases. Keys that were already off before the first inhibit are
//! remembered as pre-disabled and stay off after the last release.
//!
//! Active inhibits are persisted so that a crash does not leave a profile
//! disabled forever: on the next start every persisted inhibit is restored
//! under a sentinel token and immediately released, retrying every
//! [`RESTORE_BACKOFF`] until all of them succeed.

use std::{
   collections::{HashMap, HashSet},
   fmt,
   fmt::Write as _,
   str::FromStr,
   sync::{Arc, LazyLock},
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use super::{
   profile::{Profile, ProfilePriority},
   stack::UserProxies,
};
use crate::{
   error::{CarServiceError, Result},
   lease::LeaseToken,
   settings::{SecureSettings, UserId},
};

pub const KEY_BLUETOOTH_PROFILES_INHIBITED: &str = "bluetooth_profiles_inhibited";
/// Delay between attempts to release restored inhibits.
pub const RESTORE_BACKOFF: Duration = Duration::from_millis(1000);
const SETTINGS_DELIMITER: char = ',';
const CHANNEL_BUFFER_SIZE: usize = 64;

static FLATTENED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^(([0-9A-F]{2}:){5}[0-9A-F]{2}|null)/([0-9]+|null)$")
      .expect("connection pattern is valid")
});

// === Connection Key ===

/// A (device, profile) pair. Either side may be unknown (`null` when
/// flattened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BluetoothConnection {
   pub device: Option<Address>,
   pub profile: Option<Profile>,
}

impl BluetoothConnection {
   pub const fn new(device: Address, profile: Profile) -> Self {
      Self {
         device: Some(device),
         profile: Some(profile),
      }
   }

   /// Flattens to `DEVICE/PROFILE_ID`, e.g. `01:23:45:67:89:AB/9`.
   pub fn encode(&self) -> String {
      let mut out = String::new();
      match self.device {
         Some(device) => {
            let _ = write!(out, "{device}");
         },
         None => out.push_str("null"),
      }
      out.push('/');
      match self.profile {
         Some(profile) => {
            let _ = write!(out, "{}", profile.id());
         },
         None => out.push_str("null"),
      }
      out
   }

   pub fn decode(flattened: &str) -> Result<Self> {
      if !FLATTENED_PATTERN.is_match(flattened) {
         return Err(CarServiceError::InvalidConnectionFormat(flattened.to_owned()));
      }
      let (device, profile) = flattened
         .split_once('/')
         .ok_or_else(|| CarServiceError::InvalidConnectionFormat(flattened.to_owned()))?;

      let device = match device {
         "null" => None,
         device => Some(
            Address::from_str(device)
               .map_err(|_| CarServiceError::InvalidAddress(device.to_owned()))?,
         ),
      };
      let profile = match profile {
         "null" => None,
         profile => {
            let id = profile
               .parse::<u32>()
               .map_err(|_| CarServiceError::InvalidConnectionFormat(flattened.to_owned()))?;
            Some(Profile::from_id(id).ok_or(CarServiceError::UnknownProfile(id))?)
         },
      };
      Ok(Self { device, profile })
   }
}

impl fmt::Display for BluetoothConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.encode())
   }
}

// === Commands ===

#[derive(Debug)]
enum InhibitCommand {
   Start(oneshot::Sender<()>),
   Stop(oneshot::Sender<()>),
   Request(BluetoothConnection, LeaseToken, oneshot::Sender<bool>),
   Release(BluetoothConnection, LeaseToken, oneshot::Sender<bool>),
   Snapshot(oneshot::Sender<InhibitSnapshot>),
   Dump(oneshot::Sender<String>),

   TokenDied(BluetoothConnection, u64),
   RetryRestore(u64),
}

/// Point-in-time view of the inhibit bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InhibitSnapshot {
   /// Number of live records per key.
   pub inhibits: HashMap<BluetoothConnection, usize>,
   pub already_disabled: HashSet<BluetoothConnection>,
   pub restored: usize,
}

// === Handle ===

/// Handle to the inhibit manager of one user.
#[derive(Clone)]
pub struct BluetoothProfileInhibitManager {
   inbox: mpsc::Sender<InhibitCommand>,
}

impl BluetoothProfileInhibitManager {
   pub fn new(user_id: UserId, proxies: Arc<dyn UserProxies>, settings: SecureSettings) -> Self {
      let (inbox, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = InhibitActor {
         user_id,
         proxies,
         settings,
         command_rx,
         loopback_rx,
         loopback_tx,
         inhibits: HashMap::new(),
         already_disabled: HashSet::new(),
         restored: HashSet::new(),
         retry: None,
         retry_epoch: 0,
      };
      tokio::spawn(actor.run());
      Self { inbox }
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> InhibitCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| CarServiceError::ManagerShutdown)?;
      rx.await.map_err(|_| CarServiceError::ManagerShutdown)
   }

   async fn send(&self, make: impl FnOnce(oneshot::Sender<()>) -> InhibitCommand) {
      if let Err(e) = self.request(make).await {
         warn!("Inhibit command dropped: {e}");
      }
   }

   /// Loads persisted inhibits and starts releasing them.
   pub async fn start(&self) {
      self.send(InhibitCommand::Start).await;
   }

   /// Releases every inhibit and clears all bookkeeping.
   pub async fn stop(&self) {
      self.send(InhibitCommand::Stop).await;
   }

   pub async fn request_profile_inhibit(
      &self,
      device: Address,
      profile: Profile,
      token: LeaseToken,
   ) -> bool {
      debug!("Request profile inhibit: profile {profile}, device {device}");
      let key = BluetoothConnection::new(device, profile);
      self
         .request(|tx| InhibitCommand::Request(key, token, tx))
         .await
         .unwrap_or(false)
   }

   pub async fn release_profile_inhibit(
      &self,
      device: Address,
      profile: Profile,
      token: LeaseToken,
   ) -> bool {
      debug!("Release profile inhibit: profile {profile}, device {device}");
      let key = BluetoothConnection::new(device, profile);
      self
         .request(|tx| InhibitCommand::Release(key, token, tx))
         .await
         .unwrap_or(false)
   }

   pub async fn snapshot(&self) -> InhibitSnapshot {
      self
         .request(InhibitCommand::Snapshot)
         .await
         .unwrap_or_default()
   }

   pub async fn dump(&self) -> String {
      self
         .request(InhibitCommand::Dump)
         .await
         .unwrap_or_default()
   }
}

// === Actor ===

struct InhibitRecord {
   token: LeaseToken,
   watcher: Option<JoinHandle<()>>,
}

impl InhibitRecord {
   fn unlink(&mut self) {
      if let Some(watcher) = self.watcher.take() {
         watcher.abort();
      }
   }
}

struct InhibitActor {
   user_id: UserId,
   proxies: Arc<dyn UserProxies>,
   settings: SecureSettings,
   command_rx: mpsc::Receiver<InhibitCommand>,
   loopback_rx: mpsc::Receiver<InhibitCommand>,
   loopback_tx: mpsc::Sender<InhibitCommand>,

   // State
   inhibits: HashMap<BluetoothConnection, Vec<InhibitRecord>>,
   already_disabled: HashSet<BluetoothConnection>,
   /// Keys still owned by the restored sentinel token.
   restored: HashSet<BluetoothConnection>,
   retry: Option<JoinHandle<()>>,
   retry_epoch: u64,
}

impl InhibitActor {
   async fn run(mut self) {
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
         }
      }
      self.cancel_restore_retry();
      for record in self.inhibits.values_mut().flatten() {
         record.unlink();
      }
   }

   async fn handle_command(&mut self, cmd: InhibitCommand) {
      match cmd {
         InhibitCommand::Start(reply) => {
            self.load();
            self.remove_restored_profile_inhibits().await;
            let _ = reply.send(());
         },
         InhibitCommand::Stop(reply) => {
            self.release_all_inhibits_before_unbind().await;
            let _ = reply.send(());
         },
         InhibitCommand::Request(key, token, reply) => {
            let _ = reply.send(self.add_inhibit_record(key, token).await);
         },
         InhibitCommand::Release(key, token, reply) => {
            let result = if self.find_record(key, token.id()).is_some() {
               self.remove_inhibit_record(key, token.id()).await
            } else {
               error!("Inhibit record for {key} not found");
               false
            };
            let _ = reply.send(result);
         },
         InhibitCommand::Snapshot(reply) => {
            let _ = reply.send(InhibitSnapshot {
               inhibits: self
                  .inhibits
                  .iter()
                  .map(|(key, records)| (*key, records.len()))
                  .collect(),
               already_disabled: self.already_disabled.clone(),
               restored: self.restored.len(),
            });
         },
         InhibitCommand::Dump(reply) => {
            let _ = reply.send(self.dump());
         },
         InhibitCommand::TokenDied(key, token_id) => {
            if self.find_record(key, token_id).is_some() {
               info!("Releasing inhibit on {key}: requesting process died");
               self.remove_inhibit_record(key, token_id).await;
            }
         },
         InhibitCommand::RetryRestore(epoch) => {
            if epoch == self.retry_epoch {
               self.retry = None;
               self.remove_restored_profile_inhibits().await;
            }
         },
      }
   }

   fn find_record(&self, key: BluetoothConnection, token_id: u64) -> Option<&InhibitRecord> {
      self
         .inhibits
         .get(&key)?
         .iter()
         .find(|r| r.token.id() == token_id)
   }

   async fn is_proxy_available(&self, key: BluetoothConnection) -> bool {
      match key.profile {
         Some(profile) => self.proxies.is_connection_proxy_available(profile).await,
         None => true,
      }
   }

   // === Persistence ===

   fn load(&mut self) {
      let saved = match self
         .settings
         .get_string_for_user(self.user_id, KEY_BLUETOOTH_PROFILES_INHIBITED)
      {
         Ok(Some(saved)) if !saved.is_empty() => saved,
         Ok(_) => return,
         Err(e) => {
            warn!("Failed to load profile inhibits: {e}");
            return;
         },
      };

      debug!("Restoring profile inhibits: {saved}");
      for flattened in saved.split(SETTINGS_DELIMITER) {
         match BluetoothConnection::decode(flattened) {
            Ok(key) => {
               if self.find_record(key, LeaseToken::restored().id()).is_some() {
                  continue;
               }
               self.inhibits.entry(key).or_default().push(InhibitRecord {
                  token: LeaseToken::restored(),
                  watcher: None,
               });
               self.restored.insert(key);
               debug!("Restored profile inhibit for {key}");
            },
            Err(e) => error!("Bad format for saved profile inhibit '{flattened}': {e}"),
         }
      }
   }

   fn commit(&self) {
      let saved = self
         .inhibits
         .keys()
         .filter(|key| !self.already_disabled.contains(key))
         .map(BluetoothConnection::encode)
         .collect::<Vec<_>>()
         .join(",");

      match self.settings.put_string_for_user(
         self.user_id,
         KEY_BLUETOOTH_PROFILES_INHIBITED,
         &saved,
      ) {
         Ok(()) => debug!("Committed {KEY_BLUETOOTH_PROFILES_INHIBITED} = '{saved}'"),
         Err(e) => warn!("Failed to persist profile inhibits: {e}"),
      }
   }

   // === Records ===

   async fn add_inhibit_record(&mut self, key: BluetoothConnection, token: LeaseToken) -> bool {
      if !self.is_proxy_available(key).await {
         return false;
      }
      if self.find_record(key, token.id()).is_some() {
         error!("Inhibit request for {key} already registered, skipping duplicate");
         return false;
      }
      if !token.is_alive() {
         error!("Inhibit token for {key} is already dead");
         return false;
      }

      let watcher = {
         let token = token.clone();
         let loopback = self.loopback_tx.clone();
         tokio::spawn(async move {
            token.died().await;
            let _ = loopback
               .send(InhibitCommand::TokenDied(key, token.id()))
               .await;
         })
      };
      let token_id = token.id();
      let records = self.inhibits.entry(key).or_default();
      let is_newly_added = records.is_empty();
      records.push(InhibitRecord {
         token,
         watcher: Some(watcher),
      });

      if is_newly_added && let Err(e) = self.disable_profile(key).await {
         error!("Could not disable profile for {key}: {e}");
         self.drop_record(key, token_id);
         return false;
      }

      self.commit();
      true
   }

   async fn disable_profile(&mut self, key: BluetoothConnection) -> Result<()> {
      let (Some(device), Some(profile)) = (key.device, key.profile) else {
         return Ok(());
      };
      let priority = self.proxies.get_profile_priority(profile, device).await?;
      if priority == ProfilePriority::Off {
         debug!("Profile {profile} already disabled for {device}, suppressing re-enable");
         self.already_disabled.insert(key);
      } else {
         self
            .proxies
            .set_profile_priority(profile, device, ProfilePriority::Off)
            .await?;
         self.proxies.disconnect_from_profile(profile, device).await?;
         debug!("Disabled profile {profile} for {device}");
      }
      Ok(())
   }

   /// Returns true if the record is gone afterwards, including when it never
   /// existed.
   async fn remove_inhibit_record(&mut self, key: BluetoothConnection, token_id: u64) -> bool {
      if !self.is_proxy_available(key).await {
         return false;
      }
      let Some(records) = self.inhibits.get(&key) else {
         return true;
      };
      if !records.iter().any(|r| r.token.id() == token_id) {
         return true;
      }

      if records.len() == 1 && !self.restore_profile_priority(key).await {
         return false;
      }

      self.drop_record(key, token_id);
      self.commit();
      true
   }

   fn drop_record(&mut self, key: BluetoothConnection, token_id: u64) {
      let Some(records) = self.inhibits.get_mut(&key) else {
         return;
      };
      if let Some(index) = records.iter().position(|r| r.token.id() == token_id) {
         records.swap_remove(index).unlink();
      }
      if records.is_empty() {
         self.inhibits.remove(&key);
      }
   }

   async fn restore_profile_priority(&mut self, key: BluetoothConnection) -> bool {
      if self.already_disabled.remove(&key) {
         debug!("Not restoring {key}: it was disabled before being inhibited");
         return true;
      }
      let (Some(device), Some(profile)) = (key.device, key.profile) else {
         return true;
      };

      let restored = async {
         self
            .proxies
            .set_profile_priority(profile, device, ProfilePriority::On)
            .await?;
         self.proxies.connect_to_profile(profile, device).await?;
         Ok::<_, CarServiceError>(())
      };
      match restored.await {
         Ok(()) => {
            debug!("Restored profile {profile} for {device}");
            true
         },
         Err(e) => {
            error!("Could not restore profile {profile} for {device}: {e}");
            false
         },
      }
   }

   // === Restore ===

   async fn remove_restored_profile_inhibits(&mut self) {
      let restored_id = LeaseToken::restored().id();
      let keys: Vec<_> = self.restored.iter().copied().collect();
      for key in keys {
         if self.remove_inhibit_record(key, restored_id).await {
            self.restored.remove(&key);
         }
      }

      if self.restored.is_empty() {
         return;
      }
      warn!(
         "{} restored inhibits could not be released, retrying in {RESTORE_BACKOFF:?}",
         self.restored.len()
      );
      self.cancel_restore_retry();
      let epoch = self.retry_epoch;
      let loopback = self.loopback_tx.clone();
      self.retry = Some(tokio::spawn(async move {
         time::sleep(RESTORE_BACKOFF).await;
         let _ = loopback.send(InhibitCommand::RetryRestore(epoch)).await;
      }));
   }

   fn cancel_restore_retry(&mut self) {
      self.retry_epoch += 1;
      if let Some(retry) = self.retry.take() {
         retry.abort();
      }
   }

   async fn release_all_inhibits_before_unbind(&mut self) {
      debug!("Unbinding, releasing all profile inhibits");
      let records: Vec<_> = self
         .inhibits
         .iter()
         .flat_map(|(key, records)| records.iter().map(|r| (*key, r.token.id())))
         .collect();
      for (key, token_id) in records {
         if !self.remove_inhibit_record(key, token_id).await {
            warn!("Failed to release inhibit on {key}");
         }
      }

      // Whatever could not be released is persisted for the next start.
      self.commit();
      for record in self.inhibits.values_mut().flatten() {
         record.unlink();
      }
      self.inhibits.clear();
      self.already_disabled.clear();
      self.cancel_restore_retry();
      self.restored.clear();
   }

   fn dump(&self) -> String {
      let mut out = String::new();
      let _ = writeln!(out, "BluetoothProfileInhibitManager");
      let _ = writeln!(out, "\tUser: {}", self.user_id);
      let _ = writeln!(out, "\tInhibited profiles:");
      for (key, records) in &self.inhibits {
         let _ = writeln!(out, "\t\t{key} ({} inhibitors)", records.len());
      }
      let _ = writeln!(out, "\tAlready disabled profiles:");
      for key in &self.already_disabled {
         let _ = writeln!(out, "\t\t{key}");
      }
      let _ = writeln!(out, "\tRestored inhibits pending: {}", self.restored.len());
      out
   }
}
