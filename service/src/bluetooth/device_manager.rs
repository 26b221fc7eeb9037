//! Per-profile device priority list and sequential auto-connect.
//!
//! One [`BluetoothProfileDeviceManager`] exists per managed profile. It owns
//! the persisted, ordered list of devices (index 0 connects first) and, when
//! asked to auto-connect, walks a snapshot of that list one device at a
//! time. A device gets [`AUTO_CONNECT_TIMEOUT`] to report a connection
//! before the session moves on.

use std::{fmt::Write as _, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{broadcast, mpsc, oneshot},
   task::JoinHandle,
   time,
};

use super::{
   connector::ProfileConnector,
   event::{BluetoothEvent, BluetoothEventBus, next_event},
   profile::{AdapterState, BondState, ConnectionState, Profile, ProfilePriority},
   stack::{BluetoothAdapter, UserProxies},
};
use crate::{
   error::{CarServiceError, Result},
   settings::{SecureSettings, UserId},
};

/// How long a device gets to connect before auto-connect moves on.
pub const AUTO_CONNECT_TIMEOUT: Duration = Duration::from_millis(8000);
/// Separator of the persisted device list.
pub const SETTINGS_DELIMITER: char = ',';
const CHANNEL_BUFFER_SIZE: usize = 64;

// === Persisted Device List ===

/// Ordered, duplicate-free list of devices for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
   devices: Vec<Address>,
}

impl DeviceList {
   pub fn as_slice(&self) -> &[Address] {
      &self.devices
   }

   pub fn position(&self, device: Address) -> Option<usize> {
      self.devices.iter().position(|&d| d == device)
   }

   /// Appends `device` with the lowest priority. Returns false if present.
   pub fn add(&mut self, device: Address) -> bool {
      if self.position(device).is_some() {
         return false;
      }
      self.devices.push(device);
      true
   }

   pub fn remove(&mut self, device: Address) -> bool {
      let Some(index) = self.position(device) else {
         return false;
      };
      self.devices.remove(index);
      true
   }

   /// Moves (or inserts) `device` to `index`. Returns false for no-ops.
   pub fn set_priority(&mut self, device: Address, index: usize) -> bool {
      if index > self.devices.len() || self.position(device) == Some(index) {
         return false;
      }
      self.remove(device);
      let index = index.min(self.devices.len());
      self.devices.insert(index, device);
      true
   }

   pub fn encode(&self) -> String {
      let mut out = String::new();
      for (i, device) in self.devices.iter().enumerate() {
         if i > 0 {
            out.push(SETTINGS_DELIMITER);
         }
         let _ = write!(out, "{device}");
      }
      out
   }

   /// Parses a persisted list, skipping malformed and duplicate entries.
   pub fn decode(value: &str) -> Self {
      let mut list = Self::default();
      for token in value.split(SETTINGS_DELIMITER) {
         let token = token.trim();
         match token.parse::<Address>() {
            Ok(device) => {
               list.add(device);
            },
            Err(_) => warn!("Skipping malformed device address '{token}'"),
         }
      }
      list
   }
}

// === Commands ===

#[derive(Debug)]
enum DeviceManagerCommand {
   Start(oneshot::Sender<()>),
   Stop(oneshot::Sender<()>),
   AddDevice(Address, oneshot::Sender<()>),
   RemoveDevice(Address, oneshot::Sender<()>),
   GetDeviceConnectionPriority(Address, oneshot::Sender<Option<usize>>),
   SetDeviceConnectionPriority(Address, usize, oneshot::Sender<()>),
   GetDeviceListSnapshot(oneshot::Sender<Vec<Address>>),
   BeginAutoConnecting(oneshot::Sender<()>),
   IsAutoConnecting(oneshot::Sender<bool>),
   Dump(oneshot::Sender<String>),

   // Auto-connect progress, tagged with session and index
   ConnectFailed { session: u64, index: usize },
   ConnectTimeout { session: u64, index: usize },
}

// === Handle ===

/// Handle to the device manager of one profile.
#[derive(Clone)]
pub struct BluetoothProfileDeviceManager {
   profile: Profile,
   inbox: mpsc::Sender<DeviceManagerCommand>,
}

impl BluetoothProfileDeviceManager {
   /// Spawns the manager for `profile`. Returns `None` without an adapter.
   pub fn create(
      profile: Profile,
      user_id: UserId,
      proxies: Arc<dyn UserProxies>,
      adapter: Option<Arc<dyn BluetoothAdapter>>,
      settings: SecureSettings,
      bus: BluetoothEventBus,
   ) -> Option<Self> {
      let Some(adapter) = adapter else {
         warn!("Cannot create {profile} device manager without an adapter");
         return None;
      };
      let (inbox, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = DeviceManagerActor {
         profile,
         user_id,
         connector: ProfileConnector::new(profile, proxies),
         adapter,
         settings,
         bus,
         command_rx,
         loopback_rx,
         loopback_tx,
         events: None,
         devices: DeviceList::default(),
         session: None,
         next_session_id: 0,
      };
      tokio::spawn(actor.run());
      Some(Self { profile, inbox })
   }

   pub const fn profile(&self) -> Profile {
      self.profile
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> DeviceManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| CarServiceError::ManagerShutdown)?;
      rx.await.map_err(|_| CarServiceError::ManagerShutdown)
   }

   async fn send(&self, make: impl FnOnce(oneshot::Sender<()>) -> DeviceManagerCommand) {
      if let Err(e) = self.request(make).await {
         warn!("[{}] Command dropped: {e}", self.profile);
      }
   }

   /// Loads the persisted list and starts listening to stack events.
   pub async fn start(&self) {
      self.send(DeviceManagerCommand::Start).await;
   }

   /// Cancels auto-connect, persists the list and stops listening.
   pub async fn stop(&self) {
      self.send(DeviceManagerCommand::Stop).await;
   }

   pub async fn add_device(&self, device: Address) {
      self
         .send(|tx| DeviceManagerCommand::AddDevice(device, tx))
         .await;
   }

   pub async fn remove_device(&self, device: Address) {
      self
         .send(|tx| DeviceManagerCommand::RemoveDevice(device, tx))
         .await;
   }

   /// Position of `device` in the priority list.
   pub async fn get_device_connection_priority(&self, device: Address) -> Option<usize> {
      self
         .request(|tx| DeviceManagerCommand::GetDeviceConnectionPriority(device, tx))
         .await
         .ok()
         .flatten()
   }

   pub async fn set_device_connection_priority(&self, device: Address, priority: usize) {
      self
         .send(|tx| DeviceManagerCommand::SetDeviceConnectionPriority(device, priority, tx))
         .await;
   }

   pub async fn get_device_list_snapshot(&self) -> Vec<Address> {
      self
         .request(DeviceManagerCommand::GetDeviceListSnapshot)
         .await
         .unwrap_or_default()
   }

   pub async fn begin_auto_connecting(&self) {
      self
         .send(DeviceManagerCommand::BeginAutoConnecting)
         .await;
   }

   pub async fn is_auto_connecting(&self) -> bool {
      self
         .request(DeviceManagerCommand::IsAutoConnecting)
         .await
         .unwrap_or(false)
   }

   pub async fn dump(&self) -> String {
      self
         .request(DeviceManagerCommand::Dump)
         .await
         .unwrap_or_default()
   }
}

// === Actor ===

struct AutoConnectSession {
   id: u64,
   devices: Vec<Address>,
   index: usize,
   timeout: Option<JoinHandle<()>>,
}

impl AutoConnectSession {
   fn current(&self) -> Option<Address> {
      self.devices.get(self.index).copied()
   }
}

struct DeviceManagerActor {
   profile: Profile,
   user_id: UserId,
   connector: ProfileConnector,
   adapter: Arc<dyn BluetoothAdapter>,
   settings: SecureSettings,
   bus: BluetoothEventBus,
   command_rx: mpsc::Receiver<DeviceManagerCommand>,
   loopback_rx: mpsc::Receiver<DeviceManagerCommand>,
   loopback_tx: mpsc::Sender<DeviceManagerCommand>,

   // State
   events: Option<broadcast::Receiver<BluetoothEvent>>,
   devices: DeviceList,
   session: Option<AutoConnectSession>,
   next_session_id: u64,
}

impl DeviceManagerActor {
   async fn run(mut self) {
      debug!("[{} - User: {}] Device manager running", self.profile, self.user_id);
      loop {
         select! {
            biased;
            event = next_event(&mut self.events) => {
               self.handle_event(event).await;
            }
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
      self.cancel_auto_connecting();
      debug!("[{} - User: {}] Device manager exited", self.profile, self.user_id);
   }

   async fn handle_command(&mut self, cmd: DeviceManagerCommand) {
      match cmd {
         DeviceManagerCommand::Start(reply) => {
            self.start();
            let _ = reply.send(());
         },
         DeviceManagerCommand::Stop(reply) => {
            self.stop();
            let _ = reply.send(());
         },
         DeviceManagerCommand::AddDevice(device, reply) => {
            self.add_device(device);
            let _ = reply.send(());
         },
         DeviceManagerCommand::RemoveDevice(device, reply) => {
            self.remove_device(device);
            let _ = reply.send(());
         },
         DeviceManagerCommand::GetDeviceConnectionPriority(device, reply) => {
            let _ = reply.send(self.devices.position(device));
         },
         DeviceManagerCommand::SetDeviceConnectionPriority(device, priority, reply) => {
            if self.devices.set_priority(device, priority) {
               debug!(
                  "[{}] Set connection priority of {device} to {priority}",
                  self.profile
               );
               self.commit();
            }
            let _ = reply.send(());
         },
         DeviceManagerCommand::GetDeviceListSnapshot(reply) => {
            let _ = reply.send(self.devices.as_slice().to_vec());
         },
         DeviceManagerCommand::BeginAutoConnecting(reply) => {
            self.begin_auto_connecting().await;
            let _ = reply.send(());
         },
         DeviceManagerCommand::IsAutoConnecting(reply) => {
            let _ = reply.send(self.session.is_some());
         },
         DeviceManagerCommand::Dump(reply) => {
            let _ = reply.send(self.dump());
         },
         DeviceManagerCommand::ConnectFailed { session, index } => {
            if self.is_current_attempt(session, index) {
               debug!("[{}] Connection attempt {index} failed immediately", self.profile);
               self.continue_auto_connecting();
            }
         },
         DeviceManagerCommand::ConnectTimeout { session, index } => {
            if self.is_current_attempt(session, index) {
               debug!("[{}] Connection attempt {index} timed out", self.profile);
               self.continue_auto_connecting();
            }
         },
      }
   }

   // === Lifecycle ===

   fn start(&mut self) {
      self.load();
      self.cancel_auto_connecting();
      if self.events.is_none() {
         self.events = Some(self.bus.subscribe());
      }
      info!(
         "[{} - User: {}] Started with {} devices",
         self.profile,
         self.user_id,
         self.devices.as_slice().len()
      );
   }

   fn stop(&mut self) {
      self.events = None;
      self.cancel_auto_connecting();
      self.commit();
      info!("[{} - User: {}] Stopped", self.profile, self.user_id);
   }

   // === Persistence ===

   fn load(&mut self) {
      let value = match self
         .settings
         .get_string_for_user(self.user_id, self.profile.settings_key())
      {
         Ok(Some(value)) if !value.is_empty() => value,
         Ok(_) => {
            debug!("[{}] No persisted device list", self.profile);
            return;
         },
         Err(e) => {
            warn!("[{}] Failed to load device list: {e}", self.profile);
            return;
         },
      };
      self.devices = DeviceList::decode(&value);
   }

   fn commit(&self) {
      let value = self.devices.encode();
      if let Err(e) =
         self
            .settings
            .put_string_for_user(self.user_id, self.profile.settings_key(), &value)
      {
         warn!("[{}] Failed to persist device list: {e}", self.profile);
      } else {
         debug!("[{}] Committed device list '{value}'", self.profile);
      }
   }

   fn add_device(&mut self, device: Address) {
      if self.devices.add(device) {
         debug!("[{}] Added {device}", self.profile);
         self.commit();
      }
   }

   fn remove_device(&mut self, device: Address) {
      if self.devices.remove(device) {
         debug!("[{}] Removed {device}", self.profile);
         self.commit();
      }
   }

   // === Auto-connect ===

   async fn begin_auto_connecting(&mut self) {
      if self.session.is_some() {
         debug!("[{}] Already auto-connecting", self.profile);
         return;
      }
      if self.adapter.state().await != AdapterState::On {
         debug!("[{}] Adapter is not on, not auto-connecting", self.profile);
         return;
      }

      let devices = self.devices.as_slice().to_vec();
      if devices.is_empty() {
         debug!("[{}] No devices to auto-connect", self.profile);
         return;
      }

      self.next_session_id += 1;
      info!(
         "[{}] Auto-connecting {} devices (session {})",
         self.profile,
         devices.len(),
         self.next_session_id
      );
      self.session = Some(AutoConnectSession {
         id: self.next_session_id,
         devices,
         index: 0,
         timeout: None,
      });
      self.auto_connect_with_timeout();
   }

   fn is_current_attempt(&self, session: u64, index: usize) -> bool {
      self
         .session
         .as_ref()
         .is_some_and(|s| s.id == session && s.index == index)
   }

   /// Attempts the device at the session index and arms its timeout.
   fn auto_connect_with_timeout(&mut self) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      let Some(device) = session.current() else {
         return;
      };
      let (id, index) = (session.id, session.index);

      let connector = self.connector.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         if !connector.connect(device).await {
            let _ = loopback
               .send(DeviceManagerCommand::ConnectFailed { session: id, index })
               .await;
         }
      });

      let loopback = self.loopback_tx.clone();
      session.timeout = Some(tokio::spawn(async move {
         time::sleep(AUTO_CONNECT_TIMEOUT).await;
         let _ = loopback
            .send(DeviceManagerCommand::ConnectTimeout { session: id, index })
            .await;
      }));
   }

   fn continue_auto_connecting(&mut self) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      if let Some(timeout) = session.timeout.take() {
         timeout.abort();
      }
      session.index += 1;
      if session.index >= session.devices.len() {
         debug!("[{}] Auto-connect session finished", self.profile);
         self.cancel_auto_connecting();
      } else {
         self.auto_connect_with_timeout();
      }
   }

   fn cancel_auto_connecting(&mut self) {
      if let Some(mut session) = self.session.take() {
         if let Some(timeout) = session.timeout.take() {
            timeout.abort();
         }
         debug!("[{}] Auto-connect session {} ended", self.profile, session.id);
      }
   }

   // === Stack Events ===

   async fn handle_event(&mut self, event: BluetoothEvent) {
      match event {
         BluetoothEvent::ProfileConnectionStateChanged {
            profile,
            device,
            state,
         } if profile == self.profile => {
            self.handle_connection_state_change(device, state).await;
         },
         BluetoothEvent::ProfileConnectionStateChanged { .. } => {},
         BluetoothEvent::BondStateChanged { device, state } => {
            debug!("[{}] Bond state of {device}: {state}", self.profile);
            match state {
               BondState::None => self.remove_device(device),
               BondState::Bonded => self.add_bonded_device_if_supported(device).await,
               BondState::Bonding => {},
            }
         },
         BluetoothEvent::UuidsDiscovered { device, uuids } => {
            self.provision_device_if_supported(device, &uuids).await;
         },
         BluetoothEvent::AdapterStateChanged(state) => {
            debug!("[{}] Adapter state: {state}", self.profile);
            if state != AdapterState::On {
               self.cancel_auto_connecting();
            }
            if state == AdapterState::Off {
               self.commit();
            }
         },
      }
   }

   async fn handle_connection_state_change(&mut self, device: Address, state: ConnectionState) {
      debug!("[{}] Connection state of {device}: {state}", self.profile);
      if state != ConnectionState::Connected {
         return;
      }

      let is_auto_connecting_device = self
         .session
         .as_ref()
         .is_some_and(|s| s.current() == Some(device));
      if is_auto_connecting_device {
         self.continue_auto_connecting();
         return;
      }

      if self.connector.priority(device).await.allows_connection() {
         self.add_device(device);
      }
      self.connector.trigger_related(device).await;
   }

   async fn add_bonded_device_if_supported(&mut self, device: Address) {
      if self.adapter.bond_state(device).await != BondState::Bonded {
         return;
      }
      let uuids = self.adapter.remote_uuids(device).await;
      if self.profile.matches_uuids(&uuids)
         && self.connector.priority(device).await.allows_connection()
      {
         self.add_device(device);
      }
   }

   /// Turns an undefined priority on for a newly seen supported device.
   /// Never connects.
   async fn provision_device_if_supported(&mut self, device: Address, uuids: &[uuid::Uuid]) {
      if !self.profile.matches_uuids(uuids) {
         return;
      }
      if self.connector.priority(device).await == ProfilePriority::Undefined {
         debug!("[{}] Provisioning {device} with priority ON", self.profile);
         self.connector.set_priority(device, ProfilePriority::On).await;
      }
   }

   fn dump(&self) -> String {
      let mut out = String::new();
      let _ = writeln!(out, "BluetoothProfileDeviceManager [{}]", self.profile);
      let _ = writeln!(out, "\tUser: {}", self.user_id);
      let _ = writeln!(out, "\tSettings Location: {}", self.profile.settings_key());
      let _ = writeln!(
         out,
         "\tAuto-Connecting: {}",
         if self.session.is_some() { "Yes" } else { "No" }
      );
      let _ = writeln!(out, "\tPriority List:");
      for device in self.devices.as_slice() {
         let _ = writeln!(out, "\t\t{device}");
      }
      out
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::{
         profile::{AUDIO_SOURCE_UUID, HANDSFREE_AG_UUID, MAS_UUID},
         testing::{DEVICE_A, DEVICE_B, DEVICE_C, FakeAdapter, FakeProxies, ProxyCall, settle},
      },
      settings::open_test_settings,
   };

   const USER: UserId = 10;

   struct Harness {
      manager: BluetoothProfileDeviceManager,
      proxies: Arc<FakeProxies>,
      adapter: Arc<FakeAdapter>,
      settings: SecureSettings,
      bus: BluetoothEventBus,
      _dir: tempfile::TempDir,
   }

   fn harness(profile: Profile) -> Harness {
      let (settings, dir) = open_test_settings();
      let proxies = FakeProxies::new();
      let adapter = FakeAdapter::new(AdapterState::On);
      let bus = BluetoothEventBus::new();
      let manager = BluetoothProfileDeviceManager::create(
         profile,
         USER,
         proxies.clone(),
         Some(adapter.clone()),
         settings.clone(),
         bus.clone(),
      )
      .unwrap();
      Harness {
         manager,
         proxies,
         adapter,
         settings,
         bus,
         _dir: dir,
      }
   }

   fn persisted(h: &Harness, profile: Profile) -> Option<String> {
      h.settings
         .get_string_for_user(USER, profile.settings_key())
         .unwrap()
   }

   #[test]
   fn test_device_list_never_holds_duplicates() {
      let mut list = DeviceList::default();
      assert!(list.add(DEVICE_A));
      assert!(!list.add(DEVICE_A));
      assert!(list.add(DEVICE_B));
      assert!(list.set_priority(DEVICE_C, 0));
      assert!(!list.set_priority(DEVICE_C, 0));
      assert!(list.set_priority(DEVICE_A, 2));
      assert_eq!(list.as_slice(), &[DEVICE_C, DEVICE_B, DEVICE_A]);
      assert!(!list.set_priority(DEVICE_A, 4));
      assert!(list.remove(DEVICE_B));
      assert!(!list.remove(DEVICE_B));
      assert_eq!(list.position(DEVICE_A), Some(1));
      assert_eq!(list.position(DEVICE_B), None);
   }

   #[test]
   fn test_set_priority_clamps_after_removal() {
      let mut list = DeviceList::default();
      list.add(DEVICE_A);
      list.add(DEVICE_B);
      // Index 2 is valid before removal and clamps to the end afterwards.
      assert!(list.set_priority(DEVICE_A, 2));
      assert_eq!(list.as_slice(), &[DEVICE_B, DEVICE_A]);
   }

   #[test]
   fn test_decode_skips_malformed_entries() {
      let list = DeviceList::decode("00:11:22:33:44:55,garbage,,55:44:33:22:11:00");
      assert_eq!(list.as_slice(), &[DEVICE_A, DEVICE_B]);
      assert_eq!(list.encode(), "00:11:22:33:44:55,55:44:33:22:11:00");
   }

   #[tokio::test(start_paused = true)]
   async fn test_start_loads_persisted_list() {
      let h = harness(Profile::A2dpSink);
      h.settings
         .put_string_for_user(USER, Profile::A2dpSink.settings_key(), "55:44:33:22:11:00,bad,00:11:22:33:44:55")
         .unwrap();

      h.manager.start().await;
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_B, DEVICE_A]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_empty_setting_keeps_in_memory_list() {
      let h = harness(Profile::A2dpSink);
      h.manager.add_device(DEVICE_A).await;
      h.settings
         .put_string_for_user(USER, Profile::A2dpSink.settings_key(), "")
         .unwrap();

      h.manager.start().await;
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_A]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_mutations_persist_immediately() {
      let h = harness(Profile::Pan);
      h.manager.start().await;

      h.manager.add_device(DEVICE_A).await;
      h.manager.add_device(DEVICE_B).await;
      assert_eq!(
         persisted(&h, Profile::Pan).as_deref(),
         Some("00:11:22:33:44:55,55:44:33:22:11:00")
      );

      h.manager.set_device_connection_priority(DEVICE_B, 0).await;
      assert_eq!(
         persisted(&h, Profile::Pan).as_deref(),
         Some("55:44:33:22:11:00,00:11:22:33:44:55")
      );
      assert_eq!(h.manager.get_device_connection_priority(DEVICE_B).await, Some(0));
      assert_eq!(h.manager.get_device_connection_priority(DEVICE_C).await, None);

      h.manager.remove_device(DEVICE_B).await;
      assert_eq!(persisted(&h, Profile::Pan).as_deref(), Some("00:11:22:33:44:55"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_persist_reload_round_trip() {
      let h = harness(Profile::MapClient);
      h.manager.start().await;
      for device in [DEVICE_C, DEVICE_A, DEVICE_B] {
         h.manager.add_device(device).await;
      }
      h.manager.stop().await;

      let reloaded = BluetoothProfileDeviceManager::create(
         Profile::MapClient,
         USER,
         h.proxies.clone(),
         Some(h.adapter.clone()),
         h.settings.clone(),
         h.bus.clone(),
      )
      .unwrap();
      reloaded.start().await;
      assert_eq!(
         reloaded.get_device_list_snapshot().await,
         vec![DEVICE_C, DEVICE_A, DEVICE_B]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_connect_sequence() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      for device in [DEVICE_A, DEVICE_B, DEVICE_C] {
         h.manager.add_device(device).await;
      }
      h.proxies.fail_connect(DEVICE_A);

      h.manager.begin_auto_connecting().await;
      settle().await;

      // A failed right away, B is attempted without waiting for the timeout.
      assert_eq!(
         h.proxies.connects(),
         vec![(Profile::A2dpSink, DEVICE_A), (Profile::A2dpSink, DEVICE_B)]
      );
      assert!(h.manager.is_auto_connecting().await);

      h.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
         profile: Profile::A2dpSink,
         device: DEVICE_B,
         state: ConnectionState::Connected,
      });
      settle().await;
      assert_eq!(
         h.proxies.connects().last(),
         Some(&(Profile::A2dpSink, DEVICE_C))
      );
      assert_eq!(h.proxies.connects().len(), 3);
      assert!(h.manager.is_auto_connecting().await);

      time::sleep(AUTO_CONNECT_TIMEOUT).await;
      settle().await;
      assert!(!h.manager.is_auto_connecting().await);
      assert_eq!(h.proxies.connects().len(), 3);
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_connect_ends_within_timeout_bound() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      for device in [DEVICE_A, DEVICE_B, DEVICE_C] {
         h.manager.add_device(device).await;
      }

      let started = time::Instant::now();
      h.manager.begin_auto_connecting().await;
      settle().await;
      assert_eq!(h.proxies.connects().len(), 1);

      time::sleep(AUTO_CONNECT_TIMEOUT).await;
      settle().await;
      assert_eq!(h.proxies.connects().len(), 2);

      while h.manager.is_auto_connecting().await {
         time::sleep(Duration::from_millis(500)).await;
      }
      assert!(started.elapsed() <= AUTO_CONNECT_TIMEOUT * 3 + Duration::from_millis(500));
      assert_eq!(
         h.proxies.connects(),
         vec![
            (Profile::A2dpSink, DEVICE_A),
            (Profile::A2dpSink, DEVICE_B),
            (Profile::A2dpSink, DEVICE_C)
         ]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_connect_requires_adapter_on() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.manager.add_device(DEVICE_A).await;
      h.adapter.set_state(AdapterState::Off);

      h.manager.begin_auto_connecting().await;
      settle().await;
      assert!(!h.manager.is_auto_connecting().await);
      assert!(h.proxies.connects().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_auto_connect_with_empty_list() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;

      h.manager.begin_auto_connecting().await;
      assert!(!h.manager.is_auto_connecting().await);
      assert!(h.proxies.connects().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_begin_while_running_is_noop() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.manager.add_device(DEVICE_A).await;

      h.manager.begin_auto_connecting().await;
      h.manager.begin_auto_connecting().await;
      settle().await;
      assert_eq!(h.proxies.connects(), vec![(Profile::A2dpSink, DEVICE_A)]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_adapter_off_cancels_and_commits() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.manager.add_device(DEVICE_A).await;
      h.manager.begin_auto_connecting().await;
      assert!(h.manager.is_auto_connecting().await);

      h.bus
         .emit(BluetoothEvent::AdapterStateChanged(AdapterState::TurningOff));
      assert!(!h.manager.is_auto_connecting().await);

      h.settings
         .put_string_for_user(USER, Profile::A2dpSink.settings_key(), "")
         .unwrap();
      h.bus
         .emit(BluetoothEvent::AdapterStateChanged(AdapterState::Off));
      h.manager.is_auto_connecting().await;
      assert_eq!(
         persisted(&h, Profile::A2dpSink).as_deref(),
         Some("00:11:22:33:44:55")
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_connected_outside_session_adds_and_triggers() {
      let h = harness(Profile::HeadsetClient);
      h.manager.start().await;
      h.proxies
         .set_priority(Profile::HeadsetClient, DEVICE_A, ProfilePriority::On);

      h.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
         profile: Profile::HeadsetClient,
         device: DEVICE_A,
         state: ConnectionState::Connected,
      });
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_A]);
      assert_eq!(
         h.proxies.connects(),
         vec![(Profile::MapClient, DEVICE_A), (Profile::PbapClient, DEVICE_A)]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_connected_with_priority_off_is_not_added() {
      let h = harness(Profile::HeadsetClient);
      h.manager.start().await;
      h.proxies
         .set_priority(Profile::HeadsetClient, DEVICE_A, ProfilePriority::Off);

      h.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
         profile: Profile::HeadsetClient,
         device: DEVICE_A,
         state: ConnectionState::Connected,
      });
      assert!(h.manager.get_device_list_snapshot().await.is_empty());
      // Related profiles are still triggered.
      assert_eq!(h.proxies.connects().len(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_other_profile_events_are_ignored() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.proxies
         .set_priority(Profile::MapClient, DEVICE_A, ProfilePriority::On);

      h.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
         profile: Profile::MapClient,
         device: DEVICE_A,
         state: ConnectionState::Connected,
      });
      assert!(h.manager.get_device_list_snapshot().await.is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_disconnect_keeps_device() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.manager.add_device(DEVICE_A).await;

      h.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
         profile: Profile::A2dpSink,
         device: DEVICE_A,
         state: ConnectionState::Disconnected,
      });
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_A]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_bond_events() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.adapter.bond(DEVICE_A, &[AUDIO_SOURCE_UUID]);
      h.adapter.bond(DEVICE_B, &[MAS_UUID]);
      h.proxies
         .set_priority(Profile::A2dpSink, DEVICE_A, ProfilePriority::On);
      h.proxies
         .set_priority(Profile::A2dpSink, DEVICE_B, ProfilePriority::On);

      for device in [DEVICE_A, DEVICE_B] {
         h.bus.emit(BluetoothEvent::BondStateChanged {
            device,
            state: BondState::Bonded,
         });
      }
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_A]);

      h.bus.emit(BluetoothEvent::BondStateChanged {
         device: DEVICE_A,
         state: BondState::None,
      });
      assert!(h.manager.get_device_list_snapshot().await.is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_uuid_event_provisions_undefined_priority() {
      let h = harness(Profile::HeadsetClient);
      h.manager.start().await;
      h.proxies
         .set_priority(Profile::HeadsetClient, DEVICE_B, ProfilePriority::Off);

      for device in [DEVICE_A, DEVICE_B] {
         h.bus.emit(BluetoothEvent::UuidsDiscovered {
            device,
            uuids: vec![HANDSFREE_AG_UUID],
         });
      }
      h.bus.emit(BluetoothEvent::UuidsDiscovered {
         device: DEVICE_C,
         uuids: vec![AUDIO_SOURCE_UUID],
      });
      h.manager.get_device_list_snapshot().await;

      assert_eq!(
         h.proxies.calls(),
         vec![ProxyCall::SetPriority(
            Profile::HeadsetClient,
            DEVICE_A,
            ProfilePriority::On
         )]
      );
      assert_eq!(
         h.proxies.priority(Profile::HeadsetClient, DEVICE_B),
         ProfilePriority::Off
      );
      assert!(h.manager.get_device_list_snapshot().await.is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_events_ignored_after_stop() {
      let h = harness(Profile::A2dpSink);
      h.manager.start().await;
      h.manager.add_device(DEVICE_A).await;
      h.manager.stop().await;

      h.bus.emit(BluetoothEvent::BondStateChanged {
         device: DEVICE_A,
         state: BondState::None,
      });
      assert_eq!(h.manager.get_device_list_snapshot().await, vec![DEVICE_A]);
   }

   #[test]
   fn test_create_without_adapter_fails() {
      let (settings, _dir) = open_test_settings();
      let manager = BluetoothProfileDeviceManager::create(
         Profile::Pan,
         USER,
         FakeProxies::new(),
         None,
         settings,
         BluetoothEventBus::new(),
      );
      assert!(manager.is_none());
   }
}
