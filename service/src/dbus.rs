//! D-Bus surface of the daemon.
//!
//! `org.carservice.Power` exposes the power controller together with the
//! vehicle-bus bridge input; `org.carservice.Bluetooth` exposes the
//! Bluetooth service. Inhibits requested over the bus are bound to a lease
//! owned by the caller's unique name, so they are released when the
//! caller disconnects.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use bluer::Address;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use zbus::{Connection, fdo, interface, message::Header, object_server::SignalEmitter};

use crate::{
   bluetooth::{profile::Profile, service::CarBluetoothService},
   error::Result,
   lease::{Lease, LeaseToken},
   power::{
      hal::{LoggingPowerHal, PowerHalEvent},
      service::CarPowerManagementService,
      state::{ApPowerStateReq, PowerState, ShutdownParam},
   },
};

pub const BUS_NAME: &str = "org.carservice";
pub const POWER_PATH: &str = "/org/carservice/power";
pub const BLUETOOTH_PATH: &str = "/org/carservice/bluetooth";

fn parse_address(address: &str) -> fdo::Result<Address> {
   Address::from_str(address).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_profile(id: u32) -> fdo::Result<Profile> {
   Profile::from_id(id).ok_or_else(|| fdo::Error::InvalidArgs(format!("Unknown profile id: {id}")))
}

fn sender(header: &Header<'_>) -> fdo::Result<String> {
   header
      .sender()
      .map(ToString::to_string)
      .ok_or_else(|| fdo::Error::Failed("Message has no sender".into()))
}

// === Power ===

pub struct PowerInterface {
   power: CarPowerManagementService,
   hal: Arc<LoggingPowerHal>,
}

impl PowerInterface {
   pub const fn new(power: CarPowerManagementService, hal: Arc<LoggingPowerHal>) -> Self {
      Self { power, hal }
   }
}

#[interface(name = "org.carservice.Power")]
impl PowerInterface {
   /// Current controller state as JSON, `null` before the first transition.
   async fn get_state(&self) -> fdo::Result<String> {
      serde_json::to_string(&self.power.current_state())
         .map_err(|e| fdo::Error::Failed(e.to_string()))
   }

   async fn force_suspend(&self) {
      info!("Simulated suspend requested over D-Bus");
      self.power.force_simulated_suspend();
   }

   async fn force_resume(&self) {
      info!("Simulated resume requested over D-Bus");
      self.power.force_simulated_resume();
   }

   async fn schedule_next_wakeup_time(&self, seconds: i32) {
      self.power.schedule_next_wakeup_time(seconds);
   }

   async fn request_shutdown_on_next_suspend(&self) {
      self.power.request_shutdown_on_next_suspend();
   }

   /// Vehicle-bus bridge input. A `param` of 0 means no parameter.
   async fn set_ap_power_state(&self, state: u32, param: u32) -> fdo::Result<bool> {
      let state = ApPowerStateReq::from_repr(state)
         .ok_or_else(|| fdo::Error::InvalidArgs(format!("Invalid power state: {state}")))?;
      let param = match param {
         0 => None,
         p => Some(
            ShutdownParam::from_repr(p)
               .ok_or_else(|| fdo::Error::InvalidArgs(format!("Invalid shutdown param: {p}")))?,
         ),
      };
      debug!("Power state request from bridge: {state} {param:?}");
      Ok(self
         .hal
         .inject(PowerHalEvent::PowerStateChange(PowerState::new(state, param))))
   }

   async fn set_display_brightness(&self, brightness: i32) -> bool {
      self
         .hal
         .inject(PowerHalEvent::DisplayBrightnessChange(brightness))
   }

   async fn dump(&self) -> String {
      self.power.dump()
   }

   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: u32) -> zbus::Result<()>;
}

// === Bluetooth ===

/// Leases held on behalf of bus clients, keyed by unique name.
#[derive(Clone, Default)]
pub struct ClientLeases {
   leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl ClientLeases {
   pub fn new() -> Self {
      Self::default()
   }

   /// Returns a token for `client`, creating its lease on first use.
   pub fn token_for(&self, client: &str) -> LeaseToken {
      self
         .leases
         .lock()
         .entry(client.to_owned())
         .or_default()
         .token()
   }

   /// Drops the lease of `client`, if it has one.
   pub fn remove(&self, client: &str) -> bool {
      let removed = self.leases.lock().remove(client).is_some();
      if removed {
         debug!("Released lease of bus client {client}");
      }
      removed
   }

   pub fn len(&self) -> usize {
      self.leases.lock().len()
   }

   /// Drops leases of clients as they vanish from the bus.
   pub async fn spawn_watcher(&self, connection: &Connection) -> Result<JoinHandle<()>> {
      let proxy = fdo::DBusProxy::new(connection).await?;
      let mut changes = proxy.receive_name_owner_changed().await?;
      let leases = self.clone();
      Ok(tokio::spawn(async move {
         while let Some(signal) = changes.next().await {
            let Ok(args) = signal.args() else {
               continue;
            };
            if args.new_owner().is_none() {
               leases.remove(args.name().as_str());
            }
         }
         warn!("NameOwnerChanged stream ended");
      }))
   }
}

pub struct BluetoothInterface {
   service: Arc<CarBluetoothService>,
   clients: ClientLeases,
}

impl BluetoothInterface {
   pub const fn new(service: Arc<CarBluetoothService>, clients: ClientLeases) -> Self {
      Self { service, clients }
   }
}

#[interface(name = "org.carservice.Bluetooth")]
impl BluetoothInterface {
   async fn connect_devices(&self) {
      self.service.connect_devices().await;
   }

   async fn get_profile_device_priority_list(&self, profile: u32) -> fdo::Result<Vec<String>> {
      let profile = parse_profile(profile)?;
      Ok(self
         .service
         .get_profile_device_priority_list(profile)
         .await
         .into_iter()
         .map(|device| device.to_string())
         .collect())
   }

   async fn get_device_connection_priority(&self, profile: u32, device: String) -> fdo::Result<i32> {
      let profile = parse_profile(profile)?;
      let device = parse_address(&device)?;
      Ok(self
         .service
         .get_device_connection_priority(profile, device)
         .await)
   }

   async fn set_device_connection_priority(
      &self,
      profile: u32,
      device: String,
      priority: i32,
   ) -> fdo::Result<()> {
      let profile = parse_profile(profile)?;
      let device = parse_address(&device)?;
      self
         .service
         .set_device_connection_priority(profile, device, priority)
         .await;
      Ok(())
   }

   async fn request_profile_inhibit(
      &self,
      #[zbus(header)] header: Header<'_>,
      device: String,
      profile: u32,
   ) -> fdo::Result<bool> {
      let profile = parse_profile(profile)?;
      let device = parse_address(&device)?;
      let token = self.clients.token_for(&sender(&header)?);
      Ok(self
         .service
         .request_profile_inhibit(device, profile, token)
         .await)
   }

   async fn release_profile_inhibit(
      &self,
      #[zbus(header)] header: Header<'_>,
      device: String,
      profile: u32,
   ) -> fdo::Result<bool> {
      let profile = parse_profile(profile)?;
      let device = parse_address(&device)?;
      let token = self.clients.token_for(&sender(&header)?);
      Ok(self
         .service
         .release_profile_inhibit(device, profile, token)
         .await)
   }

   async fn is_using_default_connection_policy(&self) -> bool {
      self.service.is_using_default_connection_policy().await
   }

   async fn dump(&self) -> String {
      self.service.dump().await
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_client_token_is_stable() {
      let clients = ClientLeases::new();
      let first = clients.token_for(":1.42");
      let second = clients.token_for(":1.42");
      let other = clients.token_for(":1.43");

      assert_eq!(first, second);
      assert_ne!(first, other);
      assert_eq!(clients.len(), 2);
   }

   #[test]
   fn test_removing_client_kills_token() {
      let clients = ClientLeases::new();
      let token = clients.token_for(":1.7");
      assert!(token.is_alive());

      assert!(clients.remove(":1.7"));
      assert!(!token.is_alive());
      assert!(!clients.remove(":1.7"));
   }

   #[test]
   fn test_parse_arguments() {
      assert_eq!(parse_profile(11).unwrap(), Profile::A2dpSink);
      assert!(parse_profile(99).is_err());
      assert!(parse_address("00:11:22:33:44:55").is_ok());
      assert!(parse_address("not an address").is_err());
   }
}
