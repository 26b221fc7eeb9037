//! BlueZ backend for the Bluetooth stack traits.
//!
//! BlueZ is a single daemon, so the per-profile proxies are all available
//! as soon as the adapter answers. It has no notion of a per-profile
//! connection priority; priorities live in the settings store instead.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty, Session,
};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use log::{debug, info, warn};
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
   event::{BluetoothEvent, BluetoothEventBus},
   profile::{AdapterState, BondState, ConnectionState, MANAGED_PROFILES, Profile, ProfilePriority},
   stack::{BluetoothAdapter, PROXY_OPERATION_TIMEOUT, ProxyTracker, UserProxies},
};
use crate::{
   error::{CarServiceError, Result},
   settings::SecureSettings,
};

/// Global settings key holding the stack priority of one profile/device.
fn priority_key(profile: Profile, device: Address) -> SmolStr {
   format_smolstr!("bluetooth_profile_priority/{}/{device}", profile.id())
}

/// Stack priority of one profile/device, `Undefined` when never written.
fn stored_priority(
   settings: &SecureSettings,
   profile: Profile,
   device: Address,
) -> Result<ProfilePriority> {
   let value = settings.get_global(&priority_key(profile, device))?;
   Ok(value
      .and_then(|v| v.parse::<i32>().ok())
      .map_or(ProfilePriority::Undefined, ProfilePriority::from_value))
}

/// Profiles a link change applies to: those the device advertises, minus
/// the ones whose stack priority is `Off`.
fn connected_profiles(
   settings: &SecureSettings,
   device: Address,
   uuids: &HashSet<Uuid>,
) -> SmallVec<[Profile; 5]> {
   Profile::supported_by(uuids)
      .into_iter()
      .filter(|&profile| match stored_priority(settings, profile, device) {
         Ok(priority) => priority != ProfilePriority::Off,
         Err(e) => {
            warn!("Failed to read priority of {profile} on {device}: {e}");
            true
         },
      })
      .collect()
}

pub struct BluezStack {
   adapter: Adapter,
   settings: SecureSettings,
   bus: BluetoothEventBus,
   proxies: ProxyTracker,
}

impl BluezStack {
   /// Connects to BlueZ and picks the default adapter.
   pub async fn new(settings: SecureSettings, bus: BluetoothEventBus) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await.map_err(|e| {
         warn!("No default Bluetooth adapter: {e}");
         CarServiceError::AdapterNotFound
      })?;
      info!("Using Bluetooth adapter {}", adapter.name());
      Ok(Self {
         adapter,
         settings,
         bus,
         proxies: ProxyTracker::new(),
      })
   }

   async fn supported_uuid(&self, profile: Profile, device: &Device) -> Result<Option<Uuid>> {
      let uuids = device.uuids().await?.unwrap_or_default();
      Ok(profile.uuids().iter().copied().find(|u| uuids.contains(u)))
   }

   /// Translates adapter and device property changes into bus events.
   pub fn spawn_event_monitor(&self) -> JoinHandle<()> {
      let adapter = self.adapter.clone();
      let settings = self.settings.clone();
      let bus = self.bus.clone();
      tokio::spawn(async move {
         let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
               warn!("Failed to get adapter events: {e}");
               return;
            },
         };

         let mut devices: HashMap<Address, JoinHandle<()>> = HashMap::new();
         let watch = |devices: &mut HashMap<Address, JoinHandle<()>>, addr: Address| {
            if let Entry::Vacant(entry) = devices.entry(addr)
               && let Ok(device) = adapter.device(addr)
            {
               entry.insert(spawn_device_monitor(device, settings.clone(), bus.clone()));
            }
         };
         if let Ok(addresses) = adapter.device_addresses().await {
            for addr in addresses {
               watch(&mut devices, addr);
            }
         }

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added: {addr}");
                  watch(&mut devices, addr);
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed: {addr}");
                  if let Some(monitor) = devices.remove(&addr) {
                     monitor.abort();
                  }
                  bus.emit(BluetoothEvent::BondStateChanged {
                     device: addr,
                     state: BondState::None,
                  });
               },
               AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                  let state = if powered {
                     AdapterState::On
                  } else {
                     AdapterState::Off
                  };
                  info!("Bluetooth adapter is {state}");
                  bus.emit(BluetoothEvent::AdapterStateChanged(state));
               },
               _ => {},
            }
         }

         for monitor in devices.into_values() {
            monitor.abort();
         }
         warn!("Bluetooth adapter event stream ended");
      })
   }
}

fn spawn_device_monitor(
   device: Device,
   settings: SecureSettings,
   bus: BluetoothEventBus,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let addr = device.address();
      let Ok(mut events) = device.events().await else {
         warn!("Failed to get device events for {addr}");
         return;
      };
      while let Some(event) = events.next().await {
         let DeviceEvent::PropertyChanged(property) = event else {
            continue;
         };
         match property {
            DeviceProperty::Paired(paired) => {
               let state = if paired {
                  BondState::Bonded
               } else {
                  BondState::None
               };
               bus.emit(BluetoothEvent::BondStateChanged { device: addr, state });
            },
            DeviceProperty::Uuids(uuids) => {
               bus.emit(BluetoothEvent::UuidsDiscovered {
                  device: addr,
                  uuids: uuids.into_iter().collect(),
               });
            },
            // BlueZ reports the link, not individual profiles.
            DeviceProperty::Connected(connected) => {
               let uuids: HashSet<Uuid> = device.uuids().await.ok().flatten().unwrap_or_default();
               let state = if connected {
                  ConnectionState::Connected
               } else {
                  ConnectionState::Disconnected
               };
               for profile in connected_profiles(&settings, addr, &uuids) {
                  bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
                     profile,
                     device: addr,
                     state,
                  });
               }
            },
            _ => {},
         }
      }
   })
}

impl BluetoothAdapter for BluezStack {
   fn state(&self) -> BoxFuture<'_, AdapterState> {
      async {
         match self.adapter.is_powered().await {
            Ok(true) => AdapterState::On,
            Ok(false) => AdapterState::Off,
            Err(e) => {
               warn!("Failed to read adapter state: {e}");
               AdapterState::Off
            },
         }
      }
      .boxed()
   }

   fn enable(&self) -> BoxFuture<'_, Result<()>> {
      async {
         self.adapter.set_powered(true).await?;
         self.settings.set_bluetooth_persisted_on(true)?;
         Ok(())
      }
      .boxed()
   }

   fn disable(&self, persist: bool) -> BoxFuture<'_, Result<()>> {
      async move {
         self.adapter.set_powered(false).await?;
         if persist {
            self.settings.set_bluetooth_persisted_on(false)?;
         }
         Ok(())
      }
      .boxed()
   }

   fn bond_state(&self, device: Address) -> BoxFuture<'_, BondState> {
      async move {
         let paired = match self.adapter.device(device) {
            Ok(device) => device.is_paired().await.unwrap_or(false),
            Err(_) => false,
         };
         if paired {
            BondState::Bonded
         } else {
            BondState::None
         }
      }
      .boxed()
   }

   fn remote_uuids(&self, device: Address) -> BoxFuture<'_, Vec<Uuid>> {
      async move {
         let Ok(device) = self.adapter.device(device) else {
            return Vec::new();
         };
         device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default()
      }
      .boxed()
   }
}

impl UserProxies for BluezStack {
   fn setup_connection_proxies(&self) -> BoxFuture<'_, ()> {
      async {
         match self.adapter.is_powered().await {
            Ok(_) => {
               for profile in MANAGED_PROFILES {
                  self.proxies.on_service_connected(profile);
               }
            },
            Err(e) => warn!("Bluetooth adapter unreachable, proxies unavailable: {e}"),
         }
         self.proxies.wait_all_connected(PROXY_OPERATION_TIMEOUT).await;
      }
      .boxed()
   }

   fn close_connection_proxies(&self) -> BoxFuture<'_, ()> {
      async {
         for profile in MANAGED_PROFILES {
            self.proxies.on_service_disconnected(profile);
         }
         self
            .proxies
            .wait_all_disconnected(PROXY_OPERATION_TIMEOUT)
            .await;
      }
      .boxed()
   }

   fn is_connection_proxy_available(&self, profile: Profile) -> BoxFuture<'_, bool> {
      async move {
         if !self.proxies.is_connected(profile) {
            self.setup_connection_proxies().await;
         }
         self.proxies.is_connected(profile)
      }
      .boxed()
   }

   fn connect_to_profile(&self, profile: Profile, device: Address) -> BoxFuture<'_, Result<bool>> {
      async move {
         if !self.proxies.is_connected(profile) {
            return Err(CarServiceError::ProxyUnavailable(profile));
         }
         // BlueZ does not enforce priorities; an inhibited profile stays down.
         if stored_priority(&self.settings, profile, device)? == ProfilePriority::Off {
            debug!("Refusing {profile} on {device}: priority is off");
            return Ok(false);
         }
         let remote = self.adapter.device(device)?;
         let Some(uuid) = self.supported_uuid(profile, &remote).await? else {
            debug!("{device} does not advertise {profile}");
            return Ok(false);
         };
         remote
            .connect_profile(&uuid)
            .await
            .map_err(|e| CarServiceError::Remote(device, e.to_string()))?;
         // An already connected link reports no property change.
         self.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
            profile,
            device,
            state: ConnectionState::Connected,
         });
         Ok(true)
      }
      .boxed()
   }

   fn disconnect_from_profile(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<bool>> {
      async move {
         if !self.proxies.is_connected(profile) {
            return Err(CarServiceError::ProxyUnavailable(profile));
         }
         let remote = self.adapter.device(device)?;
         let Some(uuid) = self.supported_uuid(profile, &remote).await? else {
            return Ok(false);
         };
         remote
            .disconnect_profile(&uuid)
            .await
            .map_err(|e| CarServiceError::Remote(device, e.to_string()))?;
         self.bus.emit(BluetoothEvent::ProfileConnectionStateChanged {
            profile,
            device,
            state: ConnectionState::Disconnected,
         });
         Ok(true)
      }
      .boxed()
   }

   fn get_profile_priority(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<ProfilePriority>> {
      async move {
         stored_priority(&self.settings, profile, device)
      }
      .boxed()
   }

   fn set_profile_priority(
      &self,
      profile: Profile,
      device: Address,
      priority: ProfilePriority,
   ) -> BoxFuture<'_, Result<()>> {
      async move {
         self.settings.put_global(
            &priority_key(profile, device),
            &priority.value().to_string(),
         )?;
         Ok(())
      }
      .boxed()
   }
}
