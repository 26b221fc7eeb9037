//! Default policy deciding when devices get auto-connected.
//!
//! Connections are kicked off when the vehicle powers on and when the
//! adapter comes up. On shutdown prepare the adapter is turned off without
//! persisting that choice, so it comes back on with the next ON.

use std::{fmt::Write as _, sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

use super::{
   device_manager::BluetoothProfileDeviceManager,
   event::{BluetoothEvent, BluetoothEventBus, next_event},
   profile::AdapterState,
   stack::BluetoothAdapter,
};
use crate::{
   power::{
      service::{CarPowerManagementService, ListenerId},
      state::CarPowerState,
   },
   settings::{SecureSettings, UserId},
};

/// Upper bound on turning the adapter off during shutdown prepare.
pub const ADAPTER_DISABLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts auto-connecting on every profile.
pub async fn connect_devices(managers: &[BluetoothProfileDeviceManager]) {
   debug!("Connect devices for each profile");
   for manager in managers {
      manager.begin_auto_connecting().await;
   }
}

#[derive(Default)]
struct Registrations {
   adapter_events: Option<JoinHandle<()>>,
   power_events: Option<JoinHandle<()>>,
   power_listener: Option<ListenerId>,
}

pub struct BluetoothDeviceConnectionPolicy {
   user_id: UserId,
   adapter: Arc<dyn BluetoothAdapter>,
   managers: Arc<[BluetoothProfileDeviceManager]>,
   power: Option<CarPowerManagementService>,
   settings: SecureSettings,
   bus: BluetoothEventBus,
   registrations: Mutex<Registrations>,
}

impl BluetoothDeviceConnectionPolicy {
   /// Returns `None` without an adapter.
   pub fn create(
      user_id: UserId,
      adapter: Option<Arc<dyn BluetoothAdapter>>,
      managers: Vec<BluetoothProfileDeviceManager>,
      power: Option<CarPowerManagementService>,
      settings: SecureSettings,
      bus: BluetoothEventBus,
   ) -> Option<Self> {
      let Some(adapter) = adapter else {
         warn!("Cannot create connection policy without an adapter");
         return None;
      };
      Some(Self {
         user_id,
         adapter,
         managers: managers.into(),
         power,
         settings,
         bus,
         registrations: Mutex::new(Registrations::default()),
      })
   }

   /// Starts listening to adapter and power events, and connects right
   /// away if the adapter is already on.
   pub async fn init(&self) {
      debug!("[User: {}] Connection policy init", self.user_id);
      self.release();

      let adapter_events = self.spawn_adapter_listener();
      let power = self.power.as_ref().map(|power| self.spawn_power_listener(power));
      {
         let mut registrations = self.registrations.lock();
         registrations.adapter_events = Some(adapter_events);
         if let Some((id, task)) = power {
            registrations.power_listener = Some(id);
            registrations.power_events = Some(task);
         } else {
            debug!("No power service, not following vehicle power state");
         }
      }

      // Harmless if a connection attempt is already running.
      if self.adapter.state().await == AdapterState::On {
         connect_devices(&self.managers).await;
      }
   }

   /// Stops listening. Safe after a partial or repeated init.
   pub fn release(&self) {
      let registrations = std::mem::take(&mut *self.registrations.lock());
      if let Some(task) = registrations.adapter_events {
         task.abort();
      }
      if let Some(task) = registrations.power_events {
         task.abort();
      }
      if let (Some(power), Some(id)) = (&self.power, registrations.power_listener) {
         power.unregister_listener(id);
      }
   }

   pub async fn connect_devices(&self) {
      connect_devices(&self.managers).await;
   }

   pub fn dump(&self) -> String {
      let registrations = self.registrations.lock();
      let mut out = String::from("BluetoothDeviceConnectionPolicy:\n");
      let _ = writeln!(out, "\tUserId: {}", self.user_id);
      let _ = writeln!(
         out,
         "\tListening: adapter={} power={}",
         registrations.adapter_events.is_some(),
         registrations.power_events.is_some()
      );
      out
   }

   fn spawn_adapter_listener(&self) -> JoinHandle<()> {
      // Subscribe before spawning so that nothing emitted after init is lost.
      let mut events = Some(self.bus.subscribe());
      let managers = self.managers.clone();
      tokio::spawn(async move {
         loop {
            if let BluetoothEvent::AdapterStateChanged(AdapterState::On) =
               next_event(&mut events).await
            {
               info!("Bluetooth adapter is on, connecting devices");
               connect_devices(&managers).await;
            }
         }
      })
   }

   fn spawn_power_listener(
      &self,
      power: &CarPowerManagementService,
   ) -> (ListenerId, JoinHandle<()>) {
      let mut listener = power.register_listener_with_completion();
      let id = listener.id();
      let power = power.clone();
      let adapter = self.adapter.clone();
      let managers = self.managers.clone();
      let settings = self.settings.clone();

      let task = tokio::spawn(async move {
         while let Some(state) = listener.recv().await {
            debug!("Car power state has changed to {state}");
            match state {
               CarPowerState::On => {
                  info!("Car is powering on, enabling Bluetooth and connecting devices");
                  if settings.is_bluetooth_persisted_on()
                     && let Err(e) = adapter.enable().await
                  {
                     warn!("Failed to enable Bluetooth adapter: {e}");
                  }
                  // If the adapter is still coming up, its ON event connects.
                  if adapter.state().await == AdapterState::On {
                     connect_devices(&managers).await;
                  }
               },
               CarPowerState::ShutdownPrepare => {
                  info!("Car is preparing for shutdown, disabling Bluetooth adapter");
                  match time::timeout(ADAPTER_DISABLE_TIMEOUT, adapter.disable(false)).await {
                     Ok(Ok(())) => {},
                     Ok(Err(e)) => warn!("Failed to disable Bluetooth adapter: {e}"),
                     Err(_) => warn!("Timed out disabling Bluetooth adapter"),
                  }
                  power.finished(id);
               },
               _ => {},
            }
         }
      });
      (id, task)
   }
}

impl Drop for BluetoothDeviceConnectionPolicy {
   fn drop(&mut self) {
      self.release();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::{
         profile::Profile,
         testing::{AdapterCall, DEVICE_A, DEVICE_B, FakeAdapter, FakeProxies, settle},
      },
      config::PowerConfig,
      power::{
         state::{ApPowerStateReq, ShutdownParam},
         testing::{FakeHal, HalCall, FakeSystem},
      },
      settings::open_test_settings,
   };

   const USER: UserId = 10;

   struct Harness {
      policy: BluetoothDeviceConnectionPolicy,
      proxies: Arc<FakeProxies>,
      adapter: Arc<FakeAdapter>,
      bus: BluetoothEventBus,
      settings: SecureSettings,
      _dir: tempfile::TempDir,
   }

   async fn harness(state: AdapterState, power: Option<CarPowerManagementService>) -> Harness {
      let (settings, dir) = open_test_settings();
      let proxies = FakeProxies::new();
      let adapter = FakeAdapter::new(AdapterState::On);
      let bus = BluetoothEventBus::new();

      let mut managers = Vec::new();
      for (profile, device) in [(Profile::HeadsetClient, DEVICE_A), (Profile::A2dpSink, DEVICE_B)] {
         let manager = BluetoothProfileDeviceManager::create(
            profile,
            USER,
            proxies.clone(),
            Some(adapter.clone()),
            settings.clone(),
            bus.clone(),
         )
         .unwrap();
         manager.start().await;
         manager.add_device(device).await;
         managers.push(manager);
      }
      adapter.set_state(state);

      let policy = BluetoothDeviceConnectionPolicy::create(
         USER,
         Some(adapter.clone()),
         managers,
         power,
         settings.clone(),
         bus.clone(),
      )
      .unwrap();
      Harness {
         policy,
         proxies,
         adapter,
         bus,
         settings,
         _dir: dir,
      }
   }

   async fn power_service() -> (CarPowerManagementService, Arc<FakeHal>) {
      let hal = FakeHal::new(true);
      let config = PowerConfig {
         garage_mode_duration_override_secs: Some(60),
         ..Default::default()
      };
      let power = CarPowerManagementService::new(hal.clone(), FakeSystem::new(), &config);
      power.init();
      settle().await;
      (power, hal)
   }

   #[tokio::test(start_paused = true)]
   async fn test_create_without_adapter() {
      let (settings, _dir) = open_test_settings();
      let policy = BluetoothDeviceConnectionPolicy::create(
         USER,
         None,
         Vec::new(),
         None,
         settings,
         BluetoothEventBus::new(),
      );
      assert!(policy.is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_init_connects_when_adapter_on() {
      let h = harness(AdapterState::On, None).await;

      h.policy.init().await;
      settle().await;

      let connects = h.proxies.connects();
      assert!(connects.contains(&(Profile::HeadsetClient, DEVICE_A)));
      assert!(connects.contains(&(Profile::A2dpSink, DEVICE_B)));
   }

   #[tokio::test(start_paused = true)]
   async fn test_adapter_on_event_connects() {
      let h = harness(AdapterState::Off, None).await;

      h.policy.init().await;
      settle().await;
      assert!(h.proxies.connects().is_empty());

      h.adapter.set_state(AdapterState::On);
      h.bus.emit(BluetoothEvent::AdapterStateChanged(AdapterState::On));
      settle().await;

      assert!(
         h.proxies
            .connects()
            .contains(&(Profile::HeadsetClient, DEVICE_A))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_release_stops_listening() {
      let h = harness(AdapterState::Off, None).await;
      h.policy.init().await;
      h.policy.release();
      h.policy.release();

      h.adapter.set_state(AdapterState::On);
      h.bus.emit(BluetoothEvent::AdapterStateChanged(AdapterState::On));
      settle().await;

      assert!(h.proxies.connects().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_on_enables_persisted_adapter() {
      let (power, hal) = power_service().await;
      let h = harness(AdapterState::Off, Some(power)).await;
      h.policy.init().await;

      hal.request(ApPowerStateReq::On, None);
      settle().await;

      assert_eq!(h.adapter.calls(), vec![AdapterCall::Enable]);
      assert!(
         h.proxies
            .connects()
            .contains(&(Profile::A2dpSink, DEVICE_B))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_on_keeps_adapter_off_when_persisted_off() {
      let (power, hal) = power_service().await;
      let h = harness(AdapterState::Off, Some(power)).await;
      h.settings.set_bluetooth_persisted_on(false).unwrap();
      h.policy.init().await;

      hal.request(ApPowerStateReq::On, None);
      settle().await;

      assert!(h.adapter.calls().is_empty());
      assert!(h.proxies.connects().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_prepare_disables_and_acknowledges() {
      let (power, hal) = power_service().await;
      let h = harness(AdapterState::On, Some(power)).await;
      h.policy.init().await;
      hal.request(ApPowerStateReq::On, None);
      settle().await;

      hal.request(ApPowerStateReq::ShutdownPrepare, Some(ShutdownParam::CanSleep));
      settle().await;

      assert_eq!(
         h.adapter.calls().last(),
         Some(&AdapterCall::Disable { persist: false })
      );
      // The acknowledgement lets the controller move on without a timeout.
      assert_eq!(hal.calls().last(), Some(&HalCall::SleepEntry(0)));
   }

   #[tokio::test(start_paused = true)]
   async fn test_dump() {
      let h = harness(AdapterState::Off, None).await;
      h.policy.init().await;
      let dump = h.policy.dump();
      assert!(dump.contains("UserId: 10"));
      assert!(dump.contains("adapter=true"));
   }
}
