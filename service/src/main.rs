//! Car service daemon.
//!
//! Runs the vehicle power state machine and the Bluetooth connection
//! policy for the foreground user, and exposes both over D-Bus.

use std::sync::Arc;

use log::{info, warn};
use tokio::{signal, task::JoinHandle};
use zbus::{Connection, connection};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod lease;
mod power;
mod settings;

use crate::{
   bluetooth::{
      bluez::BluezStack,
      event::BluetoothEventBus,
      service::CarBluetoothService,
      stack::{BluetoothAdapter, UserProxies},
   },
   config::{BusKind, Config},
   dbus::{BluetoothInterface, ClientLeases, PowerInterface, PowerInterfaceSignals},
   error::Result,
   power::{
      hal::{LinuxSystemInterface, LoggingPowerHal, SystemInterface},
      service::CarPowerManagementService,
   },
   settings::SecureSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting car service daemon...");

   let config = Config::load()?;
   let settings = SecureSettings::open()?;

   // Power controller
   let hal = Arc::new(LoggingPowerHal::new(&config.power));
   let system = Arc::new(LinuxSystemInterface::new(
      &config.power,
      config.bluetooth.user_id,
   ));
   let mut users = system.user_switches();
   let power = CarPowerManagementService::new(hal.clone(), system, &config.power);
   power.init();

   // Bluetooth, optional: the daemon keeps running without an adapter
   let bus = BluetoothEventBus::new();
   let bluetooth = match BluezStack::new(settings.clone(), bus.clone()).await {
      Ok(stack) => Some(Arc::new(stack)),
      Err(e) => {
         warn!("Bluetooth unavailable: {e}");
         None
      },
   };
   let monitor = bluetooth.as_ref().map(|stack| stack.spawn_event_monitor());
   let bluetooth = match bluetooth {
      Some(stack) => {
         let adapter: Arc<dyn BluetoothAdapter> = stack.clone();
         let proxies: Arc<dyn UserProxies> = stack;
         let service = Arc::new(CarBluetoothService::new(
            Some(adapter),
            proxies,
            settings.clone(),
            bus,
            Some(power.clone()),
            &config.bluetooth,
         ));
         service.init_user(*users.borrow_and_update()).await;
         let follower = service.spawn_user_follower(users);
         Some((service, follower))
      },
      None => None,
   };

   // D-Bus
   let builder = match config.dbus.bus {
      BusKind::System => connection::Builder::system()?,
      BusKind::Session => connection::Builder::session()?,
   };
   let mut builder = builder
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::POWER_PATH, PowerInterface::new(power.clone(), hal))?;
   let clients = ClientLeases::new();
   if let Some((service, _)) = &bluetooth {
      builder = builder.serve_at(
         dbus::BLUETOOTH_PATH,
         BluetoothInterface::new(service.clone(), clients.clone()),
      )?;
   }
   let connection = builder.build().await?;

   info!("Car service started at {}", dbus::BUS_NAME);

   let client_watcher = clients.spawn_watcher(&connection).await?;
   let state_forwarder = spawn_state_forwarder(&power, connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down car service...");

   client_watcher.abort();
   state_forwarder.abort();
   if let Some((service, follower)) = &bluetooth {
      follower.abort();
      service.release_user().await;
   }
   if let Some(monitor) = monitor {
      monitor.abort();
   }
   power.release().await;

   Ok(())
}

/// Re-emits every power state change as a D-Bus signal.
async fn spawn_state_forwarder(
   power: &CarPowerManagementService,
   connection: Connection,
) -> Result<JoinHandle<()>> {
   let iface = connection
      .object_server()
      .interface::<_, PowerInterface>(dbus::POWER_PATH)
      .await?;
   let mut listener = power.register_listener();
   Ok(tokio::spawn(async move {
      while let Some(state) = listener.recv().await {
         if let Err(e) = iface.state_changed(state as u32).await {
            warn!("Error emitting power state {state}: {e}");
         }
      }
   }))
}
