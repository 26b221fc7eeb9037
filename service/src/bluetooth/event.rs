//! Bluetooth stack events.
//!
//! The stack backend publishes adapter, bond, UUID and profile connection
//! changes on a broadcast bus; every interested component holds its own
//! subscription.

use bluer::Address;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::profile::{AdapterState, BondState, ConnectionState, Profile};

const EVENT_BUS_CAPACITY: usize = 256;

/// Events emitted by the Bluetooth stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothEvent {
   ProfileConnectionStateChanged {
      profile: Profile,
      device: Address,
      state: ConnectionState,
   },
   BondStateChanged {
      device: Address,
      state: BondState,
   },
   UuidsDiscovered {
      device: Address,
      uuids: Vec<Uuid>,
   },
   AdapterStateChanged(AdapterState),
}

/// Cloneable broadcast bus of [`BluetoothEvent`]s.
#[derive(Clone)]
pub struct BluetoothEventBus {
   tx: broadcast::Sender<BluetoothEvent>,
}

impl BluetoothEventBus {
   pub fn new() -> Self {
      let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
      Self { tx }
   }

   /// Emits an event to all current subscribers.
   pub fn emit(&self, event: BluetoothEvent) {
      // No subscribers is fine; nobody is listening yet.
      let _ = self.tx.send(event);
   }

   pub fn subscribe(&self) -> broadcast::Receiver<BluetoothEvent> {
      self.tx.subscribe()
   }
}

impl Default for BluetoothEventBus {
   fn default() -> Self {
      Self::new()
   }
}

/// Receives the next event, waiting forever while unsubscribed.
///
/// Lagged receivers skip the lost events; a closed bus drops the
/// subscription.
pub async fn next_event(
   events: &mut Option<broadcast::Receiver<BluetoothEvent>>,
) -> BluetoothEvent {
   loop {
      let Some(rx) = events.as_mut() else {
         return std::future::pending().await;
      };
      match rx.recv().await {
         Ok(event) => return event,
         Err(broadcast::error::RecvError::Lagged(n)) => {
            log::warn!("Bluetooth event subscriber lagged, {n} events dropped");
         },
         Err(broadcast::error::RecvError::Closed) => {
            *events = None;
         },
      }
   }
}
