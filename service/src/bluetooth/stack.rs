//! Interfaces to the underlying Bluetooth stack.
//!
//! [`BluetoothAdapter`] covers the local adapter; [`UserProxies`] covers the
//! per-user profile proxy service that performs connects, disconnects and
//! priority changes. Both are object safe so the service graph can hold
//! them as `Arc<dyn _>` and tests can substitute in-memory fakes.

use std::{collections::HashSet, time::Duration};

use bluer::Address;
use futures::future::BoxFuture;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use super::profile::{AdapterState, BondState, MANAGED_PROFILES, Profile, ProfilePriority};
use crate::error::Result;

/// Bound on proxy setup and teardown waits.
pub const PROXY_OPERATION_TIMEOUT: Duration = Duration::from_millis(8000);

/// The local Bluetooth adapter.
pub trait BluetoothAdapter: Send + Sync {
   fn state(&self) -> BoxFuture<'_, AdapterState>;

   /// Powers the adapter on and records that Bluetooth is enabled.
   fn enable(&self) -> BoxFuture<'_, Result<()>>;

   /// Powers the adapter off. The off state is recorded only if `persist`.
   fn disable(&self, persist: bool) -> BoxFuture<'_, Result<()>>;

   fn bond_state(&self, device: Address) -> BoxFuture<'_, BondState>;

   /// Remote service UUIDs known for `device`.
   fn remote_uuids(&self, device: Address) -> BoxFuture<'_, Vec<Uuid>>;
}

/// Per-user Bluetooth profile proxy service.
pub trait UserProxies: Send + Sync {
   /// Connects every managed profile proxy, waiting at most
   /// [`PROXY_OPERATION_TIMEOUT`].
   fn setup_connection_proxies(&self) -> BoxFuture<'_, ()>;

   fn close_connection_proxies(&self) -> BoxFuture<'_, ()>;

   fn is_connection_proxy_available(&self, profile: Profile) -> BoxFuture<'_, bool>;

   fn connect_to_profile(&self, profile: Profile, device: Address) -> BoxFuture<'_, Result<bool>>;

   fn disconnect_from_profile(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<bool>>;

   fn get_profile_priority(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<ProfilePriority>>;

   fn set_profile_priority(
      &self,
      profile: Profile,
      device: Address,
      priority: ProfilePriority,
   ) -> BoxFuture<'_, Result<()>>;
}

// === Proxy Tracking ===

/// Tracks which profile proxies are connected and lets callers wait, with a
/// bound, until all of them are (or none of them are).
#[derive(Default)]
pub struct ProxyTracker {
   connected: Mutex<HashSet<Profile>>,
   changed: Notify,
}

impl ProxyTracker {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn on_service_connected(&self, profile: Profile) {
      debug!("Proxy connected: {profile}");
      self.connected.lock().insert(profile);
      self.changed.notify_waiters();
   }

   pub fn on_service_disconnected(&self, profile: Profile) {
      debug!("Proxy disconnected: {profile}");
      self.connected.lock().remove(&profile);
      self.changed.notify_waiters();
   }

   pub fn is_connected(&self, profile: Profile) -> bool {
      self.connected.lock().contains(&profile)
   }

   fn all_connected(&self) -> bool {
      let connected = self.connected.lock();
      MANAGED_PROFILES.iter().all(|p| connected.contains(p))
   }

   fn none_connected(&self) -> bool {
      self.connected.lock().is_empty()
   }

   async fn wait_until(&self, done: impl Fn(&Self) -> bool, timeout: Duration) -> bool {
      let wait = async {
         loop {
            let notified = self.changed.notified();
            if done(self) {
               return;
            }
            notified.await;
         }
      };
      time::timeout(timeout, wait).await.is_ok()
   }

   /// Returns false if the timeout elapsed first.
   pub async fn wait_all_connected(&self, timeout: Duration) -> bool {
      let ok = self.wait_until(Self::all_connected, timeout).await;
      if !ok {
         warn!("Timed out waiting for profile proxies to connect");
      }
      ok
   }

   /// Returns false if the timeout elapsed first.
   pub async fn wait_all_disconnected(&self, timeout: Duration) -> bool {
      let ok = self.wait_until(Self::none_connected, timeout).await;
      if !ok {
         warn!("Timed out waiting for profile proxies to disconnect");
      }
      ok
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;

   #[tokio::test(start_paused = true)]
   async fn test_wait_all_connected_times_out() {
      let tracker = ProxyTracker::new();
      tracker.on_service_connected(Profile::Pan);

      let start = time::Instant::now();
      assert!(!tracker.wait_all_connected(PROXY_OPERATION_TIMEOUT).await);
      assert_eq!(start.elapsed(), PROXY_OPERATION_TIMEOUT);
   }

   #[tokio::test(start_paused = true)]
   async fn test_wait_all_connected_wakes_on_last_proxy() {
      let tracker = Arc::new(ProxyTracker::new());
      let waiter = tokio::spawn({
         let tracker = tracker.clone();
         async move { tracker.wait_all_connected(PROXY_OPERATION_TIMEOUT).await }
      });

      for profile in MANAGED_PROFILES {
         time::sleep(Duration::from_millis(100)).await;
         tracker.on_service_connected(profile);
      }

      assert!(waiter.await.unwrap());
      assert!(tracker.is_connected(Profile::MapClient));
   }

   #[tokio::test(start_paused = true)]
   async fn test_wait_all_disconnected() {
      let tracker = ProxyTracker::new();
      assert!(tracker.wait_all_disconnected(Duration::from_secs(1)).await);

      tracker.on_service_connected(Profile::A2dpSink);
      assert!(!tracker.wait_all_disconnected(Duration::from_secs(1)).await);

      tracker.on_service_disconnected(Profile::A2dpSink);
      assert!(tracker.wait_all_disconnected(Duration::from_secs(1)).await);
   }
}
