//! In-memory Bluetooth stack used by unit tests.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::Address;
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::time;
use uuid::Uuid;

use super::{
   profile::{AdapterState, BondState, Profile, ProfilePriority},
   stack::{BluetoothAdapter, UserProxies},
};
use crate::error::{CarServiceError, Result};

pub const DEVICE_A: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
pub const DEVICE_B: Address = Address([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
pub const DEVICE_C: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);

/// Lets spawned tasks and actors drain their queues.
pub async fn settle() {
   time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCall {
   Connect(Profile, Address),
   Disconnect(Profile, Address),
   SetPriority(Profile, Address, ProfilePriority),
}

#[derive(Default)]
struct ProxyState {
   priorities: HashMap<(Profile, Address), ProfilePriority>,
   failing_connects: HashSet<Address>,
   failing_priority_reads: HashSet<Address>,
   unavailable: HashSet<Profile>,
   calls: Vec<ProxyCall>,
   setups: usize,
   closes: usize,
}

/// Fake per-user proxy service recording every call.
#[derive(Default)]
pub struct FakeProxies {
   state: Mutex<ProxyState>,
}

impl FakeProxies {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn set_priority(&self, profile: Profile, device: Address, priority: ProfilePriority) {
      self
         .state
         .lock()
         .priorities
         .insert((profile, device), priority);
   }

   pub fn priority(&self, profile: Profile, device: Address) -> ProfilePriority {
      self
         .state
         .lock()
         .priorities
         .get(&(profile, device))
         .copied()
         .unwrap_or(ProfilePriority::Undefined)
   }

   /// `connect_to_profile` returns `Ok(false)` for this device.
   pub fn fail_connect(&self, device: Address) {
      self.state.lock().failing_connects.insert(device);
   }

   /// `get_profile_priority` returns a remote error for this device.
   pub fn fail_priority_read(&self, device: Address) {
      self.state.lock().failing_priority_reads.insert(device);
   }

   pub fn set_available(&self, profile: Profile, available: bool) {
      let mut state = self.state.lock();
      if available {
         state.unavailable.remove(&profile);
      } else {
         state.unavailable.insert(profile);
      }
   }

   pub fn calls(&self) -> Vec<ProxyCall> {
      self.state.lock().calls.clone()
   }

   pub fn connects(&self) -> Vec<(Profile, Address)> {
      self
         .calls()
         .into_iter()
         .filter_map(|c| match c {
            ProxyCall::Connect(p, d) => Some((p, d)),
            _ => None,
         })
         .collect()
   }

   pub fn clear_calls(&self) {
      self.state.lock().calls.clear();
   }

   pub fn setup_count(&self) -> (usize, usize) {
      let state = self.state.lock();
      (state.setups, state.closes)
   }
}

impl UserProxies for FakeProxies {
   fn setup_connection_proxies(&self) -> BoxFuture<'_, ()> {
      self.state.lock().setups += 1;
      async {}.boxed()
   }

   fn close_connection_proxies(&self) -> BoxFuture<'_, ()> {
      self.state.lock().closes += 1;
      async {}.boxed()
   }

   fn is_connection_proxy_available(&self, profile: Profile) -> BoxFuture<'_, bool> {
      let available = !self.state.lock().unavailable.contains(&profile);
      async move { available }.boxed()
   }

   fn connect_to_profile(&self, profile: Profile, device: Address) -> BoxFuture<'_, Result<bool>> {
      let mut state = self.state.lock();
      // Like the real stack, an `Off` priority refuses before any attempt.
      if state.priorities.get(&(profile, device)) == Some(&ProfilePriority::Off) {
         return async { Ok(false) }.boxed();
      }
      state.calls.push(ProxyCall::Connect(profile, device));
      let ok = !state.failing_connects.contains(&device);
      async move { Ok(ok) }.boxed()
   }

   fn disconnect_from_profile(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<bool>> {
      self
         .state
         .lock()
         .calls
         .push(ProxyCall::Disconnect(profile, device));
      async { Ok(true) }.boxed()
   }

   fn get_profile_priority(
      &self,
      profile: Profile,
      device: Address,
   ) -> BoxFuture<'_, Result<ProfilePriority>> {
      let result = if self.state.lock().failing_priority_reads.contains(&device) {
         Err(CarServiceError::Remote(device, "binder died".into()))
      } else {
         Ok(self.priority(profile, device))
      };
      async move { result }.boxed()
   }

   fn set_profile_priority(
      &self,
      profile: Profile,
      device: Address,
      priority: ProfilePriority,
   ) -> BoxFuture<'_, Result<()>> {
      let mut state = self.state.lock();
      state
         .calls
         .push(ProxyCall::SetPriority(profile, device, priority));
      state.priorities.insert((profile, device), priority);
      async { Ok(()) }.boxed()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCall {
   Enable,
   Disable { persist: bool },
}

struct AdapterInner {
   state: AdapterState,
   bonded: HashSet<Address>,
   uuids: HashMap<Address, Vec<Uuid>>,
   calls: Vec<AdapterCall>,
}

/// Fake adapter. `enable`/`disable` flip the reported state.
pub struct FakeAdapter {
   inner: Mutex<AdapterInner>,
}

impl FakeAdapter {
   pub fn new(state: AdapterState) -> Arc<Self> {
      Arc::new(Self {
         inner: Mutex::new(AdapterInner {
            state,
            bonded: HashSet::new(),
            uuids: HashMap::new(),
            calls: Vec::new(),
         }),
      })
   }

   pub fn set_state(&self, state: AdapterState) {
      self.inner.lock().state = state;
   }

   pub fn bond(&self, device: Address, uuids: &[Uuid]) {
      let mut inner = self.inner.lock();
      inner.bonded.insert(device);
      inner.uuids.insert(device, uuids.to_vec());
   }

   pub fn calls(&self) -> Vec<AdapterCall> {
      self.inner.lock().calls.clone()
   }
}

impl BluetoothAdapter for FakeAdapter {
   fn state(&self) -> BoxFuture<'_, AdapterState> {
      let state = self.inner.lock().state;
      async move { state }.boxed()
   }

   fn enable(&self) -> BoxFuture<'_, Result<()>> {
      let mut inner = self.inner.lock();
      inner.calls.push(AdapterCall::Enable);
      inner.state = AdapterState::On;
      async { Ok(()) }.boxed()
   }

   fn disable(&self, persist: bool) -> BoxFuture<'_, Result<()>> {
      let mut inner = self.inner.lock();
      inner.calls.push(AdapterCall::Disable { persist });
      inner.state = AdapterState::Off;
      async { Ok(()) }.boxed()
   }

   fn bond_state(&self, device: Address) -> BoxFuture<'_, BondState> {
      let state = if self.inner.lock().bonded.contains(&device) {
         BondState::Bonded
      } else {
         BondState::None
      };
      async move { state }.boxed()
   }

   fn remote_uuids(&self, device: Address) -> BoxFuture<'_, Vec<Uuid>> {
      let uuids = self
         .inner
         .lock()
         .uuids
         .get(&device)
         .cloned()
         .unwrap_or_default();
      async move { uuids }.boxed()
   }
}
