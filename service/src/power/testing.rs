//! Recording power HAL and system fakes used by unit tests.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{sync::watch, time};

use super::{
   hal::{PowerHal, PowerHalEvent, PowerHalListener, SystemInterface},
   state::{ApPowerStateReq, PowerState, ShutdownParam},
};
use crate::settings::UserId;

pub async fn settle() {
   time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalCall {
   WaitForVhal,
   ShutdownCancel,
   SleepExit,
   On,
   ShutdownPrepare,
   ShutdownPostpone(Duration),
   ShutdownStart(u32),
   SleepEntry(u32),
   DisplayBrightness(i32),
}

pub struct FakeHal {
   listener: Mutex<Option<PowerHalListener>>,
   calls: Mutex<Vec<HalCall>>,
   power_state_supported: bool,
   deep_sleep_allowed: AtomicBool,
   timed_wakeup_allowed: AtomicBool,
}

impl FakeHal {
   pub fn new(power_state_supported: bool) -> Arc<Self> {
      Arc::new(Self {
         listener: Mutex::new(None),
         calls: Mutex::new(Vec::new()),
         power_state_supported,
         deep_sleep_allowed: AtomicBool::new(true),
         timed_wakeup_allowed: AtomicBool::new(true),
      })
   }

   pub fn set_deep_sleep_allowed(&self, allowed: bool) {
      self.deep_sleep_allowed.store(allowed, Ordering::Relaxed);
   }

   pub fn set_timed_wakeup_allowed(&self, allowed: bool) {
      self.timed_wakeup_allowed.store(allowed, Ordering::Relaxed);
   }

   /// Delivers an event through the installed listener.
   pub fn emit(&self, event: PowerHalEvent) {
      let listener = self.listener.lock().clone();
      if let Some(listener) = listener {
         let _ = listener.send(event);
      }
   }

   pub fn request(&self, state: ApPowerStateReq, param: Option<ShutdownParam>) {
      self.emit(PowerHalEvent::PowerStateChange(PowerState::new(state, param)));
   }

   /// Recorded calls, without the periodic shutdown postpones.
   pub fn calls(&self) -> Vec<HalCall> {
      self
         .calls
         .lock()
         .iter()
         .copied()
         .filter(|c| !matches!(c, HalCall::ShutdownPostpone(_)))
         .collect()
   }

   pub fn postpones(&self) -> usize {
      self
         .calls
         .lock()
         .iter()
         .filter(|c| matches!(c, HalCall::ShutdownPostpone(_)))
         .count()
   }

   pub fn clear(&self) {
      self.calls.lock().clear();
   }

   fn record(&self, call: HalCall) {
      self.calls.lock().push(call);
   }
}

impl PowerHal for FakeHal {
   fn set_listener(&self, listener: PowerHalListener) {
      *self.listener.lock() = Some(listener);
   }

   fn is_power_state_supported(&self) -> bool {
      self.power_state_supported
   }

   fn is_deep_sleep_allowed(&self) -> bool {
      self.deep_sleep_allowed.load(Ordering::Relaxed)
   }

   fn is_timed_wakeup_allowed(&self) -> bool {
      self.timed_wakeup_allowed.load(Ordering::Relaxed)
   }

   fn send_wait_for_vhal(&self) {
      self.record(HalCall::WaitForVhal);
   }

   fn send_shutdown_cancel(&self) {
      self.record(HalCall::ShutdownCancel);
   }

   fn send_sleep_exit(&self) {
      self.record(HalCall::SleepExit);
   }

   fn send_on(&self) {
      self.record(HalCall::On);
   }

   fn send_shutdown_prepare(&self) {
      self.record(HalCall::ShutdownPrepare);
   }

   fn send_shutdown_postpone(&self, duration: Duration) {
      self.record(HalCall::ShutdownPostpone(duration));
   }

   fn send_shutdown_start(&self, wakeup_sec: u32) {
      self.record(HalCall::ShutdownStart(wakeup_sec));
   }

   fn send_sleep_entry(&self, wakeup_sec: u32) {
      self.record(HalCall::SleepEntry(wakeup_sec));
   }

   fn send_display_brightness(&self, brightness: i32) {
      self.record(HalCall::DisplayBrightness(brightness));
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
   Display(bool),
   Brightness(i32),
   RefreshBrightness,
   SwitchUser(UserId),
   DeepSleep,
   Shutdown,
}

pub struct FakeSystem {
   calls: Mutex<Vec<SystemCall>>,
   current_user: watch::Sender<UserId>,
   sleep_succeeds: AtomicBool,
}

impl FakeSystem {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         calls: Mutex::new(Vec::new()),
         current_user: watch::Sender::new(10),
         sleep_succeeds: AtomicBool::new(true),
      })
   }

   pub fn set_sleep_succeeds(&self, succeeds: bool) {
      self.sleep_succeeds.store(succeeds, Ordering::Relaxed);
   }

   pub fn calls(&self) -> Vec<SystemCall> {
      self.calls.lock().clone()
   }

   pub fn has(&self, call: SystemCall) -> bool {
      self.calls.lock().contains(&call)
   }
}

impl SystemInterface for FakeSystem {
   fn set_display_state(&self, on: bool) {
      self.calls.lock().push(SystemCall::Display(on));
   }

   fn set_display_brightness(&self, brightness: i32) {
      self.calls.lock().push(SystemCall::Brightness(brightness));
   }

   fn refresh_display_brightness(&self) {
      self.calls.lock().push(SystemCall::RefreshBrightness);
   }

   fn is_system_supporting_deep_sleep(&self) -> bool {
      true
   }

   fn switch_to_partial_wake_lock(&self) {}

   fn release_all_wake_locks(&self) {}

   fn current_user(&self) -> UserId {
      *self.current_user.borrow()
   }

   fn switch_user(&self, user: UserId) {
      self.current_user.send_replace(user);
      self.calls.lock().push(SystemCall::SwitchUser(user));
   }

   fn user_switches(&self) -> watch::Receiver<UserId> {
      self.current_user.subscribe()
   }

   fn enter_deep_sleep(&self) -> BoxFuture<'_, bool> {
      self.calls.lock().push(SystemCall::DeepSleep);
      let ok = self.sleep_succeeds.load(Ordering::Relaxed);
      async move { ok }.boxed()
   }

   fn shutdown(&self) -> BoxFuture<'_, ()> {
      self.calls.lock().push(SystemCall::Shutdown);
      async {}.boxed()
   }
}
