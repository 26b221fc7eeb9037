//! Car power management service.
//!
//! Requests from the vehicle HAL are queued as pending states and applied
//! one at a time by a single worker task. The worker walks the controller
//! through the transition table in [`super::state`], notifies registered
//! listeners and answers the HAL.
//!
//! While in SHUTDOWN_PREPARE the controller waits for every listener that
//! registered with completion to call [`CarPowerManagementService::finished`]
//! (or to go away), bounded by the garage mode duration. During the wait the
//! HAL receives a shutdown postpone every polling interval.

use std::{
   collections::{BTreeMap, HashSet, VecDeque},
   fmt::Write as _,
   sync::{Arc, Weak},
   time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::{Notify, mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use super::{
   hal::{PowerHal, PowerHalEvent, SYSTEM_USER, SystemInterface},
   state::{CarPowerState, CpmsState, CpmsStateKind, PowerState, need_power_state_change},
};
use crate::{config::PowerConfig, settings::UserId};

/// Interval between shutdown postpone messages while waiting for listeners.
pub const SHUTDOWN_POLLING_INTERVAL: Duration = Duration::from_millis(2000);
/// Postpone duration sent to the HAL on every poll.
pub const SHUTDOWN_EXTEND_MAX: Duration = Duration::from_millis(5000);

const RELEASE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
   /// Notified of every state; never waited for.
   FireAndForget,
   /// Must acknowledge SHUTDOWN_PREPARE via `finished`.
   Completion,
}

/// A listener registration. Dropping it unregisters the listener.
#[derive(Debug)]
pub struct PowerStateListener {
   id: ListenerId,
   kind: ListenerKind,
   rx: mpsc::UnboundedReceiver<CarPowerState>,
}

impl PowerStateListener {
   pub const fn id(&self) -> ListenerId {
      self.id
   }

   pub const fn kind(&self) -> ListenerKind {
      self.kind
   }

   /// Next state change, or `None` once the service is released.
   pub async fn recv(&mut self) -> Option<CarPowerState> {
      self.rx.recv().await
   }

   pub fn try_recv(&mut self) -> Option<CarPowerState> {
      self.rx.try_recv().ok()
   }
}

struct RegisteredListener {
   kind: ListenerKind,
   tx: mpsc::UnboundedSender<CarPowerState>,
   watcher: JoinHandle<()>,
}

impl Drop for RegisteredListener {
   fn drop(&mut self) {
      self.watcher.abort();
   }
}

#[derive(Default)]
struct ListenerRegistry {
   next_id: ListenerId,
   listeners: BTreeMap<ListenerId, RegisteredListener>,
   waiting_for: HashSet<ListenerId>,
}

#[derive(Default)]
struct ControllerState {
   current: Option<CpmsState>,
   pending: VecDeque<CpmsState>,
   timer: Option<JoinHandle<()>>,
   timer_generation: u64,
   /// Bumped whenever queued processing-complete messages must be dropped.
   completion_epoch: u64,
   processing_start: Option<Instant>,
   last_sleep_entry: Option<Instant>,
   next_wakeup_sec: u32,
   shutdown_on_finish: bool,
   is_booting: bool,
}

impl ControllerState {
   fn release_timer(&mut self) {
      if let Some(timer) = self.timer.take() {
         timer.abort();
      }
   }

   /// A sleep entry happened after the current processing started.
   fn slept_since_processing_start(&self) -> bool {
      matches!(
         (self.last_sleep_entry, self.processing_start),
         (Some(slept), Some(started)) if slept > started
      )
   }
}

#[derive(Default)]
struct SimulationState {
   in_simulated_deep_sleep_mode: bool,
   wake_from_simulated_sleep: bool,
}

enum PowerCommand {
   PowerStateChange,
   ProcessingComplete(u64),
   DisplayBrightnessChange(i32),
   Release(oneshot::Sender<()>),
}

struct Shared {
   hal: Arc<dyn PowerHal>,
   system: Arc<dyn SystemInterface>,
   max_garage_mode_duration: Duration,
   target_user: Option<UserId>,
   inbox: mpsc::UnboundedSender<PowerCommand>,
   state: Mutex<ControllerState>,
   listeners: Mutex<ListenerRegistry>,
   simulation: Mutex<SimulationState>,
   simulation_wake: Notify,
   hal_forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the power controller. Cheap to clone.
#[derive(Clone)]
pub struct CarPowerManagementService {
   shared: Arc<Shared>,
}

impl CarPowerManagementService {
   /// Creates the controller and starts its worker. Nothing is sent to the
   /// HAL until [`Self::init`].
   pub fn new(
      hal: Arc<dyn PowerHal>,
      system: Arc<dyn SystemInterface>,
      config: &PowerConfig,
   ) -> Self {
      let (inbox, rx) = mpsc::unbounded_channel();
      let shared = Arc::new(Shared {
         hal,
         system,
         max_garage_mode_duration: config.max_garage_mode_duration(),
         target_user: config.target_user,
         inbox,
         state: Mutex::new(ControllerState {
            is_booting: true,
            ..Default::default()
         }),
         listeners: Mutex::new(ListenerRegistry::default()),
         simulation: Mutex::new(SimulationState::default()),
         simulation_wake: Notify::new(),
         hal_forwarder: Mutex::new(None),
      });
      tokio::spawn(Shared::run(shared.clone(), rx));
      Self { shared }
   }

   /// Subscribes to the HAL and enters the initial state.
   pub fn init(&self) {
      let (tx, mut rx) = mpsc::unbounded_channel();
      self.shared.hal.set_listener(tx);

      let weak = Arc::downgrade(&self.shared);
      let forwarder = tokio::spawn(async move {
         while let Some(event) = rx.recv().await {
            let Some(shared) = weak.upgrade() else {
               return;
            };
            match event {
               PowerHalEvent::PowerStateChange(state) => {
                  shared.queue_state(CpmsState::from_hal(state));
               },
               PowerHalEvent::DisplayBrightnessChange(brightness) => {
                  shared.post(PowerCommand::DisplayBrightnessChange(brightness));
               },
            }
         }
      });
      if let Some(old) = self.shared.hal_forwarder.lock().replace(forwarder) {
         old.abort();
      }

      if self.shared.hal.is_power_state_supported() {
         self.shared.queue_state(CpmsState::new(
            CpmsStateKind::WaitForVhal,
            CarPowerState::WaitForVhal,
         ));
      } else {
         warn!("Vehicle HAL does not support power state yet");
         self.shared
            .queue_state(CpmsState::new(CpmsStateKind::On, CarPowerState::On));
      }
   }

   /// Stops the timer, drops queued work and disconnects every listener.
   pub async fn release(&self) {
      {
         let mut state = self.shared.state.lock();
         state.release_timer();
         state.current = None;
         state.pending.clear();
         state.completion_epoch += 1;
      }
      if let Some(forwarder) = self.shared.hal_forwarder.lock().take() {
         forwarder.abort();
      }

      let (tx, rx) = oneshot::channel();
      if self.shared.inbox.send(PowerCommand::Release(tx)).is_ok()
         && time::timeout(RELEASE_JOIN_TIMEOUT, rx).await.is_err()
      {
         error!("Timeout while waiting for the power worker to stop");
      }

      {
         let mut registry = self.shared.listeners.lock();
         registry.listeners.clear();
         registry.waiting_for.clear();
      }
      self.shared.system.release_all_wake_locks();
   }

   /// Entry point for HAL power state requests.
   pub fn on_ap_power_state_change(&self, state: PowerState) {
      self.shared.queue_state(CpmsState::from_hal(state));
   }

   pub fn on_display_brightness_change(&self, brightness: i32) {
      self
         .shared
         .post(PowerCommand::DisplayBrightnessChange(brightness));
   }

   /// Forwards a user brightness change (0-100%) to the vehicle.
   pub fn send_display_brightness(&self, brightness: i32) {
      self.shared.hal.send_display_brightness(brightness);
   }

   pub fn register_listener(&self) -> PowerStateListener {
      self.register(ListenerKind::FireAndForget)
   }

   /// Registers a listener that must call [`Self::finished`] after handling
   /// SHUTDOWN_PREPARE.
   pub fn register_listener_with_completion(&self) -> PowerStateListener {
      self.register(ListenerKind::Completion)
   }

   fn register(&self, kind: ListenerKind) -> PowerStateListener {
      let (tx, rx) = mpsc::unbounded_channel();
      let id = {
         let mut registry = self.shared.listeners.lock();
         registry.next_id += 1;
         registry.next_id
      };

      // A listener whose receiver goes away is unregistered, which also
      // counts as its acknowledgement.
      let weak = Arc::downgrade(&self.shared);
      let liveness = tx.clone();
      let watcher = tokio::spawn(async move {
         liveness.closed().await;
         if let Some(shared) = weak.upgrade() {
            shared.unregister_listener(id);
         }
      });

      self
         .shared
         .listeners
         .lock()
         .listeners
         .insert(id, RegisteredListener { kind, tx, watcher });
      PowerStateListener { id, kind, rx }
   }

   pub fn unregister_listener(&self, id: ListenerId) {
      self.shared.unregister_listener(id);
   }

   /// Acknowledges SHUTDOWN_PREPARE for a completion listener.
   pub fn finished(&self, id: ListenerId) {
      self.shared.finished_impl(id);
   }

   /// Shut down instead of suspending when the current shutdown prepare
   /// completes.
   pub fn request_shutdown_on_next_suspend(&self) {
      self.shared.state.lock().shutdown_on_finish = true;
   }

   /// Keeps the earliest requested wake-up. Negative values are ignored.
   pub fn schedule_next_wakeup_time(&self, seconds: i32) {
      let Ok(seconds) = u32::try_from(seconds) else {
         warn!("Next wake up can not be in negative time. Ignoring!");
         return;
      };
      let mut state = self.shared.state.lock();
      if !self.shared.hal.is_timed_wakeup_allowed() {
         warn!("Setting timed wakeups are disabled in HAL. Skipping");
         state.next_wakeup_sec = 0;
         return;
      }
      if state.next_wakeup_sec == 0 || state.next_wakeup_sec > seconds {
         state.next_wakeup_sec = seconds;
      } else {
         debug!("Tried to schedule next wake up, but already had shorter scheduled time");
      }
   }

   /// Runs a shutdown prepare that ends in a simulated sleep instead of a
   /// real suspend.
   pub fn force_simulated_suspend(&self) {
      {
         let mut simulation = self.shared.simulation.lock();
         simulation.in_simulated_deep_sleep_mode = true;
         simulation.wake_from_simulated_sleep = false;
      }
      self.shared.queue_state(CpmsState::new(
         CpmsStateKind::SimulateSleep,
         CarPowerState::ShutdownPrepare,
      ));
   }

   /// Cancels a simulated suspend, waking the worker if it is sleeping.
   pub fn force_simulated_resume(&self) {
      self.shared.queue_state(CpmsState::new(
         CpmsStateKind::WaitForVhal,
         CarPowerState::ShutdownCancelled,
      ));
      self.shared.simulation.lock().wake_from_simulated_sleep = true;
      self.shared.simulation_wake.notify_waiters();
   }

   pub fn current_state(&self) -> Option<CpmsState> {
      self.shared.state.lock().current
   }

   pub fn dump(&self) -> String {
      let state = self.shared.state.lock();
      let registry = self.shared.listeners.lock();
      let current = state
         .current
         .map_or_else(|| "null".to_owned(), |s| s.to_string());
      let mut out = String::from("*PowerManagementService*\n");
      let _ = writeln!(
         out,
         "currentState: {current}, processingStart: {:?}, lastSleepEntry: {:?}",
         state.processing_start, state.last_sleep_entry
      );
      let _ = writeln!(
         out,
         "nextWakeupSec: {}, shutdownOnFinish: {}, maxGarageModeDuration: {}ms",
         state.next_wakeup_sec,
         state.shutdown_on_finish,
         self.shared.max_garage_mode_duration.as_millis()
      );
      let _ = writeln!(
         out,
         "listeners: {}, waitingFor: {}",
         registry.listeners.len(),
         registry.waiting_for.len()
      );
      out
   }
}

impl Shared {
   async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PowerCommand>) {
      while let Some(command) = rx.recv().await {
         match command {
            PowerCommand::PowerStateChange => self.do_handle_power_state_change().await,
            PowerCommand::ProcessingComplete(epoch) => self.do_handle_processing_complete(epoch),
            PowerCommand::DisplayBrightnessChange(brightness) => {
               self.system.set_display_brightness(brightness);
            },
            PowerCommand::Release(done) => {
               let _ = done.send(());
               break;
            },
         }
      }
      debug!("Power worker stopped");
   }

   fn post(&self, command: PowerCommand) {
      if self.inbox.send(command).is_err() {
         debug!("Power worker is gone, dropping command");
      }
   }

   fn queue_state(&self, state: CpmsState) {
      self.state.lock().pending.push_front(state);
      self.post(PowerCommand::PowerStateChange);
   }

   async fn do_handle_power_state_change(self: &Arc<Self>) {
      let state = {
         let mut st = self.state.lock();
         let Some(state) = st.pending.pop_front() else {
            return;
         };
         st.pending.clear();
         info!("Handling power state change: {state}");
         if !need_power_state_change(st.current.as_ref(), &state) {
            debug!("No power state change needed");
            return;
         }
         // A real transition supersedes whatever was queued before.
         st.release_timer();
         st.completion_epoch += 1;
         st.current = Some(state);
         state
      };

      info!("Current power state: {state}");
      match state.state {
         CpmsStateKind::WaitForVhal => self.handle_wait_for_vhal(state),
         CpmsStateKind::On => self.handle_on(),
         CpmsStateKind::ShutdownPrepare => self.handle_shutdown_prepare(state).await,
         CpmsStateKind::SimulateSleep => self.simulate_shutdown_prepare(),
         CpmsStateKind::WaitForFinish => self.handle_wait_for_finish(state),
         CpmsStateKind::Suspend => self.handle_finish().await,
      }
   }

   fn handle_wait_for_vhal(&self, state: CpmsState) {
      self.send_power_manager_event(state.listener_state);
      match state.listener_state {
         CarPowerState::WaitForVhal => self.hal.send_wait_for_vhal(),
         CarPowerState::ShutdownCancelled => self.hal.send_shutdown_cancel(),
         CarPowerState::SuspendExit => self.hal.send_sleep_exit(),
         _ => {},
      }
   }

   fn handle_on(&self) {
      let booting = std::mem::take(&mut self.state.lock().is_booting);
      // No user switch while booting; the initial user is already coming up.
      if !booting
         && let Some(target) = self.target_user
         && target != SYSTEM_USER
         && target != self.system.current_user()
      {
         info!("Desired user changed, switching to user {target}");
         self.system.switch_user(target);
      }
      self.system.set_display_state(true);
      self.send_power_manager_event(CarPowerState::On);
      self.hal.send_on();
   }

   async fn handle_shutdown_prepare(self: &Arc<Self>, state: CpmsState) {
      self.system.set_display_state(false);
      let deep_sleep_unavailable = !self.hal.is_deep_sleep_allowed()
         || !self.system.is_system_supporting_deep_sleep()
         || !state.can_sleep;
      self.state.lock().shutdown_on_finish |= deep_sleep_unavailable;

      if state.can_postpone {
         info!("Starting shutdown prepare");
         self.start_shutdown_prepare();
      } else {
         info!("Starting shutdown immediately");
         self.state.lock().release_timer();
         // Immediate shutdown never schedules a wake-up.
         self.hal.send_shutdown_start(0);
         self.system.shutdown().await;
      }
   }

   fn simulate_shutdown_prepare(self: &Arc<Self>) {
      self.system.set_display_state(false);
      info!("Starting simulated shutdown prepare");
      self.start_shutdown_prepare();
   }

   fn start_shutdown_prepare(self: &Arc<Self>) {
      self.state.lock().processing_start = Some(Instant::now());
      self.send_power_manager_event(CarPowerState::ShutdownPrepare);
      self.hal.send_shutdown_prepare();
      self.start_processing_timer();
   }

   fn start_processing_timer(self: &Arc<Self>) {
      let interval_ms = SHUTDOWN_POLLING_INTERVAL.as_millis();
      let polling_count = (self.max_garage_mode_duration.as_millis() / interval_ms) as u64 + 1;
      info!(
         "Processing before shutdown expected for {}ms, polling {polling_count} times",
         self.max_garage_mode_duration.as_millis()
      );

      let mut st = self.state.lock();
      st.release_timer();
      st.timer_generation += 1;
      let generation = st.timer_generation;
      let weak = Arc::downgrade(self);
      st.timer = Some(tokio::spawn(processing_timer(weak, generation, polling_count)));
   }

   fn on_processing_timer_expired(&self, generation: u64) {
      let epoch = {
         let mut st = self.state.lock();
         if st.timer_generation != generation || st.timer.is_none() {
            return;
         }
         // Detach rather than abort: this runs on the timer task itself.
         st.timer = None;
         st.completion_epoch
      };
      warn!("Shutdown prepare timed out, continuing without remaining listeners");
      self.post(PowerCommand::ProcessingComplete(epoch));
   }

   fn handle_wait_for_finish(&self, state: CpmsState) {
      self.send_power_manager_event(state.listener_state);
      let wakeup_sec = self.state.lock().next_wakeup_sec;
      match state.listener_state {
         CarPowerState::SuspendEnter => self.hal.send_sleep_entry(wakeup_sec),
         CarPowerState::ShutdownEnter => self.hal.send_shutdown_start(wakeup_sec),
         _ => {},
      }
   }

   async fn handle_finish(&self) {
      let simulated = self.simulation.lock().in_simulated_deep_sleep_mode;
      let must_shut_down = self.state.lock().shutdown_on_finish && !simulated;
      if must_shut_down {
         self.system.shutdown().await;
      } else {
         self.do_handle_deep_sleep(simulated).await;
      }
   }

   async fn do_handle_deep_sleep(&self, simulated: bool) {
      // The partial wake lock keeps the system up until enter_deep_sleep.
      self.system.switch_to_partial_wake_lock();
      {
         let mut st = self.state.lock();
         st.completion_epoch += 1;
         st.last_sleep_entry = Some(Instant::now());
      }

      let next_listener_state = if simulated {
         self.simulate_sleep_by_waiting().await;
         CarPowerState::ShutdownCancelled
      } else {
         if !self.system.enter_deep_sleep().await {
            error!("Sleep did not succeed, attempting to shut down");
            self.system.shutdown().await;
         }
         CarPowerState::SuspendExit
      };

      // Wake-ups are one-shot.
      self.state.lock().next_wakeup_sec = 0;
      self.system.refresh_display_brightness();
      self.queue_state(CpmsState::new(CpmsStateKind::WaitForVhal, next_listener_state));
   }

   async fn simulate_sleep_by_waiting(&self) {
      info!("Starting to simulate deep sleep");
      loop {
         let notified = self.simulation_wake.notified();
         {
            let mut simulation = self.simulation.lock();
            if simulation.wake_from_simulated_sleep {
               simulation.in_simulated_deep_sleep_mode = false;
               break;
            }
         }
         notified.await;
      }
      info!("Exit simulated deep sleep");
   }

   fn do_handle_processing_complete(&self, epoch: u64) {
      let listener_state = {
         let mut st = self.state.lock();
         if epoch != st.completion_epoch {
            debug!("Dropping stale processing complete");
            return;
         }
         st.completion_epoch += 1;
         st.release_timer();
         if !st.shutdown_on_finish && st.slept_since_processing_start() {
            warn!("Duplicate sleep entry request, ignore");
            return;
         }
         if st.shutdown_on_finish {
            CarPowerState::ShutdownEnter
         } else {
            CarPowerState::SuspendEnter
         }
      };
      self.queue_state(CpmsState::new(CpmsStateKind::WaitForFinish, listener_state));
   }

   fn send_power_manager_event(&self, new_state: CarPowerState) {
      // SHUTDOWN_PREPARE is the only state that waits for acknowledgements.
      let allow_completion = new_state == CarPowerState::ShutdownPrepare;

      let (fire_and_forget, completers) = {
         let mut registry = self.listeners.lock();
         registry.waiting_for.clear();
         let mut fire_and_forget = Vec::new();
         let mut completers = Vec::new();
         for (&id, listener) in &registry.listeners {
            match listener.kind {
               ListenerKind::FireAndForget => fire_and_forget.push(listener.tx.clone()),
               ListenerKind::Completion => completers.push((id, listener.tx.clone())),
            }
         }
         // The full wait set exists before any completer is notified.
         if allow_completion {
            registry
               .waiting_for
               .extend(completers.iter().map(|(id, _)| *id));
         }
         (fire_and_forget, completers)
      };

      for tx in &fire_and_forget {
         let _ = tx.send(new_state);
      }
      for (id, tx) in &completers {
         if tx.send(new_state).is_err() {
            debug!("Power listener {id} is gone");
         }
      }

      if allow_completion && completers.is_empty() {
         self.signal_complete();
      }
   }

   fn unregister_listener(&self, id: ListenerId) {
      let was_completer = self
         .listeners
         .lock()
         .listeners
         .remove(&id)
         .is_some_and(|l| l.kind == ListenerKind::Completion);
      if was_completer {
         self.finished_impl(id);
      }
   }

   fn finished_impl(&self, id: ListenerId) {
      let all_complete = {
         let mut registry = self.listeners.lock();
         registry.waiting_for.remove(&id) && registry.waiting_for.is_empty()
      };
      if all_complete {
         self.signal_complete();
      }
   }

   fn signal_complete(&self) {
      let epoch = {
         let st = self.state.lock();
         let Some(current) = st.current else {
            return;
         };
         if !matches!(
            current.state,
            CpmsStateKind::ShutdownPrepare | CpmsStateKind::SimulateSleep
         ) {
            return;
         }
         if !st.shutdown_on_finish
            && st.slept_since_processing_start()
            && st.last_sleep_entry.is_some_and(|slept| slept < Instant::now())
         {
            info!("Already slept, ignoring completion");
            return;
         }
         st.completion_epoch
      };
      info!("Listeners are finished, handling processing complete");
      self.post(PowerCommand::ProcessingComplete(epoch));
   }
}

async fn processing_timer(shared: Weak<Shared>, generation: u64, polling_count: u64) {
   let mut interval = time::interval(SHUTDOWN_POLLING_INTERVAL);
   let mut count = 0;
   loop {
      interval.tick().await;
      let Some(shared) = shared.upgrade() else {
         return;
      };
      count += 1;
      if count > polling_count {
         shared.on_processing_timer_expired(generation);
         return;
      }
      shared.hal.send_shutdown_postpone(SHUTDOWN_EXTEND_MAX);
   }
}
