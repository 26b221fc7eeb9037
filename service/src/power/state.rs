//! Power controller states and the allowed-transition table.

use std::fmt;

use serde::Serialize;
use strum::{Display, EnumIter, FromRepr};

/// Power state as seen by listeners.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CarPowerState {
   Invalid = 0,
   WaitForVhal = 1,
   SuspendEnter = 2,
   SuspendExit = 3,
   ShutdownEnter = 5,
   On = 6,
   ShutdownPrepare = 7,
   ShutdownCancelled = 8,
}

/// Power state requested by the vehicle HAL.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ApPowerStateReq {
   On = 0,
   ShutdownPrepare = 1,
   CancelShutdown = 2,
   Finished = 3,
}

/// Qualifier of a SHUTDOWN_PREPARE request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownParam {
   ShutdownImmediately = 1,
   CanSleep = 2,
   ShutdownOnly = 3,
   SleepImmediately = 4,
}

/// A HAL power state request with its optional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerState {
   pub state: ApPowerStateReq,
   pub param: Option<ShutdownParam>,
}

impl PowerState {
   pub const fn new(state: ApPowerStateReq, param: Option<ShutdownParam>) -> Self {
      Self { state, param }
   }

   pub fn can_enter_deep_sleep(&self) -> bool {
      matches!(
         self.param,
         Some(ShutdownParam::CanSleep | ShutdownParam::SleepImmediately)
      )
   }

   pub fn can_postpone_shutdown(&self) -> bool {
      !matches!(
         self.param,
         Some(ShutdownParam::ShutdownImmediately | ShutdownParam::SleepImmediately)
      )
   }
}

/// Internal discrete state of the power controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CpmsStateKind {
   WaitForVhal,
   On,
   ShutdownPrepare,
   WaitForFinish,
   Suspend,
   SimulateSleep,
}

/// Controller state together with its transition qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpmsState {
   pub state: CpmsStateKind,
   pub can_postpone: bool,
   pub can_sleep: bool,
   pub listener_state: CarPowerState,
}

impl CpmsState {
   /// A directly requested state. Only SIMULATE_SLEEP may postpone or sleep.
   pub const fn new(state: CpmsStateKind, listener_state: CarPowerState) -> Self {
      let simulated = matches!(state, CpmsStateKind::SimulateSleep);
      Self {
         state,
         can_postpone: simulated,
         can_sleep: simulated,
         listener_state,
      }
   }

   pub fn from_hal(request: PowerState) -> Self {
      match request.state {
         ApPowerStateReq::On => Self::new(CpmsStateKind::On, CarPowerState::On),
         ApPowerStateReq::ShutdownPrepare => Self {
            state: CpmsStateKind::ShutdownPrepare,
            can_postpone: request.can_postpone_shutdown(),
            can_sleep: request.can_enter_deep_sleep(),
            listener_state: CarPowerState::ShutdownPrepare,
         },
         ApPowerStateReq::CancelShutdown => {
            Self::new(CpmsStateKind::WaitForVhal, CarPowerState::ShutdownCancelled)
         },
         ApPowerStateReq::Finished => {
            Self::new(CpmsStateKind::Suspend, CarPowerState::SuspendEnter)
         },
      }
   }
}

impl fmt::Display for CpmsState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} (listener: {}, canPostpone: {}, canSleep: {})",
         self.state, self.listener_state, self.can_postpone, self.can_sleep
      )
   }
}

/// Whether moving from `current` to `new` is a real, allowed transition.
pub fn need_power_state_change(current: Option<&CpmsState>, new: &CpmsState) -> bool {
   use CpmsStateKind::*;

   let Some(current) = current else {
      return true;
   };
   if current == new {
      return false;
   }
   match current.state {
      WaitForVhal => matches!(new.state, On | ShutdownPrepare),
      // Only a shutdown that may not be postponed interrupts a shutdown.
      ShutdownPrepare => {
         (new.state == ShutdownPrepare && !new.can_postpone)
            || matches!(new.state, WaitForFinish | WaitForVhal)
      },
      On => matches!(new.state, ShutdownPrepare | SimulateSleep),
      WaitForFinish => new.state == Suspend,
      Suspend => new.state == WaitForVhal,
      SimulateSleep => true,
   }
}
