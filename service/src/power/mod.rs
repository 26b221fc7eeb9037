//! Vehicle power state machine.

pub mod hal;
pub mod service;
pub mod state;

#[cfg(test)]
pub mod testing;
