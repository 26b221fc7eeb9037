//! Bluetooth profile connection management.
//!
//! Per-profile device priority lists with auto-connect, temporary profile
//! inhibits, the default connection policy and the BlueZ backend they run
//! against.

pub mod bluez;
pub mod connector;
pub mod device_manager;
pub mod event;
pub mod inhibit;
pub mod policy;
pub mod profile;
pub mod service;
pub mod stack;

#[cfg(test)]
mod testing;
