//! Bluetooth profile model.
//!
//! Identifiers, stack priorities and state enums shared by the device and
//! inhibit managers.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{Display, EnumIter, FromRepr};
use uuid::Uuid;

/// Client-side profiles managed by the car service.
#[repr(u32)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
   Pan = 5,
   A2dpSink = 11,
   HeadsetClient = 16,
   PbapClient = 17,
   MapClient = 18,
}

/// Profiles the service creates device managers for, in creation order.
pub const MANAGED_PROFILES: [Profile; 5] = [
   Profile::HeadsetClient,
   Profile::PbapClient,
   Profile::A2dpSink,
   Profile::MapClient,
   Profile::Pan,
];

const fn sig_uuid(short: u16) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

pub const AUDIO_SOURCE_UUID: Uuid = sig_uuid(0x110A);
pub const HANDSFREE_AG_UUID: Uuid = sig_uuid(0x111F);
pub const HSP_AG_UUID: Uuid = sig_uuid(0x1112);
pub const MAS_UUID: Uuid = sig_uuid(0x1132);
pub const PANU_UUID: Uuid = sig_uuid(0x1115);
pub const PBAP_PSE_UUID: Uuid = sig_uuid(0x112F);

impl Profile {
   pub const fn id(self) -> u32 {
      self as u32
   }

   pub fn from_id(id: u32) -> Option<Self> {
      Self::from_repr(id)
   }

   /// Settings key of the persisted device priority list.
   pub const fn settings_key(self) -> &'static str {
      match self {
         Self::A2dpSink => "bluetooth_a2dp_sink_devices",
         Self::HeadsetClient => "bluetooth_hfp_client_devices",
         Self::MapClient => "bluetooth_map_client_devices",
         Self::Pan => "bluetooth_pan_devices",
         Self::PbapClient => "bluetooth_pbap_client_devices",
      }
   }

   /// Remote service UUIDs that indicate a device supports this profile.
   pub const fn uuids(self) -> &'static [Uuid] {
      match self {
         Self::A2dpSink => &[AUDIO_SOURCE_UUID],
         Self::HeadsetClient => &[HANDSFREE_AG_UUID, HSP_AG_UUID],
         Self::MapClient => &[MAS_UUID],
         Self::Pan => &[PANU_UUID],
         Self::PbapClient => &[PBAP_PSE_UUID],
      }
   }

   /// Profiles to connect once this one connects.
   pub const fn triggers(self) -> &'static [Self] {
      match self {
         Self::HeadsetClient => &[Self::MapClient, Self::PbapClient],
         _ => &[],
      }
   }

   /// Whether any advertised UUID belongs to this profile.
   pub fn matches_uuids<'a>(self, uuids: impl IntoIterator<Item = &'a Uuid>) -> bool {
      uuids.into_iter().any(|uuid| self.uuids().contains(uuid))
   }

   /// Managed profiles a device advertising `uuids` supports.
   pub fn supported_by<'a>(uuids: impl IntoIterator<Item = &'a Uuid> + Clone) -> SmallVec<[Self; 5]> {
      MANAGED_PROFILES
         .into_iter()
         .filter(|p| p.matches_uuids(uuids.clone()))
         .collect()
   }
}

/// Priority of a (device, profile) pair inside the Bluetooth stack.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfilePriority {
   AutoConnect = 1000,
   On = 100,
   Off = 0,
   Undefined = -1,
}

impl ProfilePriority {
   pub const fn value(self) -> i32 {
      self as i32
   }

   /// Unknown values map to [`ProfilePriority::Undefined`].
   pub fn from_value(value: i32) -> Self {
      Self::from_repr(value).unwrap_or(Self::Undefined)
   }

   pub const fn allows_connection(self) -> bool {
      self.value() >= Self::On.value()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BondState {
   None,
   Bonding,
   Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AdapterState {
   Off,
   TurningOn,
   On,
   TurningOff,
}
