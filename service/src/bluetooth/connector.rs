//! Profile-scoped view of the per-user proxy service.

use std::sync::Arc;

use bluer::Address;
use log::{debug, warn};

use super::{
   profile::{Profile, ProfilePriority},
   stack::UserProxies,
};

/// Connect, disconnect and priority operations for one profile.
///
/// Remote failures are logged and reported as `false` or
/// [`ProfilePriority::Undefined`].
#[derive(Clone)]
pub struct ProfileConnector {
   profile: Profile,
   proxies: Arc<dyn UserProxies>,
}

impl ProfileConnector {
   pub fn new(profile: Profile, proxies: Arc<dyn UserProxies>) -> Self {
      Self { profile, proxies }
   }

   pub const fn profile(&self) -> Profile {
      self.profile
   }

   pub async fn connect(&self, device: Address) -> bool {
      debug!("Connecting {device} on {}", self.profile);
      match self.proxies.connect_to_profile(self.profile, device).await {
         Ok(started) => started,
         Err(e) => {
            warn!("Failed to connect {device} on {}: {e}", self.profile);
            false
         },
      }
   }

   pub async fn disconnect(&self, device: Address) -> bool {
      match self
         .proxies
         .disconnect_from_profile(self.profile, device)
         .await
      {
         Ok(started) => started,
         Err(e) => {
            warn!("Failed to disconnect {device} on {}: {e}", self.profile);
            false
         },
      }
   }

   pub async fn priority(&self, device: Address) -> ProfilePriority {
      match self.proxies.get_profile_priority(self.profile, device).await {
         Ok(priority) => priority,
         Err(e) => {
            warn!("Failed to read {} priority of {device}: {e}", self.profile);
            ProfilePriority::Undefined
         },
      }
   }

   pub async fn set_priority(&self, device: Address, priority: ProfilePriority) -> bool {
      match self
         .proxies
         .set_profile_priority(self.profile, device, priority)
         .await
      {
         Ok(()) => true,
         Err(e) => {
            warn!("Failed to set {} priority of {device} to {priority}: {e}", self.profile);
            false
         },
      }
   }

   /// Connects this profile's trigger profiles, ignoring failures.
   pub async fn trigger_related(&self, device: Address) {
      for &related in self.profile.triggers() {
         debug!("{} connected on {device}, triggering {related}", self.profile);
         let connector = Self::new(related, self.proxies.clone());
         connector.connect(device).await;
      }
   }
}
