//! Car Bluetooth service: owns the per-user Bluetooth context.
//!
//! A user context is the set of profile proxies, one device manager per
//! managed profile, the inhibit manager and (optionally) the default
//! connection policy. It is built on `init_user` and torn down in reverse
//! on `release_user`.

use std::{fmt::Write as _, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   sync::{Mutex, watch},
   task::JoinHandle,
};

use super::{
   device_manager::BluetoothProfileDeviceManager,
   event::BluetoothEventBus,
   inhibit::BluetoothProfileInhibitManager,
   policy::{self, BluetoothDeviceConnectionPolicy},
   profile::{MANAGED_PROFILES, Profile},
   stack::{BluetoothAdapter, UserProxies},
};
use crate::{
   config::BluetoothConfig,
   lease::LeaseToken,
   power::service::CarPowerManagementService,
   settings::{SecureSettings, UserId},
};

struct UserContext {
   user_id: UserId,
   managers: Vec<BluetoothProfileDeviceManager>,
   inhibits: BluetoothProfileInhibitManager,
   policy: Option<BluetoothDeviceConnectionPolicy>,
}

impl UserContext {
   fn manager(&self, profile: Profile) -> Option<&BluetoothProfileDeviceManager> {
      self.managers.iter().find(|m| m.profile() == profile)
   }
}

pub struct CarBluetoothService {
   adapter: Option<Arc<dyn BluetoothAdapter>>,
   proxies: Arc<dyn UserProxies>,
   settings: SecureSettings,
   bus: BluetoothEventBus,
   power: Option<CarPowerManagementService>,
   use_default_policy: bool,
   user: Mutex<Option<UserContext>>,
}

impl CarBluetoothService {
   pub fn new(
      adapter: Option<Arc<dyn BluetoothAdapter>>,
      proxies: Arc<dyn UserProxies>,
      settings: SecureSettings,
      bus: BluetoothEventBus,
      power: Option<CarPowerManagementService>,
      config: &BluetoothConfig,
   ) -> Self {
      Self {
         adapter,
         proxies,
         settings,
         bus,
         power,
         use_default_policy: config.use_default_connection_policy,
         user: Mutex::new(None),
      }
   }

   /// Builds the context of `user_id`, replacing any previous one.
   pub async fn init_user(&self, user_id: UserId) {
      let mut user = self.user.lock().await;
      if let Some(previous) = user.take() {
         self.destroy_user(previous).await;
      }

      debug!("Initializing user {user_id}");
      self.proxies.setup_connection_proxies().await;

      let mut managers = Vec::with_capacity(MANAGED_PROFILES.len());
      for profile in MANAGED_PROFILES {
         let Some(manager) = BluetoothProfileDeviceManager::create(
            profile,
            user_id,
            self.proxies.clone(),
            self.adapter.clone(),
            self.settings.clone(),
            self.bus.clone(),
         ) else {
            debug!("Failed to create profile device manager for {profile}");
            continue;
         };
         managers.push(manager);
      }
      for manager in &managers {
         manager.start().await;
      }

      let inhibits =
         BluetoothProfileInhibitManager::new(user_id, self.proxies.clone(), self.settings.clone());
      inhibits.start().await;

      let policy = if self.use_default_policy {
         let policy = BluetoothDeviceConnectionPolicy::create(
            user_id,
            self.adapter.clone(),
            managers.clone(),
            self.power.clone(),
            self.settings.clone(),
            self.bus.clone(),
         );
         match &policy {
            Some(policy) => policy.init().await,
            None => debug!("Failed to create default Bluetooth device connection policy"),
         }
         policy
      } else {
         None
      };

      *user = Some(UserContext {
         user_id,
         managers,
         inhibits,
         policy,
      });
      info!("Switched Bluetooth to user {user_id}");
   }

   /// Rebinds the user context whenever the foreground user changes.
   pub fn spawn_user_follower(self: &Arc<Self>, mut users: watch::Receiver<UserId>) -> JoinHandle<()> {
      let service = self.clone();
      tokio::spawn(async move {
         while users.changed().await.is_ok() {
            let user_id = *users.borrow_and_update();
            if service.current_user().await == Some(user_id) {
               continue;
            }
            service.init_user(user_id).await;
         }
         warn!("Foreground user updates ended");
      })
   }

   /// Tears down the current user context, if any.
   pub async fn release_user(&self) {
      if let Some(context) = self.user.lock().await.take() {
         self.destroy_user(context).await;
      }
   }

   async fn destroy_user(&self, context: UserContext) {
      debug!("Destroying user {}", context.user_id);
      if let Some(policy) = &context.policy {
         policy.release();
      }
      context.inhibits.stop().await;
      for manager in &context.managers {
         manager.stop().await;
      }
      self.proxies.close_connection_proxies().await;
   }

   pub async fn current_user(&self) -> Option<UserId> {
      self.user.lock().await.as_ref().map(|c| c.user_id)
   }

   pub async fn is_using_default_connection_policy(&self) -> bool {
      self
         .user
         .lock()
         .await
         .as_ref()
         .is_some_and(|c| c.policy.is_some())
   }

   pub async fn connect_devices(&self) {
      let user = self.user.lock().await;
      if let Some(context) = user.as_ref() {
         policy::connect_devices(&context.managers).await;
      }
   }

   /// Devices of `profile`, highest priority first.
   pub async fn get_profile_device_priority_list(&self, profile: Profile) -> Vec<Address> {
      let user = self.user.lock().await;
      match user.as_ref().and_then(|c| c.manager(profile)) {
         Some(manager) => manager.get_device_list_snapshot().await,
         None => Vec::new(),
      }
   }

   /// Position of `device` in the list of `profile`, or -1.
   pub async fn get_device_connection_priority(&self, profile: Profile, device: Address) -> i32 {
      let user = self.user.lock().await;
      let Some(manager) = user.as_ref().and_then(|c| c.manager(profile)) else {
         return -1;
      };
      manager
         .get_device_connection_priority(device)
         .await
         .and_then(|p| i32::try_from(p).ok())
         .unwrap_or(-1)
   }

   /// Negative priorities are ignored.
   pub async fn set_device_connection_priority(
      &self,
      profile: Profile,
      device: Address,
      priority: i32,
   ) {
      let Ok(priority) = usize::try_from(priority) else {
         return;
      };
      let user = self.user.lock().await;
      if let Some(manager) = user.as_ref().and_then(|c| c.manager(profile)) {
         manager
            .set_device_connection_priority(device, priority)
            .await;
      }
   }

   pub async fn request_profile_inhibit(
      &self,
      device: Address,
      profile: Profile,
      token: LeaseToken,
   ) -> bool {
      let user = self.user.lock().await;
      match user.as_ref() {
         Some(context) => {
            context
               .inhibits
               .request_profile_inhibit(device, profile, token)
               .await
         },
         None => false,
      }
   }

   pub async fn release_profile_inhibit(
      &self,
      device: Address,
      profile: Profile,
      token: LeaseToken,
   ) -> bool {
      let user = self.user.lock().await;
      match user.as_ref() {
         Some(context) => {
            context
               .inhibits
               .release_profile_inhibit(device, profile, token)
               .await
         },
         None => false,
      }
   }

   pub async fn dump(&self) -> String {
      let user = self.user.lock().await;
      let mut out = String::from("*CarBluetoothService*\n");
      let Some(context) = user.as_ref() else {
         out.push_str("\tUser ID: -1\n\tUser Proxies: No\n");
         let _ = writeln!(
            out,
            "\tUsing default policy? {}",
            if self.use_default_policy { "Yes" } else { "No" }
         );
         return out;
      };

      let _ = writeln!(out, "\tUser ID: {}", context.user_id);
      out.push_str("\tUser Proxies: Yes\n");
      for manager in &context.managers {
         out.push_str(&manager.dump().await);
      }
      out.push_str(&context.inhibits.dump().await);
      let _ = writeln!(
         out,
         "\tUsing default policy? {}",
         if self.use_default_policy { "Yes" } else { "No" }
      );
      match &context.policy {
         Some(policy) => out.push_str(&policy.dump()),
         None => out.push_str("\tBluetoothDeviceConnectionPolicy: null\n"),
      }
      out
   }
}
