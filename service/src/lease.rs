//! Liveness tokens.
//!
//! A [`Lease`] is held by whoever owns a resource registration (an inhibit,
//! for instance). Components keep a [`LeaseToken`] and learn about the
//! owner's death when every clone of the lease has been dropped.

use std::{
   fmt,
   future,
   hash::{Hash, Hasher},
   sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::watch;

/// Identifier reserved for [`LeaseToken::restored`].
pub const RESTORED_TOKEN_ID: u64 = 0;

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(RESTORED_TOKEN_ID + 1);

/// Owner side of a liveness token. Dropping the last clone kills it.
#[derive(Clone)]
pub struct Lease {
   id: u64,
   alive: watch::Sender<()>,
}

impl Lease {
   pub fn new() -> Self {
      let (alive, _) = watch::channel(());
      Self {
         id: NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed),
         alive,
      }
   }

   pub const fn id(&self) -> u64 {
      self.id
   }

   /// Hands out a token observing this lease.
   pub fn token(&self) -> LeaseToken {
      LeaseToken {
         id: self.id,
         alive: Some(self.alive.subscribe()),
      }
   }
}

impl Default for Lease {
   fn default() -> Self {
      Self::new()
   }
}

impl fmt::Debug for Lease {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "Lease({})", self.id)
   }
}

/// Observer side of a [`Lease`].
#[derive(Clone)]
pub struct LeaseToken {
   id: u64,
   alive: Option<watch::Receiver<()>>,
}

impl LeaseToken {
   /// Sentinel token owning records reloaded from persistence. Never dies.
   pub const fn restored() -> Self {
      Self {
         id: RESTORED_TOKEN_ID,
         alive: None,
      }
   }

   pub const fn id(&self) -> u64 {
      self.id
   }

   pub const fn is_restored(&self) -> bool {
      self.id == RESTORED_TOKEN_ID
   }

   pub fn is_alive(&self) -> bool {
      self
         .alive
         .as_ref()
         .is_none_or(|rx| rx.has_changed().is_ok())
   }

   /// Resolves once the owning lease is gone.
   pub async fn died(&self) {
      let Some(rx) = &self.alive else {
         return future::pending().await;
      };
      let mut rx = rx.clone();
      while rx.changed().await.is_ok() {}
   }
}

impl PartialEq for LeaseToken {
   fn eq(&self, other: &Self) -> bool {
      self.id == other.id
   }
}

impl Eq for LeaseToken {}

impl Hash for LeaseToken {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.id.hash(state);
   }
}

impl fmt::Debug for LeaseToken {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_restored() {
         f.write_str("LeaseToken(restored)")
      } else {
         write!(f, "LeaseToken({})", self.id)
      }
   }
}
