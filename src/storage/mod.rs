//! Storage layer
//!
//! # Architecture
//!
//! The lease core talks to three collections of a document store, each behind
//! its own trait:
//!
//! ```text
//! counter          (SequenceAllocator)  name → seq
//! channel_recycle  (RecyclePool)        ordered set of free indices
//! channel          (ChannelStore)       id → {index, expires_at, lease_id}
//! ```
//!
//! ## Implementations
//!
//! - [`MemoryStore`]: process-local, for tests and throwaway deployments
//! - [`JournalStore`]: the same collections made durable by an append-only,
//!   checksummed journal replayed on open

pub mod documents;
pub mod engine;
pub mod journal;
pub mod store;

pub use documents::{Documents, Mutation};
pub use engine::{ChannelStore, PushOutcome, RecyclePool, SequenceAllocator};
pub use journal::{JournalBatch, JournalStore};
pub use store::{DocumentStore, MemoryStore, Persist, Volatile};

use std::sync::Arc;

/// Store handles injected into the lease coordinator.
///
/// The three handles usually point at the same backend, but nothing requires it.
#[derive(Clone)]
pub struct Stores {
    pub sequences: Arc<dyn SequenceAllocator>,
    pub recycle: Arc<dyn RecyclePool>,
    pub channels: Arc<dyn ChannelStore>,
}

impl Stores {
    /// All three collections served by one backend.
    pub fn single<S>(store: S) -> Self
    where
        S: SequenceAllocator + RecyclePool + ChannelStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            sequences: store.clone(),
            recycle: store.clone(),
            channels: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish()
    }
}
