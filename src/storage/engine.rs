//! Store traits
//!
//! Each trait maps onto one collection of the document store. Every method is
//! a single atomic operation against current persisted state; nothing is
//! cached between calls.

use crate::channel::{Channel, ChannelId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of returning an index to the recycle pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// The index was already recyclable; the pool is unchanged.
    AlreadyPresent,
}

/// Named monotonic counters (`counter` collection)
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    /// Atomically increments the named counter and returns the new value.
    /// The first call for a name returns 1.
    async fn next_sequence(&self, name: &str) -> Result<u64>;

    /// Current high-water mark, 0 if the counter was never incremented.
    async fn current_sequence(&self, name: &str) -> Result<u64>;
}

/// Reclaimed indices (`channel_recycle` collection)
#[async_trait]
pub trait RecyclePool: Send + Sync {
    /// Removes and returns the numerically smallest recyclable index.
    async fn pop_lowest(&self) -> Result<Option<u64>>;

    /// Returns an index to the pool. Pushing an index that is already
    /// present is tolerated and reported as [`PushOutcome::AlreadyPresent`].
    async fn push(&self, index: u64) -> Result<PushOutcome>;

    /// All recyclable indices in ascending order.
    async fn recyclable(&self) -> Result<Vec<u64>>;
}

/// Active leases (`channel` collection)
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>>;

    async fn find_by_index(&self, index: u64) -> Result<Option<Channel>>;

    /// Inserts a new channel.
    ///
    /// Fails with [`crate::error::Error::DuplicateKey`] if the id exists.
    async fn insert(&self, channel: Channel) -> Result<()>;

    /// Conditionally moves the expiry of an existing channel.
    /// Returns `None` when no channel with that id exists.
    async fn renew_expiry(
        &self,
        id: &ChannelId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Channel>>;

    /// Channels with `expires_at <= now`.
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Channel>>;

    /// Deletes the given ids whose lease is still expired at `now`; a channel
    /// renewed since it was selected survives. Returns the number deleted.
    async fn delete_many(&self, ids: &[ChannelId], now: DateTime<Utc>) -> Result<u64>;

    /// Every stored channel, ordered by index.
    async fn list_all(&self) -> Result<Vec<Channel>>;
}
