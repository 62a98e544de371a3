//! Lease coordinator
//!
//! Create-or-renew semantics over the three stores:
//!
//! ```text
//! create(id)
//!   ├─ lease exists ─────────────────────────────→ renew
//!   └─ allocate index: recycle pool (lowest) ──or──→ sequence
//!        └─ insert
//!             ├─ ok ──────────────────────────────→ Created
//!             ├─ duplicate id (lost a race) ──────→ give index back, renew
//!             └─ storage error ───────────────────→ give index back, fail
//! ```
//!
//! "Give index back" applies only to indices popped from the recycle pool.
//! A sequence-issued index that never reached a channel is left unused.
//!
//! A popped index whose holder is live is discarded as an anomaly. If the
//! holder has already expired, a sweep is between its push and its delete, so
//! the index goes back to the pool and a fresh one is taken from the sequence.
//!
//! Every store call runs under `store_timeout`. The deadline can only fire at
//! an `.await` inside the store future: [`MemoryStore`](crate::storage::MemoryStore)
//! and [`JournalStore`](crate::storage::JournalStore) finish on their first
//! poll (the journal fsyncs inline under the store lock), so for them it never
//! triggers. It bounds backends that do asynchronous I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{Channel, ChannelId, Clock};
use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::metrics::LeaseMetrics;
use crate::storage::{PushOutcome, Stores};

/// How many times a create restarts when its lease vanishes mid-flight
const CREATE_ATTEMPTS: usize = 3;

/// Upper bound on pool entries discarded in one allocation
const MAX_POOL_POPS: usize = 8;

/// What `acquire` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Created,
    Renewed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexSource {
    Recycled,
    Sequence,
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Channels found expired
    pub expired: usize,
    /// Indices returned to the recycle pool
    pub recycled: usize,
    /// Channels actually deleted
    pub deleted: u64,
    /// Channels kept for the next sweep because their index could not be recycled
    pub push_failures: usize,
}

/// Issues, renews and reclaims channel leases
pub struct LeaseCoordinator {
    stores: Stores,
    clock: Arc<dyn Clock>,
    metrics: LeaseMetrics,
    lease_duration: chrono::Duration,
    store_timeout: Duration,
    sequence_name: String,
}

impl std::fmt::Debug for LeaseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("lease_duration", &self.lease_duration)
            .field("store_timeout", &self.store_timeout)
            .field("sequence_name", &self.sequence_name)
            .finish()
    }
}

impl LeaseCoordinator {
    pub fn new(
        stores: Stores,
        config: &LeaseConfig,
        clock: Arc<dyn Clock>,
        metrics: LeaseMetrics,
    ) -> Self {
        Self {
            stores,
            clock,
            metrics,
            lease_duration: config.lease_duration(),
            store_timeout: config.store_timeout(),
            sequence_name: config.sequence_name.clone(),
        }
    }

    pub fn metrics(&self) -> &LeaseMetrics {
        &self.metrics
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        self.lease_duration
    }

    fn expiry_from_now(&self) -> DateTime<Utc> {
        self.clock.now() + self.lease_duration
    }

    /// Run one store call under the per-call deadline. A future that completes
    /// without yielding is never interrupted.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {}ms",
                op,
                self.store_timeout.as_millis()
            ))),
        }
    }

    /// Create a lease, or renew it if `id` already holds one.
    pub async fn create(&self, id: &ChannelId) -> Result<Channel> {
        self.acquire(id).await.map(|(channel, _)| channel)
    }

    /// Like [`create`](Self::create), also reporting which path was taken.
    #[instrument(skip(self, id), fields(channel_id = %id))]
    pub async fn acquire(&self, id: &ChannelId) -> Result<(Channel, LeaseOutcome)> {
        for attempt in 0..CREATE_ATTEMPTS {
            if self
                .bounded("find_by_id", self.stores.channels.find_by_id(id))
                .await?
                .is_some()
            {
                match self.renew(id).await? {
                    Some(channel) => return Ok((channel, LeaseOutcome::Renewed)),
                    // Swept between lookup and renew; start over.
                    None => continue,
                }
            }

            let (index, source) = self.allocate_index().await?;
            let now = self.clock.now();
            let channel = Channel::new(id.clone(), index, now, now + self.lease_duration);

            match self
                .bounded("insert", self.stores.channels.insert(channel.clone()))
                .await
            {
                Ok(()) => {
                    self.metrics.leases_created.inc();
                    info!(
                        index,
                        lease_id = %channel.lease_id,
                        recycled = source == IndexSource::Recycled,
                        "Channel leased"
                    );
                    return Ok((channel, LeaseOutcome::Created));
                }
                Err(Error::DuplicateKey(_)) => {
                    debug!(attempt, index, "Lost create race, renewing instead");
                    if source == IndexSource::Recycled {
                        self.restore_index(index).await;
                    }
                    if let Some(channel) = self.renew(id).await? {
                        return Ok((channel, LeaseOutcome::Renewed));
                    }
                }
                Err(e) => {
                    if source == IndexSource::Recycled {
                        self.restore_index(index).await;
                    }
                    warn!(index, error = %e, "Failed to persist channel lease");
                    return Err(e);
                }
            }
        }

        Err(Error::Internal(format!(
            "Channel '{}' kept disappearing during create",
            id
        )))
    }

    /// Pick an index: lowest recyclable first, fresh sequence value otherwise.
    async fn allocate_index(&self) -> Result<(u64, IndexSource)> {
        let now = self.clock.now();

        for _ in 0..MAX_POOL_POPS {
            let index = match self
                .bounded("pop_lowest", self.stores.recycle.pop_lowest())
                .await?
            {
                Some(index) => index,
                None => break,
            };

            let holder = match self
                .bounded("find_by_index", self.stores.channels.find_by_index(index))
                .await
            {
                Ok(holder) => holder,
                Err(e) => {
                    self.restore_index(index).await;
                    return Err(e);
                }
            };

            match holder {
                None => {
                    self.metrics.indices_recycled.inc();
                    return Ok((index, IndexSource::Recycled));
                }
                Some(holder) if holder.is_expired(now) => {
                    // A sweep pushed it and has not deleted the holder yet.
                    debug!(
                        index,
                        holder = %holder.id,
                        "Popped index still held by an expired lease, returning it"
                    );
                    self.restore_index(index).await;
                    break;
                }
                Some(holder) => {
                    // The pool disagreed with a live lease; the lease wins.
                    self.metrics.recycle_anomalies.inc();
                    warn!(
                        index,
                        holder = %holder.id,
                        "Recycle anomaly: popped index is still leased, discarding"
                    );
                }
            }
        }

        let index = self
            .bounded(
                "next_sequence",
                self.stores.sequences.next_sequence(&self.sequence_name),
            )
            .await?;
        self.metrics.indices_issued.inc();
        Ok((index, IndexSource::Sequence))
    }

    /// Compensating push of a popped index that never made it into a channel.
    async fn restore_index(&self, index: u64) {
        match self
            .bounded("push", self.stores.recycle.push(index))
            .await
        {
            Ok(PushOutcome::Inserted) => debug!(index, "Returned index to recycle pool"),
            Ok(PushOutcome::AlreadyPresent) => {
                self.metrics.recycle_anomalies.inc();
                warn!(index, "Recycle anomaly: index already in pool on rollback");
            }
            Err(e) => warn!(index, error = %e, "Failed to return index, it is leaked"),
        }
    }

    /// Extend an existing lease. `None` means there is no lease to renew.
    #[instrument(skip(self, id), fields(channel_id = %id))]
    pub async fn renew(&self, id: &ChannelId) -> Result<Option<Channel>> {
        let expires_at = self.expiry_from_now();
        let renewed = self
            .bounded(
                "renew_expiry",
                self.stores.channels.renew_expiry(id, expires_at),
            )
            .await?;

        match &renewed {
            Some(channel) => {
                self.metrics.leases_renewed.inc();
                debug!(index = channel.index, %expires_at, "Channel lease renewed");
            }
            None => debug!("No lease to renew"),
        }

        Ok(renewed)
    }

    pub async fn get(&self, id: &ChannelId) -> Result<Option<Channel>> {
        self.bounded("find_by_id", self.stores.channels.find_by_id(id))
            .await
    }

    /// Every stored channel, by index. May include leases that are expired
    /// but not yet swept.
    pub async fn list(&self) -> Result<Vec<Channel>> {
        let channels = self
            .bounded("list_all", self.stores.channels.list_all())
            .await?;
        self.metrics.active_leases.set(channels.len() as i64);
        Ok(channels)
    }

    /// Indices currently waiting for reuse.
    pub async fn recyclable(&self) -> Result<Vec<u64>> {
        self.bounded("recyclable", self.stores.recycle.recyclable())
            .await
    }

    /// Delete expired leases and return their indices to the pool.
    ///
    /// A failed push keeps that channel for the next sweep instead of
    /// leaking its index.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self
            .bounded("find_expired", self.stores.channels.find_expired(now))
            .await?;

        if expired.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };
        let mut reclaimable = Vec::with_capacity(expired.len());

        for channel in &expired {
            match self
                .bounded("push", self.stores.recycle.push(channel.index))
                .await
            {
                Ok(PushOutcome::Inserted) => {
                    report.recycled += 1;
                    reclaimable.push(channel.id.clone());
                }
                Ok(PushOutcome::AlreadyPresent) => {
                    self.metrics.recycle_anomalies.inc();
                    warn!(
                        channel_id = %channel.id,
                        index = channel.index,
                        "Recycle anomaly: index already in pool"
                    );
                    reclaimable.push(channel.id.clone());
                }
                Err(e) => {
                    report.push_failures += 1;
                    warn!(
                        channel_id = %channel.id,
                        index = channel.index,
                        error = %e,
                        "Failed to recycle index, keeping channel for next sweep"
                    );
                }
            }
        }

        if !reclaimable.is_empty() {
            report.deleted = self
                .bounded(
                    "delete_many",
                    self.stores.channels.delete_many(&reclaimable, now),
                )
                .await?;
        }

        if (report.deleted as usize) < reclaimable.len() {
            warn!(
                selected = reclaimable.len(),
                deleted = report.deleted,
                "Some expired channels were renewed during the sweep"
            );
        }

        self.metrics.leases_swept.inc_by(report.deleted);
        info!(
            expired = report.expired,
            recycled = report.recycled,
            deleted = report.deleted,
            push_failures = report.push_failures,
            "Swept expired channels"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ManualClock;
    use crate::storage::{ChannelStore, MemoryStore, RecyclePool, SequenceAllocator};

    fn id(s: &str) -> ChannelId {
        ChannelId::parse(s).unwrap()
    }

    fn setup() -> (LeaseCoordinator, MemoryStore, ManualClock) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let coordinator = LeaseCoordinator::new(
            Stores::single(store.clone()),
            &LeaseConfig::default(),
            Arc::new(clock.clone()),
            LeaseMetrics::new().unwrap(),
        );
        (coordinator, store, clock)
    }

    #[tokio::test]
    async fn test_first_create_uses_sequence() -> Result<()> {
        let (coordinator, store, clock) = setup();

        let (channel, outcome) = coordinator.acquire(&id("ch1")).await?;
        assert_eq!(outcome, LeaseOutcome::Created);
        assert_eq!(channel.index, 1);
        assert_eq!(channel.expires_at, clock.now() + chrono::Duration::minutes(30));
        assert_eq!(store.current_sequence("channel").await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_create_twice_renews() -> Result<()> {
        let (coordinator, _store, clock) = setup();

        let first = coordinator.create(&id("ch1")).await?;
        clock.advance(chrono::Duration::seconds(10));
        let (second, outcome) = coordinator.acquire(&id("ch1")).await?;

        assert_eq!(outcome, LeaseOutcome::Renewed);
        assert_eq!(second.index, first.index);
        assert_eq!(second.lease_id, first.lease_id);
        assert!(second.expires_at > first.expires_at);
        assert_eq!(coordinator.metrics().indices_issued.get(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_recycled_index_preferred_lowest_first() -> Result<()> {
        let (coordinator, store, _clock) = setup();
        store.push(7).await?;
        store.push(3).await?;

        let channel = coordinator.create(&id("ch2")).await?;
        assert_eq!(channel.index, 3);
        assert_eq!(store.recyclable().await?, vec![7]);
        assert_eq!(store.current_sequence("channel").await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_leased_index_in_pool_is_discarded() -> Result<()> {
        let (coordinator, store, clock) = setup();
        let now = clock.now();
        store
            .insert(Channel::new(id("holder"), 2, now, now + chrono::Duration::minutes(5)))
            .await?;
        store.push(2).await?;
        store.push(4).await?;

        let channel = coordinator.create(&id("ch1")).await?;
        assert_eq!(channel.index, 4);
        assert!(store.recyclable().await?.is_empty());
        assert_eq!(coordinator.metrics().recycle_anomalies.get(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_renew_missing_is_none() -> Result<()> {
        let (coordinator, store, _clock) = setup();

        assert!(coordinator.renew(&id("missing")).await?.is_none());
        assert!(store.is_empty());
        assert!(store.recyclable().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_recycles_expired() -> Result<()> {
        let (coordinator, store, clock) = setup();
        let now = clock.now();
        store
            .insert(Channel::new(id("ch1"), 5, now, now - chrono::Duration::seconds(1)))
            .await?;
        coordinator.create(&id("live")).await?;

        let report = coordinator.sweep().await?;
        assert_eq!(report.expired, 1);
        assert_eq!(report.recycled, 1);
        assert_eq!(report.deleted, 1);

        let remaining: Vec<_> = coordinator.list().await?.into_iter().map(|c| c.id).collect();
        assert_eq!(remaining, vec![id("live")]);
        assert_eq!(store.recyclable().await?, vec![5]);

        assert_eq!(coordinator.sweep().await?, SweepReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_recycling_stops_sequence_growth() -> Result<()> {
        let (coordinator, store, clock) = setup();

        for name in ["a", "b", "c"] {
            coordinator.create(&id(name)).await?;
        }
        clock.advance(chrono::Duration::minutes(31));
        coordinator.sweep().await?;

        for name in ["d", "e", "f"] {
            coordinator.create(&id(name)).await?;
        }

        let indices: Vec<_> = coordinator.list().await?.into_iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(store.current_sequence("channel").await?, 3);

        Ok(())
    }
}
