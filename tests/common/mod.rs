//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use channel_lease::channel::{Channel, ChannelId, Clock, ManualClock};
use channel_lease::config::LeaseConfig;
use channel_lease::error::{Error, Result};
use channel_lease::storage::{
    ChannelStore, MemoryStore, PushOutcome, RecyclePool, SequenceAllocator, Stores,
};
use channel_lease::{LeaseCoordinator, LeaseMetrics};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub fn id(s: &str) -> ChannelId {
    ChannelId::parse(s).expect("valid channel id")
}

/// Signals `delete_many` was reached, then waits to be released
pub type DeleteGate = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// Memory store with switchable failures and call counters. Every call yields
/// to the scheduler first so concurrent tasks interleave.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Fail this many upcoming inserts with a storage error
    pub failing_inserts: AtomicUsize,
    /// Report "not found" for this many upcoming `find_by_id` calls
    pub hidden_lookups: AtomicUsize,
    pub fail_pushes: AtomicBool,
    /// Delay every `find_expired` by this many milliseconds
    pub find_expired_delay_ms: AtomicU64,
    pub sequence_calls: AtomicUsize,
    pub sweep_queries: AtomicUsize,
    /// Pause the next `delete_many` until released
    pub delete_gate: Mutex<Option<DeleteGate>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SequenceAllocator for FlakyStore {
    async fn next_sequence(&self, name: &str) -> Result<u64> {
        tokio::task::yield_now().await;
        self.sequence_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.next_sequence(name).await
    }

    async fn current_sequence(&self, name: &str) -> Result<u64> {
        tokio::task::yield_now().await;
        self.inner.current_sequence(name).await
    }
}

#[async_trait]
impl RecyclePool for FlakyStore {
    async fn pop_lowest(&self) -> Result<Option<u64>> {
        tokio::task::yield_now().await;
        self.inner.pop_lowest().await
    }

    async fn push(&self, index: u64) -> Result<PushOutcome> {
        tokio::task::yield_now().await;
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected push failure".to_string()));
        }
        self.inner.push(index).await
    }

    async fn recyclable(&self) -> Result<Vec<u64>> {
        tokio::task::yield_now().await;
        self.inner.recyclable().await
    }
}

#[async_trait]
impl ChannelStore for FlakyStore {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>> {
        tokio::task::yield_now().await;
        if take_one(&self.hidden_lookups) {
            return Ok(None);
        }
        self.inner.find_by_id(id).await
    }

    async fn find_by_index(&self, index: u64) -> Result<Option<Channel>> {
        tokio::task::yield_now().await;
        self.inner.find_by_index(index).await
    }

    async fn insert(&self, channel: Channel) -> Result<()> {
        tokio::task::yield_now().await;
        if take_one(&self.failing_inserts) {
            return Err(Error::Storage("injected insert failure".to_string()));
        }
        self.inner.insert(channel).await
    }

    async fn renew_expiry(
        &self,
        id: &ChannelId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Channel>> {
        tokio::task::yield_now().await;
        self.inner.renew_expiry(id, expires_at).await
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Channel>> {
        tokio::task::yield_now().await;
        self.sweep_queries.fetch_add(1, Ordering::SeqCst);
        let delay = self.find_expired_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.find_expired(now).await
    }

    async fn delete_many(&self, ids: &[ChannelId], now: DateTime<Utc>) -> Result<u64> {
        tokio::task::yield_now().await;
        let gate = self.delete_gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.await;
        }
        self.inner.delete_many(ids, now).await
    }

    async fn list_all(&self) -> Result<Vec<Channel>> {
        tokio::task::yield_now().await;
        self.inner.list_all().await
    }
}

pub struct Harness {
    pub coordinator: Arc<LeaseCoordinator>,
    pub store: Arc<FlakyStore>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LeaseConfig::default())
    }

    pub fn with_config(config: LeaseConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let clock = ManualClock::new(Utc::now());
        let stores = Stores {
            sequences: store.clone(),
            recycle: store.clone(),
            channels: store.clone(),
        };
        let coordinator = Arc::new(LeaseCoordinator::new(
            stores,
            &config,
            Arc::new(clock.clone()),
            LeaseMetrics::new().expect("metrics registry"),
        ));

        Self {
            coordinator,
            store,
            clock,
        }
    }

    /// Insert a channel directly, bypassing the coordinator
    pub async fn seed(&self, name: &str, index: u64, expires_at: DateTime<Utc>) {
        let now = self.clock.now();
        self.store
            .inner
            .insert(Channel::new(id(name), index, now, expires_at))
            .await
            .expect("seed channel");
    }
}
