//! Document store
//!
//! One implementation of [`SequenceAllocator`], [`RecyclePool`] and
//! [`ChannelStore`] over [`Documents`], generic over how mutations are made
//! durable. All three collections share one lock, so each trait method is a
//! single atomic operation the way a find-and-modify is in a document
//! database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::documents::{Documents, Mutation};
use super::engine::{ChannelStore, PushOutcome, RecyclePool, SequenceAllocator};
use crate::channel::{Channel, ChannelId};
use crate::error::Result;

/// Makes planned mutations durable before they are applied in memory.
pub trait Persist: Send + 'static {
    fn persist(&mut self, mutations: &[Mutation]) -> Result<()>;
}

/// No durability: state lives as long as the process.
#[derive(Debug, Default)]
pub struct Volatile;

impl Persist for Volatile {
    fn persist(&mut self, _mutations: &[Mutation]) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct Inner<P> {
    pub(crate) docs: Documents,
    pub(crate) persist: P,
}

/// Channel, recycle and counter collections behind one lock
pub struct DocumentStore<P> {
    pub(crate) inner: Arc<Mutex<Inner<P>>>,
}

impl<P> Clone for DocumentStore<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P> std::fmt::Debug for DocumentStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish()
    }
}

/// In-memory store, used by tests and the `memory` backend
pub type MemoryStore = DocumentStore<Volatile>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_persist(Documents::new(), Volatile)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Persist> DocumentStore<P> {
    pub(crate) fn with_persist(docs: Documents, persist: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { docs, persist })),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Documents) -> T) -> T {
        f(&self.inner.lock().docs)
    }

    /// Plan against current state, persist, then apply - all under the lock.
    fn commit<T>(
        &self,
        plan: impl FnOnce(&Documents) -> Result<(T, Vec<Mutation>)>,
    ) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (value, mutations) = plan(&inner.docs)?;
        if !mutations.is_empty() {
            inner.persist.persist(&mutations)?;
            inner.docs.apply_all(&mutations);
        }

        Ok(value)
    }

    /// Number of stored channels
    pub fn len(&self) -> usize {
        self.read(|docs| docs.list_all().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<P: Persist> SequenceAllocator for DocumentStore<P> {
    #[instrument(skip(self), level = "debug")]
    async fn next_sequence(&self, name: &str) -> Result<u64> {
        let seq = self.commit(|docs| {
            let (seq, mutation) = docs.plan_next_sequence(name)?;
            Ok((seq, vec![mutation]))
        })?;
        debug!(sequence = name, seq, "Issued sequence value");
        Ok(seq)
    }

    async fn current_sequence(&self, name: &str) -> Result<u64> {
        Ok(self.read(|docs| docs.current_sequence(name)))
    }
}

#[async_trait]
impl<P: Persist> RecyclePool for DocumentStore<P> {
    #[instrument(skip(self), level = "debug")]
    async fn pop_lowest(&self) -> Result<Option<u64>> {
        self.commit(|docs| {
            Ok(match docs.plan_pop_lowest() {
                Some((index, mutation)) => (Some(index), vec![mutation]),
                None => (None, Vec::new()),
            })
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn push(&self, index: u64) -> Result<PushOutcome> {
        self.commit(|docs| {
            let (outcome, mutation) = docs.plan_push(index);
            Ok((outcome, mutation.into_iter().collect()))
        })
    }

    async fn recyclable(&self) -> Result<Vec<u64>> {
        Ok(self.read(Documents::recyclable))
    }
}

#[async_trait]
impl<P: Persist> ChannelStore for DocumentStore<P> {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>> {
        Ok(self.read(|docs| docs.find_by_id(id)))
    }

    async fn find_by_index(&self, index: u64) -> Result<Option<Channel>> {
        Ok(self.read(|docs| docs.find_by_index(index)))
    }

    #[instrument(skip(self, channel), fields(channel_id = %channel.id, index = channel.index), level = "debug")]
    async fn insert(&self, channel: Channel) -> Result<()> {
        self.commit(|docs| Ok(((), vec![docs.plan_insert(channel)?])))
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew_expiry(
        &self,
        id: &ChannelId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Channel>> {
        self.commit(|docs| {
            Ok(match docs.plan_renew(id, expires_at) {
                Some((channel, mutation)) => (Some(channel), vec![mutation]),
                None => (None, Vec::new()),
            })
        })
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Channel>> {
        Ok(self.read(|docs| docs.find_expired(now)))
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()), level = "debug")]
    async fn delete_many(&self, ids: &[ChannelId], now: DateTime<Utc>) -> Result<u64> {
        self.commit(|docs| {
            let mutations = docs.plan_delete_many(ids, now);
            Ok((mutations.len() as u64, mutations))
        })
    }

    async fn list_all(&self) -> Result<Vec<Channel>> {
        Ok(self.read(Documents::list_all))
    }
}
