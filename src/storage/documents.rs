//! Document collections shared by every store backend
//!
//! # Architecture
//!
//! ```text
//! Documents
//!   ├─→ channel          id → Channel           (+ index → id secondary index)
//!   ├─→ channel_recycle  BTreeSet<u64>          (pop = smallest)
//!   └─→ counter          name → seq
//! ```
//!
//! Every operation is split into a read-only *plan* step that produces the
//! [`Mutation`]s it would perform, and an [`Documents::apply`] step. Backends
//! persist the planned mutations before applying them, so an I/O failure
//! leaves the in-memory state untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::engine::PushOutcome;
use crate::channel::{Channel, ChannelId, RecycleEntry};
use crate::error::{Error, Result};

/// One atomic change to a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    PutChannel { channel: Channel },
    DeleteChannel { id: ChannelId },
    PushRecycle { entry: RecycleEntry },
    PopRecycle { entry: RecycleEntry },
    SetCounter { name: String, seq: u64 },
}

/// In-memory image of the three collections
#[derive(Debug, Default, Clone)]
pub struct Documents {
    channels: HashMap<ChannelId, Channel>,
    by_index: BTreeMap<u64, ChannelId>,
    recycle: BTreeSet<u64>,
    counters: HashMap<String, u64>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation. Replaying a journal is a sequence of `apply` calls.
    pub fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::PutChannel { channel } => {
                if let Some(previous) = self.channels.insert(channel.id.clone(), channel.clone()) {
                    if previous.index != channel.index {
                        self.by_index.remove(&previous.index);
                    }
                }
                self.by_index.insert(channel.index, channel.id.clone());
            }
            Mutation::DeleteChannel { id } => {
                if let Some(channel) = self.channels.remove(id) {
                    self.by_index.remove(&channel.index);
                }
            }
            Mutation::PushRecycle { entry } => {
                self.recycle.insert(entry.index);
            }
            Mutation::PopRecycle { entry } => {
                self.recycle.remove(&entry.index);
            }
            Mutation::SetCounter { name, seq } => {
                let current = self.counters.entry(name.clone()).or_insert(0);
                *current = (*current).max(*seq);
            }
        }
    }

    pub fn apply_all(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            self.apply(mutation);
        }
    }

    // ----- counter -----

    pub fn current_sequence(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn plan_next_sequence(&self, name: &str) -> Result<(u64, Mutation)> {
        let seq = self
            .current_sequence(name)
            .checked_add(1)
            .ok_or_else(|| Error::Internal(format!("Sequence '{}' exhausted", name)))?;

        Ok((
            seq,
            Mutation::SetCounter {
                name: name.to_string(),
                seq,
            },
        ))
    }

    // ----- channel_recycle -----

    pub fn plan_pop_lowest(&self) -> Option<(u64, Mutation)> {
        self.recycle.first().map(|&index| {
            (
                index,
                Mutation::PopRecycle {
                    entry: RecycleEntry { index },
                },
            )
        })
    }

    pub fn plan_push(&self, index: u64) -> (PushOutcome, Option<Mutation>) {
        if self.recycle.contains(&index) {
            (PushOutcome::AlreadyPresent, None)
        } else {
            (
                PushOutcome::Inserted,
                Some(Mutation::PushRecycle {
                    entry: RecycleEntry { index },
                }),
            )
        }
    }

    pub fn recyclable(&self) -> Vec<u64> {
        self.recycle.iter().copied().collect()
    }

    // ----- channel -----

    pub fn find_by_id(&self, id: &ChannelId) -> Option<Channel> {
        self.channels.get(id).cloned()
    }

    pub fn find_by_index(&self, index: u64) -> Option<Channel> {
        self.by_index
            .get(&index)
            .and_then(|id| self.channels.get(id))
            .cloned()
    }

    pub fn plan_insert(&self, channel: Channel) -> Result<Mutation> {
        if self.channels.contains_key(&channel.id) {
            return Err(Error::DuplicateKey(channel.id.to_string()));
        }

        if let Some(holder) = self.by_index.get(&channel.index) {
            return Err(Error::Internal(format!(
                "Index {} is already leased by '{}'",
                channel.index, holder
            )));
        }

        Ok(Mutation::PutChannel { channel })
    }

    pub fn plan_renew(
        &self,
        id: &ChannelId,
        expires_at: DateTime<Utc>,
    ) -> Option<(Channel, Mutation)> {
        self.channels.get(id).map(|existing| {
            let mut renewed = existing.clone();
            renewed.expires_at = expires_at;
            (
                renewed.clone(),
                Mutation::PutChannel { channel: renewed },
            )
        })
    }

    pub fn find_expired(&self, now: DateTime<Utc>) -> Vec<Channel> {
        self.by_index
            .values()
            .filter_map(|id| self.channels.get(id))
            .filter(|channel| channel.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn plan_delete_many(&self, ids: &[ChannelId], now: DateTime<Utc>) -> Vec<Mutation> {
        let mut seen = BTreeSet::new();
        ids.iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| {
                self.channels
                    .get(*id)
                    .is_some_and(|channel| channel.is_expired(now))
            })
            .map(|id| Mutation::DeleteChannel { id: id.clone() })
            .collect()
    }

    pub fn list_all(&self) -> Vec<Channel> {
        self.by_index
            .values()
            .filter_map(|id| self.channels.get(id))
            .cloned()
            .collect()
    }

    /// The mutations that rebuild this exact state from empty.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut mutations = Vec::with_capacity(
            self.counters.len() + self.recycle.len() + self.channels.len(),
        );

        let mut counters: Vec<_> = self.counters.iter().collect();
        counters.sort();
        mutations.extend(counters.into_iter().map(|(name, &seq)| Mutation::SetCounter {
            name: name.clone(),
            seq,
        }));

        mutations.extend(self.recycle.iter().map(|&index| Mutation::PushRecycle {
            entry: RecycleEntry { index },
        }));

        mutations.extend(
            self.list_all()
                .into_iter()
                .map(|channel| Mutation::PutChannel { channel }),
        );

        mutations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, index: u64, expires_at: DateTime<Utc>) -> Channel {
        Channel::new(ChannelId::parse(id).unwrap(), index, expires_at, expires_at)
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut docs = Documents::new();

        let (first, m) = docs.plan_next_sequence("channel").unwrap();
        docs.apply(&m);
        let (second, m) = docs.plan_next_sequence("channel").unwrap();
        docs.apply(&m);

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(docs.current_sequence("channel"), 2);
        assert_eq!(docs.current_sequence("other"), 0);
    }

    #[test]
    fn test_pop_lowest_first() {
        let mut docs = Documents::new();
        for index in [7, 3, 9] {
            let (_, m) = docs.plan_push(index);
            docs.apply(&m.unwrap());
        }

        let (index, m) = docs.plan_pop_lowest().unwrap();
        assert_eq!(index, 3);
        docs.apply(&m);

        assert_eq!(docs.recyclable(), vec![7, 9]);
    }

    #[test]
    fn test_duplicate_push_is_detected() {
        let mut docs = Documents::new();
        let (outcome, m) = docs.plan_push(4);
        assert_eq!(outcome, PushOutcome::Inserted);
        docs.apply(&m.unwrap());

        let (outcome, m) = docs.plan_push(4);
        assert_eq!(outcome, PushOutcome::AlreadyPresent);
        assert!(m.is_none());
        assert_eq!(docs.recyclable(), vec![4]);
    }

    #[test]
    fn test_insert_rejects_duplicate_id_and_index() {
        let now = Utc::now();
        let mut docs = Documents::new();
        docs.apply(&docs.plan_insert(channel("a", 1, now)).unwrap());

        assert!(matches!(
            docs.plan_insert(channel("a", 2, now)),
            Err(Error::DuplicateKey(_))
        ));
        assert!(matches!(
            docs.plan_insert(channel("b", 1, now)),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_delete_many_spares_renewed_channels() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(1);
        let future = now + chrono::Duration::seconds(60);

        let mut docs = Documents::new();
        docs.apply(&docs.plan_insert(channel("old", 1, past)).unwrap());
        docs.apply(&docs.plan_insert(channel("live", 2, future)).unwrap());

        let ids = vec![
            ChannelId::parse("old").unwrap(),
            ChannelId::parse("old").unwrap(),
            ChannelId::parse("live").unwrap(),
            ChannelId::parse("gone").unwrap(),
        ];
        let planned = docs.plan_delete_many(&ids, now);
        assert_eq!(planned.len(), 1);
        docs.apply_all(&planned);

        assert!(docs.find_by_index(1).is_none());
        assert_eq!(docs.list_all().len(), 1);
    }

    #[test]
    fn test_snapshot_rebuilds_state() {
        let now = Utc::now();
        let mut docs = Documents::new();
        let (_, m) = docs.plan_next_sequence("channel").unwrap();
        docs.apply(&m);
        docs.apply(&docs.plan_push(5).1.unwrap());
        docs.apply(&docs.plan_insert(channel("a", 1, now)).unwrap());

        let mut rebuilt = Documents::new();
        rebuilt.apply_all(&docs.snapshot());

        assert_eq!(rebuilt.current_sequence("channel"), 1);
        assert_eq!(rebuilt.recyclable(), vec![5]);
        assert_eq!(rebuilt.list_all(), docs.list_all());
    }
}
