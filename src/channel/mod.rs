//! Channel leases
//!
//! # Overview
//!
//! A channel is a numbered slot leased by one game-server instance:
//!
//! ```text
//! Channel "world-1" ──→ index 3, expires 12:30:00
//! Channel "world-2" ──→ index 1, expires 12:31:10
//! Recycle pool       ──→ {2, 5}      (freed by expiry, reused lowest-first)
//! Sequence "channel" ──→ 5           (high-water mark, never reissued)
//! ```
//!
//! Every index is in exactly one of three states: active (owned by one
//! channel), recyclable (one entry in the pool) or unissued (above the
//! sequence high-water mark).
//!
//! The [`LeaseCoordinator`] is the only mutator of channels and the recycle
//! pool. The [`CleanupScheduler`] drives periodic sweeps through it.

pub mod cleanup;
pub mod coordinator;

pub use cleanup::{CleanupConfig, CleanupScheduler};
pub use coordinator::{LeaseCoordinator, LeaseOutcome, SweepReport};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest accepted channel id, in bytes.
pub const MAX_CHANNEL_ID_LEN: usize = 128;

/// Caller-supplied stable identifier of a channel (usually a game-server name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Validates and wraps a channel id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the id is empty, longer than
    /// [`MAX_CHANNEL_ID_LEN`] bytes, or contains control characters.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidArgument(
                "Channel id cannot be empty".to_string(),
            ));
        }

        if id.len() > MAX_CHANNEL_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "Channel id cannot be longer than {} bytes",
                MAX_CHANNEL_ID_LEN
            )));
        }

        if id.chars().any(char::is_control) {
            return Err(Error::InvalidArgument(
                "Channel id cannot contain control characters".to_string(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One leased slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Primary key
    pub id: ChannelId,
    /// User-visible channel number, unique among active channels
    pub index: u64,
    /// Assigned when the lease is first created, kept across renewals
    pub lease_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Channel {
    /// Creates a fresh lease on `index` valid until `expires_at`.
    pub fn new(id: ChannelId, index: u64, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id,
            index,
            lease_id: Uuid::new_v4(),
            created_at: now,
            expires_at,
        }
    }

    /// A lease is stale once `now` reaches its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A reclaimed index waiting in the recycle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecycleEntry {
    pub index: u64,
}

/// Source of the current time.
///
/// Injected into the coordinator so expiry arithmetic can be driven by tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_validation() {
        assert!(ChannelId::parse("world-1").is_ok());
        assert!(ChannelId::parse("채널 1").is_ok());

        assert!(matches!(
            ChannelId::parse(""),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ChannelId::parse("a".repeat(MAX_CHANNEL_ID_LEN + 1)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ChannelId::parse("bad\nid"),
            Err(Error::InvalidArgument(_))
        ));

        assert!(ChannelId::parse("a".repeat(MAX_CHANNEL_ID_LEN)).is_ok());
    }

    #[test]
    fn test_channel_id_serializes_as_string() {
        let id = ChannelId::parse("ch1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ch1\"");
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Utc::now();
        let id = ChannelId::parse("ch1").unwrap();
        let channel = Channel::new(id, 1, now, now + chrono::Duration::seconds(30));

        assert!(!channel.is_expired(now));
        assert!(channel.is_expired(channel.expires_at));
        assert!(channel.is_expired(channel.expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));
    }
}
