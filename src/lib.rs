// channel-lease - Channel lease & index recycling service
// Hands out small, dense channel numbers to game-server instances

#![warn(rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod metrics;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use channel::{
    Channel, ChannelId, CleanupConfig, CleanupScheduler, Clock, LeaseCoordinator, LeaseOutcome,
    ManualClock, SweepReport, SystemClock,
};
pub use config::AppConfig;
pub use metrics::LeaseMetrics;
pub use storage::{
    ChannelStore, JournalStore, MemoryStore, PushOutcome, RecyclePool, SequenceAllocator, Stores,
};

/// Error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Duplicate key: {0}")]
        DuplicateKey(String),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Deadline exceeded: {0}")]
        Timeout(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// True for the transient I/O class of failures that surface as HTTP 500.
        pub fn is_storage(&self) -> bool {
            matches!(
                self,
                Error::Storage(_) | Error::Timeout(_) | Error::Serialization(_) | Error::Internal(_)
            )
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_storage_classification() {
        assert!(Error::Storage("io".into()).is_storage());
        assert!(Error::Timeout("slow".into()).is_storage());
        assert!(!Error::NotFound("ch1".into()).is_storage());
        assert!(!Error::DuplicateKey("ch1".into()).is_storage());
        assert!(!Error::InvalidArgument("".into()).is_storage());
    }
}
