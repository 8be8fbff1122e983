// ============================================================================
// GuildLedger Library
// ============================================================================

pub mod admin;
pub mod config;
pub mod core;
pub mod feed;
pub mod identity;
pub mod ledger;
pub mod protocol;
pub mod replication;
pub mod service;
pub mod storage;

// Re-export main types for convenience
pub use admin::{AdminCommand, AdminConsole};
pub use config::{LedgerConfig, RetryPolicy};
pub use core::{CanonicalKey, FeedReference, LedgerError, LoadRecord, Principal, Result};
pub use feed::{DiscordFeed, InMemoryFeed, SnapshotFeed};
pub use identity::IdentityResolver;
pub use ledger::CurrencyLedger;
pub use protocol::{Slot, UpdateProtocol};
pub use replication::{RestoreReport, SaveReport, SaveScheduler, SaveTrigger, SnapshotReplicator};
pub use service::LedgerService;
pub use storage::{DatasetSpec, RecordStore};
