pub mod codec;
pub mod replicator;
pub mod scheduler;

pub use replicator::{DatasetRestore, RestoreReport, SaveReport, SnapshotReplicator};
pub use scheduler::{BackgroundSaver, SaveScheduler, SaveStats, SaveTrigger, spawn_background_saver};
