pub mod memory;
pub mod registry;

pub use memory::{Dataset, RecordStore, Records};
pub use registry::{DEFAULT_DATASETS, DatasetSpec, default_datasets};
