use super::registry::DatasetSpec;
use crate::core::{LedgerError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

pub type Records = BTreeMap<String, Value>;

/// One dataset's records plus an in-process revision counter.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Records,
    revision: u64,
}

impl Dataset {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.revision += 1;
        self.records.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    /// Replaces every record with `records`.
    pub fn replace(&mut self, records: Records) {
        self.revision += 1;
        self.records = records;
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl From<Records> for Dataset {
    fn from(records: Records) -> Self {
        Self {
            records,
            revision: 0,
        }
    }
}

/// All datasets of one process, fully loaded in memory.
///
/// The set of datasets is fixed at construction; each dataset has its own lock
/// so that readers of one never wait on writers of another.
pub struct RecordStore {
    specs: Vec<DatasetSpec>,
    datasets: HashMap<String, Arc<RwLock<Dataset>>>,
}

impl RecordStore {
    pub fn new(specs: Vec<DatasetSpec>) -> Self {
        let datasets = specs
            .iter()
            .map(|spec| {
                (
                    spec.name().to_string(),
                    Arc::new(RwLock::new(Dataset::default())),
                )
            })
            .collect();
        Self { specs, datasets }
    }

    pub fn specs(&self) -> &[DatasetSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Result<&DatasetSpec> {
        self.specs
            .iter()
            .find(|spec| spec.name() == name)
            .ok_or_else(|| LedgerError::UnknownDataset(name.to_string()))
    }

    /// Dataset names in registration order.
    pub fn dataset_names(&self) -> Vec<String> {
        self.specs.iter().map(|spec| spec.name().to_string()).collect()
    }

    pub fn contains_dataset(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    /// Handle on a dataset for callers that need several operations under one lock.
    pub fn get_dataset(&self, name: &str) -> Result<Arc<RwLock<Dataset>>> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownDataset(name.to_string()))
    }

    pub fn read<R>(&self, name: &str, f: impl FnOnce(&Dataset) -> R) -> Result<R> {
        let handle = self.get_dataset(name)?;
        let dataset = handle.read()?;
        Ok(f(&dataset))
    }

    pub fn write<R>(&self, name: &str, f: impl FnOnce(&mut Dataset) -> R) -> Result<R> {
        let handle = self.get_dataset(name)?;
        let mut dataset = handle.write()?;
        Ok(f(&mut dataset))
    }

    pub fn get_raw(&self, name: &str, key: &str) -> Result<Option<Value>> {
        self.read(name, |dataset| dataset.get(key).cloned())
    }

    pub fn set_raw(&self, name: &str, key: impl Into<String>, value: Value) -> Result<Option<Value>> {
        self.write(name, |dataset| dataset.insert(key, value))
    }

    pub fn remove_raw(&self, name: &str, key: &str) -> Result<Option<Value>> {
        self.write(name, |dataset| dataset.remove(key))
    }

    /// Overwrites a dataset's whole state, as a restore does.
    pub fn replace(&self, name: &str, records: Records) -> Result<()> {
        self.write(name, |dataset| dataset.replace(records))
    }

    /// Copy of a dataset's records, taken under its read lock.
    pub fn export(&self, name: &str) -> Result<Records> {
        self.read(name, |dataset| dataset.records().clone())
    }

    pub fn len(&self, name: &str) -> Result<usize> {
        self.read(name, Dataset::len)
    }

    pub fn revision(&self, name: &str) -> Result<u64> {
        self.read(name, Dataset::revision)
    }
}
