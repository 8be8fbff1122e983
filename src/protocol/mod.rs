//! Read-modify-write access to per-principal records.
//!
//! Every access first migrates any legacy record of the principal to its
//! canonical key, so callers never see the key scheme. Writers on the same
//! key are serialized by a per-key async lock that is held from the read to
//! the write, including across any await inside an async update.

pub mod locks;

use crate::core::{CanonicalKey, LedgerError, Principal, Result};
use crate::identity::IdentityResolver;
use crate::storage::RecordStore;
use locks::KeyLocks;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::{Future, ready};
use std::sync::Arc;

/// Where a principal's record lives: a dataset and an optional key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    pub dataset: &'a str,
    pub prefix: &'a str,
}

impl<'a> Slot<'a> {
    pub fn prefixed(dataset: &'a str, prefix: &'a str) -> Self {
        Self { dataset, prefix }
    }
}

impl<'a> From<&'a str> for Slot<'a> {
    fn from(dataset: &'a str) -> Self {
        Self { dataset, prefix: "" }
    }
}

pub struct UpdateProtocol {
    store: Arc<RecordStore>,
    resolver: IdentityResolver,
    locks: KeyLocks,
}

impl UpdateProtocol {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            resolver: IdentityResolver::new(),
            locks: KeyLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Stored value for `principal`, or `default` when there is none.
    pub fn get<'a, T>(&self, principal: &Principal, slot: impl Into<Slot<'a>>, default: T) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let slot = slot.into();
        match self.load(principal, slot)? {
            Some(value) => decode(slot.dataset, value),
            None => Ok(default),
        }
    }

    /// Stored value, falling back to the dataset's registered default record.
    pub fn get_or_default(&self, principal: &Principal, dataset: &str) -> Result<Value> {
        let default = self.store.spec(dataset)?.default_value();
        self.get(principal, dataset, default)
    }

    /// Writes `f(existing or default)` under the canonical key.
    pub async fn update<'a, T, F>(
        &self,
        principal: &Principal,
        slot: impl Into<Slot<'a>>,
        default: T,
        f: F,
    ) -> Result<CanonicalKey>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.update_async(principal, slot, default, |current| ready(Ok(f(current))))
            .await
    }

    /// Like [`update`](Self::update), but `f` may reject the change.
    ///
    /// On `Err` the record is left untouched and the error is returned.
    pub async fn try_update<'a, T, F>(
        &self,
        principal: &Principal,
        slot: impl Into<Slot<'a>>,
        default: T,
        f: F,
    ) -> Result<CanonicalKey>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> Result<T>,
    {
        self.update_async(principal, slot, default, |current| ready(f(current)))
            .await
    }

    /// Read-modify-write where computing the new value needs to await.
    ///
    /// The key lock is held for the whole call, so a concurrent update of
    /// the same key waits instead of overwriting this one.
    pub async fn update_async<'a, T, F, Fut>(
        &self,
        principal: &Principal,
        slot: impl Into<Slot<'a>>,
        default: T,
        f: F,
    ) -> Result<CanonicalKey>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = slot.into();
        let key = self.slot_key(principal, slot);
        let _guard = self.locks.acquire(slot.dataset, &key).await?;

        let current = match self.load(principal, slot)? {
            Some(value) => decode(slot.dataset, value)?,
            None => default,
        };
        let next = serde_json::to_value(f(current).await?)?;
        self.commit(principal, slot, &key, next)?;

        Ok(CanonicalKey::new(key))
    }

    /// Overwrites the principal's record regardless of its current value.
    pub async fn set<'a, T>(&self, principal: &Principal, slot: impl Into<Slot<'a>>, value: T) -> Result<CanonicalKey>
    where
        T: Serialize,
    {
        let slot = slot.into();
        let key = self.slot_key(principal, slot);
        let _guard = self.locks.acquire(slot.dataset, &key).await?;
        self.commit(principal, slot, &key, serde_json::to_value(value)?)?;
        Ok(CanonicalKey::new(key))
    }

    /// Deletes the principal's record under every key it may live under.
    pub async fn remove<'a>(&self, principal: &Principal, slot: impl Into<Slot<'a>>) -> Result<Option<Value>> {
        let slot = slot.into();
        let key = self.slot_key(principal, slot);
        let _guard = self.locks.acquire(slot.dataset, &key).await?;
        self.store.write(slot.dataset, |dataset| {
            self.resolver.migrate(principal, dataset, slot.prefix);
            let removed = dataset.remove(&key);
            self.resolver.purge_legacy(principal, dataset, slot.prefix);
            removed
        })
    }

    fn slot_key(&self, principal: &Principal, slot: Slot<'_>) -> String {
        format!("{}{}", slot.prefix, self.resolver.canonical_key(principal))
    }

    /// Migrates, then reads whatever key the record resolves to.
    ///
    /// Legacy entries shadowed by an existing canonical record are dropped
    /// here too, so a read never leaves two records for one principal.
    fn load(&self, principal: &Principal, slot: Slot<'_>) -> Result<Option<Value>> {
        self.store.write(slot.dataset, |dataset| {
            self.resolver.migrate(principal, dataset, slot.prefix);
            self.resolver.purge_legacy(principal, dataset, slot.prefix);
            self.resolver
                .resolve_existing_key(principal, dataset, slot.prefix)
                .and_then(|key| dataset.get(&key).cloned())
        })
    }

    fn commit(&self, principal: &Principal, slot: Slot<'_>, key: &str, value: Value) -> Result<()> {
        self.store.write(slot.dataset, |dataset| {
            dataset.insert(key, value);
            self.resolver.purge_legacy(principal, dataset, slot.prefix);
        })
    }
}

fn decode<T: DeserializeOwned>(dataset: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| {
        LedgerError::Serialization(format!("record in '{}' has unexpected shape: {}", dataset, err))
    })
}
