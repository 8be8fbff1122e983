//! Mapping from community members to storage keys.
//!
//! Records were once keyed by display name; they are now keyed by the
//! member's stable id. Name-keyed records are moved to the id key the first
//! time the member is touched.

use crate::core::{CanonicalKey, Principal, Result};
use crate::storage::{Dataset, RecordStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Key a principal's record lives under. Pure and deterministic.
    pub fn canonical_key(&self, principal: &Principal) -> CanonicalKey {
        CanonicalKey::new(principal.id.clone())
    }

    fn prefixed_canonical(&self, principal: &Principal, prefix: &str) -> String {
        format!("{}{}", prefix, principal.id)
    }

    /// Legacy key variants in lookup order: each alias as written, then trimmed.
    pub fn legacy_keys(&self, principal: &Principal, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for alias in &principal.aliases {
            for variant in [alias.as_str(), alias.trim()] {
                if variant.trim().is_empty() || variant == principal.id {
                    continue;
                }
                let key = format!("{}{}", prefix, variant);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// The key currently holding this principal's record, canonical first.
    pub fn resolve_existing_key(
        &self,
        principal: &Principal,
        dataset: &Dataset,
        prefix: &str,
    ) -> Option<String> {
        let canonical = self.prefixed_canonical(principal, prefix);
        if dataset.contains(&canonical) {
            return Some(canonical);
        }
        self.legacy_keys(principal, prefix)
            .into_iter()
            .find(|key| dataset.contains(key))
    }

    /// Moves a legacy record to the canonical key.
    ///
    /// Returns `true` only when a record was moved. Once the canonical key
    /// exists this is a no-op, so repeated calls leave the dataset unchanged.
    pub fn migrate(&self, principal: &Principal, dataset: &mut Dataset, prefix: &str) -> bool {
        let canonical = self.prefixed_canonical(principal, prefix);
        if dataset.contains(&canonical) {
            return false;
        }

        let legacy = self.legacy_keys(principal, prefix);
        let Some(source) = legacy.iter().find(|key| dataset.contains(key.as_str())) else {
            return false;
        };

        let Some(value) = dataset.remove(source) else {
            return false;
        };
        dataset.insert(canonical.clone(), value);
        debug!(from = %source, to = %canonical, "migrated legacy record");

        let stale = self.purge_legacy(principal, dataset, prefix);
        if stale > 0 {
            warn!(
                principal = %principal.id,
                stale,
                "discarded duplicate legacy records after migration"
            );
        }
        true
    }

    /// Deletes every legacy variant still present. Returns how many were removed.
    pub fn purge_legacy(&self, principal: &Principal, dataset: &mut Dataset, prefix: &str) -> usize {
        self.legacy_keys(principal, prefix)
            .iter()
            .filter(|key| dataset.remove(key).is_some())
            .count()
    }

    /// Runs [`migrate`](Self::migrate) over every principal-keyed dataset.
    ///
    /// Returns the names of the datasets where a record was moved.
    pub fn migrate_all(&self, principal: &Principal, store: &RecordStore) -> Result<Vec<String>> {
        let mut migrated = Vec::new();
        for spec in store.specs().iter().filter(|spec| spec.principal_keyed) {
            let moved = store.write(spec.name(), |dataset| self.migrate(principal, dataset, ""))?;
            if moved {
                migrated.push(spec.name().to_string());
            }
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::default_datasets;
    use crate::storage::registry::{BALANCES, BANK, POLLS};
    use serde_json::json;

    fn alice() -> Principal {
        Principal::new("111").with_alias("Alice ")
    }

    #[test]
    fn test_canonical_key_is_the_id() {
        let resolver = IdentityResolver::new();
        assert_eq!(resolver.canonical_key(&alice()).as_str(), "111");
    }

    #[test]
    fn test_legacy_keys_include_trimmed_variant() {
        let resolver = IdentityResolver::new();
        assert_eq!(resolver.legacy_keys(&alice(), ""), vec!["Alice ", "Alice"]);
        assert_eq!(
            resolver.legacy_keys(&alice(), "duel:"),
            vec!["duel:Alice ", "duel:Alice"]
        );
    }

    #[test]
    fn test_legacy_keys_skip_blank_and_id_aliases() {
        let resolver = IdentityResolver::new();
        let principal = Principal::new("7").with_alias("  ").with_alias("7");
        assert!(resolver.legacy_keys(&principal, "").is_empty());
    }

    #[test]
    fn test_resolve_prefers_canonical() {
        let resolver = IdentityResolver::new();
        let mut dataset = Dataset::default();
        dataset.insert("Alice", json!(1));
        assert_eq!(
            resolver.resolve_existing_key(&alice(), &dataset, ""),
            Some("Alice".to_string())
        );

        dataset.insert("111", json!(2));
        assert_eq!(
            resolver.resolve_existing_key(&alice(), &dataset, ""),
            Some("111".to_string())
        );
    }

    #[test]
    fn test_migrate_moves_legacy_record() {
        let resolver = IdentityResolver::new();
        let mut dataset = Dataset::default();
        dataset.insert("Alice", json!(50));

        let principal = Principal::new("111").with_alias("Alice");
        assert!(resolver.migrate(&principal, &mut dataset, ""));
        assert_eq!(dataset.get("111"), Some(&json!(50)));
        assert!(!dataset.contains("Alice"));
    }

    #[test]
    fn test_migrate_is_noop_when_canonical_exists() {
        let resolver = IdentityResolver::new();
        let mut dataset = Dataset::default();
        dataset.insert("111", json!(1));
        dataset.insert("Alice", json!(2));

        assert!(!resolver.migrate(&alice(), &mut dataset, ""));
        assert_eq!(dataset.get("111"), Some(&json!(1)));
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_migrate_with_prefix() {
        let resolver = IdentityResolver::new();
        let mut dataset = Dataset::default();
        dataset.insert("daily:Alice", json!(1_700_000_000_000u64));

        assert!(resolver.migrate(&alice(), &mut dataset, "daily:"));
        assert!(dataset.contains("daily:111"));
        assert!(!dataset.contains("daily:Alice"));
    }

    #[test]
    fn test_migrate_all_skips_datasets_not_keyed_by_principal() {
        let resolver = IdentityResolver::new();
        let store = RecordStore::new(default_datasets());
        store.set_raw(BALANCES, "Alice", json!(10)).unwrap();
        store.set_raw(BANK, "Alice ", json!({"deposit": 5})).unwrap();
        store.set_raw(POLLS, "Alice", json!({"question": "?"})).unwrap();

        let migrated = resolver.migrate_all(&alice(), &store).unwrap();
        assert_eq!(migrated, vec![BALANCES.to_string(), BANK.to_string()]);
        assert_eq!(store.get_raw(POLLS, "Alice").unwrap(), Some(json!({"question": "?"})));
        assert_eq!(store.get_raw(BANK, "111").unwrap(), Some(json!({"deposit": 5})));
    }
}
