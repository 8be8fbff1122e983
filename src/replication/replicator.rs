use super::codec;
use crate::config::LedgerConfig;
use crate::core::{FeedReference, LedgerError, LoadRecord, Result};
use crate::feed::{FeedPayload, FeedPost, FetchedPayload, PublishReceipt, SnapshotFeed, call_with_retry, latest_for};
use crate::storage::{RecordStore, Records};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Outcome of a full restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Datasets installed from a snapshot.
    pub restored: Vec<String>,
    /// Datasets with no snapshot in the scanned history; they start empty.
    pub missing: Vec<String>,
    /// Datasets whose snapshot did not decode; they start empty.
    pub corrupt: Vec<String>,
    /// Datasets that could not be fetched; left untouched and not published.
    pub failed: Vec<String>,
}

/// Outcome of one save cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub published: Vec<String>,
    /// Datasets skipped because another instance published them first.
    pub conflicts: Vec<String>,
    /// Datasets whose publish call failed.
    pub failed: Vec<String>,
    /// Datasets held back because their last restore failed.
    pub unrestored: Vec<String>,
    /// Number of feed posts made.
    pub publishes: usize,
}

impl SaveReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty() && self.unrestored.is_empty()
    }
}

impl fmt::Display for SaveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published {} dataset(s) in {} post(s)",
            self.published.len(),
            self.publishes
        )?;
        if !self.conflicts.is_empty() {
            write!(f, "; skipped newer on feed: {}", self.conflicts.join(", "))?;
        }
        if !self.failed.is_empty() {
            write!(f, "; failed: {}", self.failed.join(", "))?;
        }
        if !self.unrestored.is_empty() {
            write!(f, "; not restored yet: {}", self.unrestored.join(", "))?;
        }
        Ok(())
    }
}

/// Outcome of restoring a single dataset on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRestore {
    pub dataset: String,
    pub reference: FeedReference,
    pub published_at: DateTime<Utc>,
    pub records: usize,
}

enum RestoreOutcome {
    Restored,
    Missing,
    Corrupt,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    load_records: HashMap<String, LoadRecord>,
    /// Unrestored datasets and their revision when they were marked.
    unrestored: HashMap<String, u64>,
}

/// Publishes datasets to the feed and loads them back.
pub struct SnapshotReplicator {
    store: Arc<RecordStore>,
    feed: Arc<dyn SnapshotFeed>,
    config: LedgerConfig,
    books: Mutex<Bookkeeping>,
}

impl SnapshotReplicator {
    pub fn new(store: Arc<RecordStore>, feed: Arc<dyn SnapshotFeed>, config: LedgerConfig) -> Self {
        Self {
            store,
            feed,
            config,
            books: Mutex::new(Bookkeeping::default()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Snapshot this process last consumed or published for `dataset`.
    pub fn load_record(&self, dataset: &str) -> Result<Option<LoadRecord>> {
        Ok(self.books.lock()?.load_records.get(dataset).cloned())
    }

    /// Datasets whose last restore attempt failed.
    pub fn unrestored(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.books.lock()?.unrestored.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn payloads_per_publish(&self) -> usize {
        self.config
            .max_payloads_per_publish
            .min(self.feed.max_payloads())
            .max(1)
    }

    /// Loads the newest snapshot of every dataset from the feed.
    ///
    /// Fails only if the feed history cannot be read at all, in which case
    /// every dataset is held back from saves until a later scan restores it.
    /// Per-dataset problems are logged and reported.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let posts = match self.scan().await {
            Ok(posts) => posts,
            Err(err) => {
                for name in self.store.dataset_names() {
                    self.mark_unrestored(&name)?;
                }
                return Err(err);
            }
        };
        let names = self.store.dataset_names();
        let outcomes = join_all(names.iter().map(|name| self.restore_dataset(name, &posts))).await;

        let mut report = RestoreReport::default();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(RestoreOutcome::Restored) => report.restored.push(name),
                Ok(RestoreOutcome::Missing) => report.missing.push(name),
                Ok(RestoreOutcome::Corrupt) => report.corrupt.push(name),
                Err(err) => {
                    error!(dataset = %name, error = %err, "restore failed; dataset held back from saves");
                    self.mark_unrestored(&name)?;
                    report.failed.push(name);
                }
            }
        }

        info!(
            restored = report.restored.len(),
            missing = report.missing.len(),
            corrupt = report.corrupt.len(),
            failed = report.failed.len(),
            "restore finished"
        );
        Ok(report)
    }

    async fn restore_dataset(&self, name: &str, posts: &[FeedPost]) -> Result<RestoreOutcome> {
        let Some(post) = latest_for(posts, name) else {
            self.store.replace(name, Records::new())?;
            let mut books = self.books.lock()?;
            books.load_records.remove(name);
            books.unrestored.remove(name);
            debug!(dataset = %name, "no snapshot on feed; starting empty");
            return Ok(RestoreOutcome::Missing);
        };

        let fetched = self.fetch(&post.reference, name).await?;
        let (records, outcome) = match codec::decode(name, &fetched.bytes) {
            Ok(records) => (records, RestoreOutcome::Restored),
            Err(err) => {
                warn!(
                    dataset = %name,
                    reference = %post.reference,
                    error = %err,
                    "snapshot is unreadable; starting empty and leaving it on the feed"
                );
                (Records::new(), RestoreOutcome::Corrupt)
            }
        };

        self.store.replace(name, records)?;
        let mut books = self.books.lock()?;
        books
            .load_records
            .insert(name.to_string(), LoadRecord::new(post.timestamp, post.reference.clone()));
        books.unrestored.remove(name);
        Ok(outcome)
    }

    /// Restores one dataset, from the newest snapshot or a pinned reference.
    ///
    /// Unlike [`restore`](Self::restore), an unreadable payload is an error and
    /// leaves local state as it was. The load record is set to the newest
    /// snapshot on the feed, so the next save publishes the restored state.
    pub async fn restore_one(&self, name: &str, reference: Option<&FeedReference>) -> Result<DatasetRestore> {
        self.store.spec(name)?;
        let posts = self.scan().await?;
        let latest = latest_for(&posts, name).map(|post| LoadRecord::new(post.timestamp, post.reference.clone()));

        let source = match (reference, latest.as_ref()) {
            (Some(reference), _) => reference.clone(),
            (None, Some(latest)) => latest.reference.clone(),
            (None, None) => {
                return Err(LedgerError::SnapshotNotFound {
                    dataset: name.to_string(),
                    reference: None,
                });
            }
        };

        let fetched = self.fetch(&source, name).await?;
        let records = codec::decode(name, &fetched.bytes)?;
        let count = records.len();
        self.store.replace(name, records)?;

        let load_record = latest.unwrap_or_else(|| LoadRecord::new(fetched.timestamp, fetched.reference.clone()));
        let mut books = self.books.lock()?;
        books.load_records.insert(name.to_string(), load_record);
        books.unrestored.remove(name);

        info!(dataset = %name, reference = %fetched.reference, records = count, "dataset restored on request");
        Ok(DatasetRestore {
            dataset: name.to_string(),
            reference: fetched.reference,
            published_at: fetched.timestamp,
            records: count,
        })
    }

    /// Publishes every dataset that no other instance has published since
    /// this process last read or wrote it.
    pub async fn save(&self) -> Result<SaveReport> {
        let posts = self.scan().await?;
        self.retry_unrestored(&posts).await;

        let mut report = SaveReport::default();
        let mut payloads = Vec::new();
        for name in self.store.dataset_names() {
            if self.books.lock()?.unrestored.contains_key(&name) {
                report.unrestored.push(name);
                continue;
            }

            if let Some(post) = latest_for(&posts, &name) {
                let latest = LoadRecord::new(post.timestamp, post.reference.clone());
                if self.is_conflict(&name, &latest)? {
                    warn!(
                        dataset = %name,
                        reference = %latest.reference,
                        "feed holds a newer snapshot from another instance; skipping this cycle"
                    );
                    self.books.lock()?.load_records.insert(name.clone(), latest);
                    report.conflicts.push(name);
                    continue;
                }
            }

            let records = self.store.export(&name)?;
            payloads.push(FeedPayload::new(name.clone(), codec::encode(&name, records)?));
        }

        let batch_size = self.payloads_per_publish();
        while !payloads.is_empty() {
            let batch: Vec<FeedPayload> = payloads.drain(..batch_size.min(payloads.len())).collect();
            let names: Vec<String> = batch.iter().map(|payload| payload.name.clone()).collect();

            match self.publish(batch).await {
                Ok(receipt) => {
                    let mut books = self.books.lock()?;
                    for name in &names {
                        books.load_records.insert(
                            name.clone(),
                            LoadRecord::new(receipt.timestamp, receipt.reference.clone()),
                        );
                    }
                    debug!(reference = %receipt.reference, datasets = ?names, "snapshot batch published");
                    report.publishes += 1;
                    report.published.extend(names);
                }
                Err(err) => {
                    error!(datasets = ?names, error = %err, "snapshot batch publish failed");
                    report.failed.extend(names);
                }
            }
        }

        Ok(report)
    }

    /// Newer-than-loaded, or a snapshot this process never saw.
    fn is_conflict(&self, name: &str, latest: &LoadRecord) -> Result<bool> {
        let books = self.books.lock()?;
        Ok(match books.load_records.get(name) {
            Some(loaded) => {
                latest.timestamp > loaded.timestamp
                    || (latest.timestamp == loaded.timestamp && latest.reference != loaded.reference)
            }
            None => true,
        })
    }

    fn mark_unrestored(&self, name: &str) -> Result<()> {
        let revision = self.store.revision(name)?;
        self.books
            .lock()?
            .unrestored
            .entry(name.to_string())
            .or_insert(revision);
        Ok(())
    }

    async fn retry_unrestored(&self, posts: &[FeedPost]) {
        let pending = match self.unrestored() {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "cannot read restore bookkeeping");
                return;
            }
        };
        for name in pending {
            match self.late_restore(&name, posts).await {
                Ok(kept) => info!(dataset = %name, local_records_kept = kept, "late restore succeeded"),
                Err(err) => warn!(dataset = %name, error = %err, "late restore failed"),
            }
        }
    }

    /// Restores a dataset that missed the startup restore.
    ///
    /// The process kept serving writes meanwhile, so local records written
    /// since the dataset was marked are laid over the feed's snapshot
    /// instead of being replaced by it. Returns how many local records were kept.
    async fn late_restore(&self, name: &str, posts: &[FeedPost]) -> Result<usize> {
        let baseline = match self.books.lock()?.unrestored.get(name) {
            Some(revision) => *revision,
            None => return Ok(0),
        };

        let Some(post) = latest_for(posts, name) else {
            let kept = self.store.len(name)?;
            let mut books = self.books.lock()?;
            books.load_records.remove(name);
            books.unrestored.remove(name);
            debug!(dataset = %name, "no snapshot on feed; keeping local records");
            return Ok(kept);
        };

        let fetched = self.fetch(&post.reference, name).await?;
        let snapshot = match codec::decode(name, &fetched.bytes) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    dataset = %name,
                    reference = %post.reference,
                    error = %err,
                    "snapshot is unreadable; keeping local records and leaving it on the feed"
                );
                Records::new()
            }
        };

        let (kept, overridden) = self.store.write(name, |dataset| {
            if dataset.revision() == baseline {
                dataset.replace(snapshot);
                return (0, 0);
            }
            let mut merged = snapshot;
            let mut kept = 0;
            let mut overridden = 0;
            for (key, value) in dataset.records() {
                kept += 1;
                if merged.insert(key.clone(), value.clone()).is_some() {
                    overridden += 1;
                }
            }
            dataset.replace(merged);
            (kept, overridden)
        })?;

        if overridden > 0 {
            warn!(
                dataset = %name,
                reference = %post.reference,
                overridden,
                "local writes made while unrestored replace records from the feed"
            );
        }

        let mut books = self.books.lock()?;
        books
            .load_records
            .insert(name.to_string(), LoadRecord::new(post.timestamp, post.reference.clone()));
        books.unrestored.remove(name);
        Ok(kept)
    }

    async fn scan(&self) -> Result<Vec<FeedPost>> {
        let limit = self.config.history_scan_limit;
        call_with_retry(&self.config.retry, self.config.request_timeout, "list feed history", || {
            self.feed.list_recent(limit)
        })
        .await
    }

    async fn fetch(&self, reference: &FeedReference, name: &str) -> Result<FetchedPayload> {
        call_with_retry(&self.config.retry, self.config.request_timeout, "fetch snapshot", || {
            self.feed.fetch(reference, name)
        })
        .await
    }

    async fn publish(&self, batch: Vec<FeedPayload>) -> Result<PublishReceipt> {
        call_with_retry(&self.config.retry, self.config.request_timeout, "publish snapshot", || {
            self.feed.publish(batch.clone())
        })
        .await
    }
}
