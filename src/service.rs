use crate::admin::AdminConsole;
use crate::config::LedgerConfig;
use crate::core::Result;
use crate::feed::SnapshotFeed;
use crate::ledger::CurrencyLedger;
use crate::protocol::UpdateProtocol;
use crate::replication::{
    BackgroundSaver, RestoreReport, SaveReport, SaveScheduler, SnapshotReplicator, spawn_background_saver,
};
use crate::storage::RecordStore;
use std::sync::Arc;
use tracing::{error, info};

/// One running ledger process: the store, its replication and the admin console.
pub struct LedgerService {
    config: LedgerConfig,
    protocol: Arc<UpdateProtocol>,
    replicator: Arc<SnapshotReplicator>,
    scheduler: Arc<SaveScheduler>,
    admin: AdminConsole,
    restore_report: Option<RestoreReport>,
    saver: Option<BackgroundSaver>,
}

impl LedgerService {
    /// Builds the store, restores it from the feed and starts the background saver.
    ///
    /// A failed restore is logged, not returned; the affected datasets are
    /// retried on each save and not published until they load.
    pub async fn open(config: LedgerConfig, feed: Arc<dyn SnapshotFeed>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(RecordStore::new(config.datasets.clone()));
        let protocol = Arc::new(UpdateProtocol::new(Arc::clone(&store)));
        let replicator = Arc::new(SnapshotReplicator::new(store, feed, config.clone()));
        let scheduler = SaveScheduler::new(Arc::clone(&replicator), config.min_save_interval);
        let admin = AdminConsole::new(Arc::clone(&scheduler), Arc::clone(&protocol), &config.operators);

        let restore_report = match replicator.restore().await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "initial restore failed; continuing with empty datasets");
                None
            }
        };

        let saver = spawn_background_saver(Arc::clone(&scheduler), config.save_period);
        info!(
            channel = %config.feed_channel_id,
            datasets = config.datasets.len(),
            save_period_secs = config.save_period.as_secs(),
            "ledger service started"
        );

        Ok(Self {
            config,
            protocol,
            replicator,
            scheduler,
            admin,
            restore_report,
            saver: Some(saver),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<UpdateProtocol> {
        &self.protocol
    }

    pub fn replicator(&self) -> &Arc<SnapshotReplicator> {
        &self.replicator
    }

    pub fn scheduler(&self) -> &Arc<SaveScheduler> {
        &self.scheduler
    }

    pub fn admin(&self) -> &AdminConsole {
        &self.admin
    }

    pub fn currency(&self) -> CurrencyLedger {
        CurrencyLedger::new(Arc::clone(&self.protocol))
    }

    /// Report of the startup restore; `None` if the feed could not be read.
    pub fn restore_report(&self) -> Option<&RestoreReport> {
        self.restore_report.as_ref()
    }

    /// Requests a throttled save after a mutation.
    pub fn request_save(&self) {
        self.scheduler.safe_save();
    }

    /// Stops the background saver and publishes a final snapshot.
    pub async fn shutdown(mut self) -> Result<SaveReport> {
        if let Some(saver) = self.saver.take() {
            saver.stop().await?;
        }
        let report = self.scheduler.save_now().await?;
        info!(summary = %report, "ledger service stopped");
        Ok(report)
    }
}
