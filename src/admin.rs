//! Operator commands: force save, force restore, identity migration, status.

use crate::core::{FeedReference, LedgerError, Principal, Result};
use crate::protocol::UpdateProtocol;
use crate::replication::SaveScheduler;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ForceSave,
    ForceRestore {
        dataset: String,
        reference: Option<FeedReference>,
    },
    MigratePrincipal(Principal),
    Status,
}

impl AdminCommand {
    /// Parses the text form used in chat:
    ///
    /// ```text
    /// save
    /// restore <dataset> [reference]
    /// migrate <id> [alias...]
    /// status
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let mut words = input.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| LedgerError::Parse("empty admin command".to_string()))?;

        let command = match verb.to_ascii_lowercase().as_str() {
            "save" => AdminCommand::ForceSave,
            "status" => AdminCommand::Status,
            "restore" => {
                let dataset = words
                    .next()
                    .ok_or_else(|| LedgerError::Parse("usage: restore <dataset> [reference]".to_string()))?;
                AdminCommand::ForceRestore {
                    dataset: dataset.to_string(),
                    reference: words.next().map(FeedReference::new),
                }
            }
            "migrate" => {
                let id = words
                    .next()
                    .ok_or_else(|| LedgerError::Parse("usage: migrate <id> [alias...]".to_string()))?;
                let principal = words.by_ref().fold(Principal::new(id), |p, alias| p.with_alias(alias));
                AdminCommand::MigratePrincipal(principal)
            }
            other => {
                return Err(LedgerError::Parse(format!("unknown admin command '{}'", other)));
            }
        };

        if let Some(extra) = words.next() {
            return Err(LedgerError::Parse(format!("unexpected argument '{}'", extra)));
        }
        Ok(command)
    }
}

pub struct AdminConsole {
    scheduler: Arc<SaveScheduler>,
    protocol: Arc<UpdateProtocol>,
    operators: HashSet<String>,
}

impl AdminConsole {
    pub fn new(scheduler: Arc<SaveScheduler>, protocol: Arc<UpdateProtocol>, operators: &[String]) -> Self {
        Self {
            scheduler,
            protocol,
            operators: operators.iter().cloned().collect(),
        }
    }

    pub fn is_operator(&self, actor: &str) -> bool {
        self.operators.contains(actor)
    }

    /// Runs `command` on behalf of `actor` and returns a message for them.
    pub async fn execute(&self, actor: &str, command: AdminCommand) -> Result<String> {
        if !self.is_operator(actor) {
            warn!(actor = %actor, ?command, "admin command refused");
            return Err(LedgerError::Unauthorized(actor.to_string()));
        }
        info!(actor = %actor, ?command, "admin command");

        match command {
            AdminCommand::ForceSave => {
                let report = self.scheduler.save_now().await?;
                Ok(format!("Save finished: {}", report))
            }
            AdminCommand::ForceRestore { dataset, reference } => {
                let restored = self.scheduler.restore_one(&dataset, reference.as_ref()).await?;
                Ok(format!(
                    "Restored '{}' from {} ({} records, published {})",
                    restored.dataset,
                    restored.reference,
                    restored.records,
                    restored.published_at.to_rfc3339()
                ))
            }
            AdminCommand::MigratePrincipal(principal) => {
                let migrated = self
                    .protocol
                    .resolver()
                    .migrate_all(&principal, self.protocol.store())?;
                if migrated.is_empty() {
                    Ok(format!("Nothing to migrate for {}", principal.id))
                } else {
                    Ok(format!("Migrated {} in: {}", principal.id, migrated.join(", ")))
                }
            }
            AdminCommand::Status => self.status(),
        }
    }

    fn status(&self) -> Result<String> {
        let store = self.protocol.store();
        let replicator = self.scheduler.replicator();
        let unrestored: HashSet<String> = replicator.unrestored()?.into_iter().collect();

        let mut out = String::new();
        for name in store.dataset_names() {
            let loaded = match replicator.load_record(&name)? {
                Some(record) => format!("{} @ {}", record.reference, record.timestamp.to_rfc3339()),
                None => "never published".to_string(),
            };
            let _ = write!(
                out,
                "{}: {} records, rev {}, {}",
                name,
                store.len(&name)?,
                store.revision(&name)?,
                loaded
            );
            if unrestored.contains(&name) {
                out.push_str(" (restore pending)");
            }
            out.push('\n');
        }

        let stats = self.scheduler.stats();
        let _ = write!(
            out,
            "saves: {} executed, {} queued, {} deferred, {} failed",
            stats.executed, stats.queued, stats.deferred, stats.failed
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(AdminCommand::parse("save").unwrap(), AdminCommand::ForceSave);
        assert_eq!(AdminCommand::parse("  STATUS ").unwrap(), AdminCommand::Status);
        assert_eq!(
            AdminCommand::parse("restore bank 1234").unwrap(),
            AdminCommand::ForceRestore {
                dataset: "bank".to_string(),
                reference: Some(FeedReference::new("1234")),
            }
        );
        assert_eq!(
            AdminCommand::parse("migrate 111 Alice alice").unwrap(),
            AdminCommand::MigratePrincipal(Principal::new("111").with_alias("Alice").with_alias("alice"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(AdminCommand::parse(""), Err(LedgerError::Parse(_))));
        assert!(matches!(AdminCommand::parse("restore"), Err(LedgerError::Parse(_))));
        assert!(matches!(AdminCommand::parse("save now"), Err(LedgerError::Parse(_))));
        assert!(matches!(AdminCommand::parse("drop balances"), Err(LedgerError::Parse(_))));
    }
}
