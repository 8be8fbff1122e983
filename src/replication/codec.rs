use crate::core::{LedgerError, Result};
use crate::storage::Records;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// On-feed form of one dataset snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub format_version: u16,
    pub dataset: String,
    pub written_at: DateTime<Utc>,
    pub records: Records,
}

pub fn encode(dataset: &str, records: Records) -> Result<Vec<u8>> {
    let envelope = SnapshotEnvelope {
        format_version: SNAPSHOT_FORMAT_VERSION,
        dataset: dataset.to_string(),
        written_at: Utc::now(),
        records,
    };
    serde_json::to_vec_pretty(&envelope)
        .map_err(|err| LedgerError::Serialization(format!("serialize snapshot '{}': {}", dataset, err)))
}

/// Decodes a snapshot payload into records.
///
/// Accepts the envelope format and the bare `{key: record}` documents older
/// snapshots consist of.
pub fn decode(dataset: &str, bytes: &[u8]) -> Result<Records> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|err| LedgerError::Parse(format!("snapshot '{}' is not JSON: {}", dataset, err)))?;

    let Value::Object(fields) = document else {
        return Err(LedgerError::Parse(format!(
            "snapshot '{}' is not a JSON object",
            dataset
        )));
    };

    if !(fields.contains_key("format_version") && fields.contains_key("records")) {
        return Ok(fields.into_iter().collect());
    }

    let envelope: SnapshotEnvelope = serde_json::from_value(Value::Object(fields))
        .map_err(|err| LedgerError::Parse(format!("snapshot '{}' envelope: {}", dataset, err)))?;

    if envelope.format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(LedgerError::Parse(format!(
            "snapshot '{}' has format version {}, newest supported is {}",
            dataset, envelope.format_version, SNAPSHOT_FORMAT_VERSION
        )));
    }
    if envelope.dataset != dataset {
        return Err(LedgerError::Parse(format!(
            "payload named '{}' holds dataset '{}'",
            dataset, envelope.dataset
        )));
    }

    Ok(envelope.records)
}
