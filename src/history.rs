//! Execution history: the only durable state the bridge owns.
//!
//! One JSON file per emulator target, rewritten atomically on every update.
//! A SUCCEEDED record is final.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{ExecutionRecord, Outcome, SequenceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Read side of the history, as the reconciler sees it.
pub trait HistoryLookup {
    fn get(&self, sequence_id: &SequenceId) -> Option<&ExecutionRecord>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Partition {
    target: String,
    records: BTreeMap<SequenceId, ExecutionRecord>,
}

pub struct ExecutionHistory {
    path: PathBuf,
    partition: Partition,
}

impl ExecutionHistory {
    /// Open (or create) the partition of `target` under `state_dir`.
    pub fn open(state_dir: &Path, target: &str) -> BridgeResult<Self> {
        fs::create_dir_all(state_dir).map_err(|e| {
            BridgeError::Store(format!("cannot create {}: {}", state_dir.display(), e))
        })?;
        let path = partition_path(state_dir, target);

        let partition = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| BridgeError::Store(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str::<Partition>(&raw)
                .map_err(|e| BridgeError::Store(format!("corrupt history {}: {}", path.display(), e)))?
        } else {
            Partition {
                target: target.to_string(),
                records: BTreeMap::new(),
            }
        };

        info!(target_device = target, records = partition.records.len(), path = %path.display(), "execution history loaded");
        Ok(Self { path, partition })
    }

    pub fn target(&self) -> &str {
        &self.partition.target
    }

    pub fn len(&self) -> usize {
        self.partition.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.records.is_empty()
    }

    /// Record one attempt and persist. Returns the stored record, which is
    /// the existing one unchanged when the signal already SUCCEEDED.
    pub fn record(
        &mut self,
        sequence_id: &SequenceId,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> BridgeResult<ExecutionRecord> {
        if let Some(existing) = self.partition.records.get(sequence_id) {
            if existing.outcome == Outcome::Succeeded {
                warn!(sequence_id = %sequence_id, attempted = outcome.as_str(), "ignoring update to a SUCCEEDED record");
                return Ok(existing.clone());
            }
        }

        // Only executions count as attempts; a skip leaves the count alone.
        let previous_count = self
            .partition
            .records
            .get(sequence_id)
            .map(|r| r.attempt_count)
            .unwrap_or(0);
        let attempt_count = match outcome {
            Outcome::SkippedAlreadySatisfied => previous_count,
            Outcome::Succeeded | Outcome::Failed => previous_count + 1,
        };
        let record = ExecutionRecord {
            sequence_id: sequence_id.clone(),
            attempted_at: at,
            outcome,
            attempt_count,
        };
        let previous = self.partition.records.insert(sequence_id.clone(), record.clone());

        if let Err(e) = self.persist() {
            // Memory never claims more than disk.
            match previous {
                Some(prev) => self.partition.records.insert(sequence_id.clone(), prev),
                None => self.partition.records.remove(sequence_id),
            };
            return Err(e);
        }
        Ok(record)
    }

    fn persist(&self) -> BridgeResult<()> {
        let json = serde_json::to_string_pretty(&self.partition)
            .map_err(|e| BridgeError::Store(format!("cannot serialize history: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| BridgeError::Store(format!("cannot write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| BridgeError::Store(format!("cannot replace {}: {}", self.path.display(), e)))
    }
}

impl HistoryLookup for ExecutionHistory {
    fn get(&self, sequence_id: &SequenceId) -> Option<&ExecutionRecord> {
        self.partition.records.get(sequence_id)
    }
}

impl HistoryLookup for BTreeMap<SequenceId, ExecutionRecord> {
    fn get(&self, sequence_id: &SequenceId) -> Option<&ExecutionRecord> {
        BTreeMap::get(self, sequence_id)
    }
}

/// `history-<readable serial>-<hash>.json`. The hash keeps serials that
/// sanitise to the same text ("a:b", "a_b") in separate files.
pub fn partition_path(state_dir: &Path, target: &str) -> PathBuf {
    let readable: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(target.as_bytes());
    state_dir.join(format!("history-{}-{}.json", readable, hex::encode(&digest[..4])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SequenceId {
        SequenceId(s.to_string())
    }

    #[test]
    fn test_attempts_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ExecutionHistory::open(dir.path(), "emulator-5554").unwrap();
        let skipped = h.record(&sid("a"), Outcome::SkippedAlreadySatisfied, Utc::now()).unwrap();
        assert_eq!(skipped.attempt_count, 0);
        h.record(&sid("a"), Outcome::Failed, Utc::now()).unwrap();
        let rec = h.record(&sid("a"), Outcome::Failed, Utc::now()).unwrap();
        assert_eq!(rec.attempt_count, 2);
        assert_eq!(rec.outcome, Outcome::Failed);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_succeeded_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ExecutionHistory::open(dir.path(), "emulator-5554").unwrap();
        h.record(&sid("a"), Outcome::Succeeded, Utc::now()).unwrap();
        let rec = h.record(&sid("a"), Outcome::Failed, Utc::now()).unwrap();
        assert_eq!(rec.outcome, Outcome::Succeeded);
        assert_eq!(rec.attempt_count, 1);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut h = ExecutionHistory::open(dir.path(), "127.0.0.1:5555").unwrap();
            h.record(&sid("s"), Outcome::Succeeded, Utc::now()).unwrap();
        }
        let h = ExecutionHistory::open(dir.path(), "127.0.0.1:5555").unwrap();
        assert_eq!(h.get(&sid("s")).map(|r| r.outcome), Some(Outcome::Succeeded));
        assert_eq!(h.target(), "127.0.0.1:5555");
        assert!(partition_path(dir.path(), "127.0.0.1:5555").exists());
        assert!(partition_path(dir.path(), "127.0.0.1:5555")
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("history-127_0_0_1_5555-"))
            .unwrap_or(false));
    }

    #[test]
    fn test_partitions_are_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = ExecutionHistory::open(dir.path(), "emulator-5554").unwrap();
        a.record(&sid("s"), Outcome::Succeeded, Utc::now()).unwrap();
        let b = ExecutionHistory::open(dir.path(), "emulator-5556").unwrap();
        assert!(b.get(&sid("s")).is_none());
    }

    #[test]
    fn test_corrupt_partition_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(partition_path(dir.path(), "x"), "{").unwrap();
        assert!(matches!(ExecutionHistory::open(dir.path(), "x"), Err(BridgeError::Store(_))));
    }

    #[test]
    fn test_serials_that_sanitise_alike_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        assert_ne!(partition_path(dir.path(), "a:b"), partition_path(dir.path(), "a_b"));

        let mut colon = ExecutionHistory::open(dir.path(), "a:b").unwrap();
        colon.record(&sid("s"), Outcome::Succeeded, Utc::now()).unwrap();
        let underscore = ExecutionHistory::open(dir.path(), "a_b").unwrap();
        assert!(underscore.get(&sid("s")).is_none());
        assert_eq!(underscore.target(), "a_b");
    }
}
