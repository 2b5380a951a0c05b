//! Durable storage backends for the queue engine (§4.8 "Durability").
//!
//! Both backends implement the same contract: after a successful commit,
//! a later `replay` observes the committed change regardless of a process
//! restart (file backend) or of anything short of process death (memory
//! backend). The queue engine itself holds the live priority heap in
//! memory; these logs exist purely to reconstruct that heap on startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::FabricError;

use super::types::QueuedMsg;

/// Everything one committed transaction did to a queue: messages it made
/// visible and messages it permanently removed. Replaying these in order
/// reconstructs the queue's durable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitRecord {
    pub enqueued: Vec<QueuedMsg>,
    pub dequeued: Vec<Uuid>,
}

impl CommitRecord {
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty() && self.dequeued.is_empty()
    }
}

#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Appends `record`. Must not return until the record is durable per
    /// this backend's contract — the file backend fsyncs before
    /// returning, which is what makes a Commit call a durability point.
    async fn append(&self, record: &CommitRecord) -> Result<(), FabricError>;

    /// Replays every appended record, in commit order, for crash/startup
    /// recovery.
    async fn replay(&self) -> Result<Vec<CommitRecord>, FabricError>;
}

/// In-memory log: visible to later `replay` calls within the same
/// process, gone on restart. Used for ephemeral queues and tests.
pub struct MemoryLog {
    records: AsyncMutex<Vec<CommitRecord>>,
}

impl MemoryLog {
    pub fn new() -> Arc<MemoryLog> {
        Arc::new(MemoryLog {
            records: AsyncMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TransactionLog for MemoryLog {
    async fn append(&self, record: &CommitRecord) -> Result<(), FabricError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<CommitRecord>, FabricError> {
        Ok(self.records.lock().await.clone())
    }
}

/// Append-only file transaction log, one per queue directory (§6.5):
/// a length-prefixed JSON record per commit, fsynced before `append`
/// returns. `replay` tolerates a truncated trailing record — the tail of
/// a write interrupted by a crash — by stopping at the first short read
/// rather than failing recovery outright.
pub struct FileLog {
    path: PathBuf,
    file: AsyncMutex<std::fs::File>,
}

impl FileLog {
    pub fn open(dir: &Path) -> Result<Arc<FileLog>, FabricError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("txn.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Arc::new(FileLog {
            path,
            file: AsyncMutex::new(file),
        }))
    }
}

#[async_trait]
impl TransactionLog for FileLog {
    async fn append(&self, record: &CommitRecord) -> Result<(), FabricError> {
        let bytes = serde_json::to_vec(record).map_err(|e| FabricError::Codec(e.to_string()))?;
        let mut file = self.file.lock().await;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<CommitRecord>, FabricError> {
        let mut buf = Vec::new();
        std::fs::File::open(&self.path)?.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            if cursor + len > buf.len() {
                tracing::warn!(path = %self.path.display(), "truncated tail record in transaction log, stopping replay");
                break;
            }
            match serde_json::from_slice(&buf[cursor..cursor + len]) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt transaction log record, stopping replay");
                    break;
                }
            }
            cursor += len;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::Priority;

    fn sample_msg(order: u64) -> QueuedMsg {
        QueuedMsg {
            id: Uuid::new_v4(),
            queue_ep: "logical://queues/orders".into(),
            body: b"hi".to_vec(),
            priority: Priority::Normal,
            enqueue_time: 0,
            enqueue_order: order,
            expire_time: None,
            delivery_attempts: 0,
            session_txn_id: None,
        }
    }

    #[tokio::test]
    async fn memory_log_replays_appended_records_in_order() {
        let log = MemoryLog::new();
        log.append(&CommitRecord {
            enqueued: vec![sample_msg(0)],
            dequeued: vec![],
        })
        .await
        .unwrap();
        log.append(&CommitRecord {
            enqueued: vec![],
            dequeued: vec![sample_msg(0).id],
        })
        .await
        .unwrap();
        assert_eq!(log.replay().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let msg = sample_msg(7);
        {
            let log = FileLog::open(dir.path()).unwrap();
            log.append(&CommitRecord {
                enqueued: vec![msg.clone()],
                dequeued: vec![],
            })
            .await
            .unwrap();
        }
        let reopened = FileLog::open(dir.path()).unwrap();
        let records = reopened.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].enqueued[0].id, msg.id);
    }

    #[tokio::test]
    async fn file_log_ignores_truncated_tail() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        log.append(&CommitRecord {
            enqueued: vec![sample_msg(1)],
            dequeued: vec![],
        })
        .await
        .unwrap();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(dir.path().join("txn.log")).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let reloaded = FileLog::open(dir.path()).unwrap();
        assert_eq!(reloaded.replay().await.unwrap().len(), 1);
    }
}
