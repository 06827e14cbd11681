//! In-memory replicated log storage.
//!
//! Log and stable storage are in-memory by default; durability across
//! restarts comes from the snapshot path in
//! [`state_machine`](super::state_machine).

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{Entry, LogId, OptionalSend, RaftLogReader, StorageError, Vote};
use tokio::sync::RwLock;

use super::{NodeId, TypeConfig};

#[derive(Debug, Default)]
pub struct LogStore {
    last_purged_log_id: RwLock<Option<LogId<NodeId>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    committed: RwLock<Option<LogId<NodeId>>>,
    vote: RwLock<Option<Vote<NodeId>>>,
}

impl LogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(LogStore::default())
    }

    /// Align the fresh in-memory log with a state machine restored from
    /// a snapshot: everything up to the restore point counts as purged,
    /// and the vote acknowledges the term that produced it.
    pub async fn align_to_snapshot(&self, log_id: LogId<NodeId>) {
        *self.last_purged_log_id.write().await = Some(log_id);
        *self.committed.write().await = Some(log_id);
        *self.vote.write().await = Some(Vote::new_committed(
            log_id.leader_id.term,
            log_id.leader_id.node_id,
        ));
    }
}

impl RaftLogReader<TypeConfig> for Arc<LogStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for Arc<LogStore> {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, entry)| entry.log_id);
        let last_purged = *self.last_purged_log_id.read().await;
        let last = match last {
            None => last_purged,
            Some(x) => Some(x),
        };
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        *self.committed.write().await = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(*self.committed.read().await)
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        {
            let mut log = self.log.write().await;
            for entry in entries {
                log.insert(entry.log_id.index, entry);
            }
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut log = self.log.write().await;
        let keys = log.range(log_id.index..).map(|(k, _)| *k).collect::<Vec<_>>();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        {
            let mut last_purged = self.last_purged_log_id.write().await;
            *last_purged = Some(log_id);
        }
        let mut log = self.log.write().await;
        let keys = log.range(..=log_id.index).map(|(k, _)| *k).collect::<Vec<_>>();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
