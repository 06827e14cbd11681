//! The replicated tuple-space state machine.
//!
//! Applies committed [`Command`]s to the owned [`TupleSpace`] under a
//! single lock, in log order, exactly once per entry. Snapshots clone
//! the store under the lock and serialize the clone outside it; built
//! and installed snapshots are additionally persisted under
//! `<data-dir>/snapshots/`, retaining the two most recent, and the
//! newest one is restored on startup. No reference to the store escapes
//! this module.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership,
};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::{Command, CommandResponse, Member, NodeId, TypeConfig};
use crate::store::TupleSpace;

/// Number of snapshots retained on disk.
const SNAPSHOT_RETAIN: usize = 2;

const SNAPSHOT_EXT: &str = "snap";
const SNAPSHOT_META_EXT: &str = "meta";

#[derive(Debug)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, Member>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct StateMachineData {
    pub last_applied_log: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, Member>,
    pub space: TupleSpace,
}

#[derive(Debug)]
pub struct StateMachineStore {
    state_machine: RwLock<StateMachineData>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    snapshot_dir: PathBuf,
    /// Broadcast on every applied write; blocking take waits on it.
    write_signal: Notify,
}

impl StateMachineStore {
    /// Open the state machine, restoring the newest on-disk snapshot if
    /// one exists under `<data_dir>/snapshots/`.
    pub fn open(data_dir: &Path) -> crate::error::Result<Arc<Self>> {
        let snapshot_dir = data_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)?;

        let store = StateMachineStore {
            state_machine: RwLock::new(StateMachineData::default()),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
            snapshot_dir,
            write_signal: Notify::new(),
        };

        if let Some(snapshot) = store.load_latest_snapshot()? {
            info!(
                snapshot_id = %snapshot.meta.snapshot_id,
                "restoring tuple space from snapshot"
            );
            let space = TupleSpace::deserialize(&snapshot.data)?;
            let mut sm = store.state_machine.try_write().expect("unshared at startup");
            sm.last_applied_log = snapshot.meta.last_log_id;
            sm.last_membership = snapshot.meta.last_membership.clone();
            sm.space = space;
            drop(sm);
            *store.current_snapshot.try_write().expect("unshared at startup") = Some(snapshot);
        }

        Ok(Arc::new(store))
    }

    /// Signalled after every applied write.
    pub fn write_signal(&self) -> &Notify {
        &self.write_signal
    }

    /// Log position of the last applied entry, if any.
    pub async fn last_applied(&self) -> Option<LogId<NodeId>> {
        self.state_machine.read().await.last_applied_log
    }

    fn apply_command(space: &mut TupleSpace, command: &Command) -> (CommandResponse, bool) {
        match command {
            Command::Write(tuple) => match space.write(tuple.clone()) {
                Ok(()) => (CommandResponse::Written(true), true),
                Err(err) => {
                    // logical error: reported to the submitter, never retried
                    warn!(%tuple, %err, "rejected write of undefined tuple");
                    (CommandResponse::Written(false), false)
                }
            },
            Command::Take(query) => (CommandResponse::Found(space.take(query)), false),
            Command::Read(query) => (CommandResponse::Found(space.read(query).cloned()), false),
        }
    }

    fn load_latest_snapshot(&self) -> crate::error::Result<Option<StoredSnapshot>> {
        let mut metas: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.snapshot_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_META_EXT) {
                metas.push((entry.metadata()?.modified()?, path));
            }
        }
        metas.sort_by_key(|(mtime, _)| *mtime);

        let Some((_, meta_path)) = metas.pop() else {
            return Ok(None);
        };
        let meta: SnapshotMeta<NodeId, Member> =
            serde_json::from_slice(&fs::read(&meta_path)?)
                .map_err(|e| crate::error::Error::Protocol(format!("snapshot meta: {}", e)))?;
        let data = fs::read(meta_path.with_extension(SNAPSHOT_EXT))?;
        Ok(Some(StoredSnapshot { meta, data }))
    }

    /// Best-effort disk persistence; consensus correctness never depends
    /// on it.
    fn persist_snapshot(&self, snapshot: &StoredSnapshot) {
        let base = self.snapshot_dir.join(&snapshot.meta.snapshot_id);
        let result = fs::write(base.with_extension(SNAPSHOT_EXT), &snapshot.data).and_then(|_| {
            let meta = serde_json::to_vec(&snapshot.meta).expect("snapshot meta serializes");
            fs::write(base.with_extension(SNAPSHOT_META_EXT), meta)
        });
        match result {
            Ok(()) => {
                debug!(snapshot_id = %snapshot.meta.snapshot_id, "persisted snapshot");
                self.prune_snapshots();
            }
            Err(err) => warn!(%err, "failed to persist snapshot"),
        }
    }

    fn prune_snapshots(&self) {
        let mut metas: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let Ok(entries) = fs::read_dir(&self.snapshot_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_META_EXT) {
                if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                    metas.push((mtime, path));
                }
            }
        }
        metas.sort_by_key(|(mtime, _)| *mtime);
        while metas.len() > SNAPSHOT_RETAIN {
            let (_, meta_path) = metas.remove(0);
            let _ = fs::remove_file(meta_path.with_extension(SNAPSHOT_EXT));
            let _ = fs::remove_file(meta_path);
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // clone the store under the lock, serialize the clone outside it
        let (space, last_applied_log, last_membership) = {
            let sm = self.state_machine.read().await;
            (sm.space.clone(), sm.last_applied_log, sm.last_membership.clone())
        };
        let data = space
            .serialize()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&snapshot);
        *self.current_snapshot.write().await = Some(snapshot);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Member>), StorageError<NodeId>>
    {
        let sm = self.state_machine.read().await;
        Ok((sm.last_applied_log, sm.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut responses = Vec::new();
        let mut wrote = false;
        {
            let mut sm = self.state_machine.write().await;
            for entry in entries {
                sm.last_applied_log = Some(entry.log_id);
                match entry.payload {
                    EntryPayload::Blank => responses.push(CommandResponse::Empty),
                    EntryPayload::Normal(ref command) => {
                        let (response, inserted) =
                            StateMachineStore::apply_command(&mut sm.space, command);
                        wrote |= inserted;
                        responses.push(response);
                    }
                    EntryPayload::Membership(ref membership) => {
                        sm.last_membership =
                            StoredMembership::new(Some(entry.log_id), membership.clone());
                        responses.push(CommandResponse::Empty);
                    }
                }
            }
        }
        if wrote {
            self.write_signal.notify_waiters();
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Member>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        info!(snapshot_id = %meta.snapshot_id, "installing snapshot");
        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        let space = TupleSpace::deserialize(&new_snapshot.data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        {
            let mut sm = self.state_machine.write().await;
            sm.last_applied_log = meta.last_log_id;
            sm.last_membership = meta.last_membership.clone();
            sm.space = space;
        }

        self.persist_snapshot(&new_snapshot);
        *self.current_snapshot.write().await = Some(new_snapshot);
        self.write_signal.notify_waiters();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;
    use crate::tuple::Element;

    #[test]
    fn test_apply_command_semantics() {
        let mut space = TupleSpace::new();

        let (resp, wrote) =
            StateMachineStore::apply_command(&mut space, &Command::Write(tuple!["a", 1]));
        assert!(matches!(resp, CommandResponse::Written(true)));
        assert!(wrote);

        let (resp, wrote) = StateMachineStore::apply_command(
            &mut space,
            &Command::Read(tuple!["a", Element::Any]),
        );
        assert!(matches!(resp, CommandResponse::Found(Some(_))));
        assert!(!wrote);
        assert_eq!(space.len(), 1);

        let (resp, _) = StateMachineStore::apply_command(
            &mut space,
            &Command::Take(tuple!["a", Element::Any]),
        );
        assert!(matches!(resp, CommandResponse::Found(Some(_))));
        assert!(space.is_empty());

        let (resp, wrote) = StateMachineStore::apply_command(
            &mut space,
            &Command::Write(tuple![Element::Any]),
        );
        assert!(matches!(resp, CommandResponse::Written(false)));
        assert!(!wrote);
    }

    #[test]
    fn test_snapshot_persist_and_reload() {
        let dir = std::env::temp_dir().join(format!("lindad_sm_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        {
            let store = StateMachineStore::open(&dir).unwrap();
            let mut sm = store.state_machine.try_write().unwrap();
            sm.space.write(tuple!["acct", "pw", 100]).unwrap();
            let data = sm.space.serialize().unwrap();
            drop(sm);

            let snapshot = StoredSnapshot {
                meta: SnapshotMeta {
                    last_log_id: None,
                    last_membership: StoredMembership::default(),
                    snapshot_id: "test-1".to_string(),
                },
                data,
            };
            store.persist_snapshot(&snapshot);
        }

        let store = StateMachineStore::open(&dir).unwrap();
        let sm = store.state_machine.try_read().unwrap();
        assert!(sm.space.read(&tuple!["acct", "pw", Element::Any]).is_some());
        drop(sm);

        let _ = fs::remove_dir_all(&dir);
    }
}
