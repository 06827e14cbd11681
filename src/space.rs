//! Leader-aware handle over the replicated tuple space.
//!
//! Every primitive is linearized through the consensus log: the command
//! is submitted on the leader, committed, applied to the state machine,
//! and the state machine's answer returned to the caller. On a
//! non-leader every primitive fails with [`Error::NotLeader`] carrying
//! the leader's client-facing address when known.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{ChangeMembers, ServerState};
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::error::{Error, Result};
use crate::raft::{
    node_id_for, Command, CommandResponse, Member, NodeId, Raft, StateMachineStore,
};
use crate::tuple::Tuple;

/// Budget for one consensus apply, commit included.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A cheaply cloneable handle shared by sessions and workers.
#[derive(Clone)]
pub struct SpaceHandle {
    raft: Raft,
    state_machine: Arc<StateMachineStore>,
}

impl SpaceHandle {
    pub fn new(raft: Raft, state_machine: Arc<StateMachineStore>) -> Self {
        SpaceHandle {
            raft,
            state_machine,
        }
    }

    /// Insert a defined tuple into the space. Returns whether the tuple
    /// was inserted.
    pub async fn write(&self, tuple: Tuple) -> Result<bool> {
        if !tuple.is_defined() {
            return Err(Error::Undefined);
        }
        match self.submit(Command::Write(tuple)).await? {
            CommandResponse::Written(inserted) => Ok(inserted),
            _ => Err(Error::Consensus("unexpected response to write".into())),
        }
    }

    /// Remove and return the first tuple matching the query, if any.
    /// The query may contain wildcards but not `None`.
    pub async fn take(&self, query: Tuple) -> Result<Option<Tuple>> {
        if query.has_none() {
            return Err(Error::Undefined);
        }
        match self.submit(Command::Take(query)).await? {
            CommandResponse::Found(found) => Ok(found),
            _ => Err(Error::Consensus("unexpected response to take".into())),
        }
    }

    /// Return the first tuple matching the query without removing it.
    pub async fn read(&self, query: Tuple) -> Result<Option<Tuple>> {
        if query.has_none() {
            return Err(Error::Undefined);
        }
        match self.submit(Command::Read(query)).await? {
            CommandResponse::Found(found) => Ok(found),
            _ => Err(Error::Consensus("unexpected response to read".into())),
        }
    }

    /// Take that suspends until a match appears: on a miss it waits for
    /// the next applied write (or the poll interval as a fallback) and
    /// retries. Leadership loss surfaces as [`Error::NotLeader`].
    pub async fn take_blocking(&self, query: &Tuple, poll: Duration) -> Result<Tuple> {
        loop {
            // register before checking so an apply between the miss and
            // the wait still wakes us
            let signalled = self.state_machine.write_signal().notified();
            if let Some(tuple) = self.take(query.clone()).await? {
                return Ok(tuple);
            }
            tokio::select! {
                _ = signalled => {}
                _ = sleep(poll) => {}
            }
        }
    }

    async fn submit(&self, command: Command) -> Result<CommandResponse> {
        match timeout(APPLY_TIMEOUT, self.raft.client_write(command)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(err)) => Err(map_write_error(err)),
        }
    }

    /// True when this node currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// Client-facing address of the current leader, when known.
    pub fn leader_client_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader_id)
            .map(|member| member.client_addr.clone())
    }

    /// Bootstrap a fresh single-node cluster. A node restarting with
    /// existing membership (from a restored snapshot) is left as is.
    pub async fn initialize(&self, node_id: NodeId, member: Member) -> Result<()> {
        let members = BTreeMap::from([(node_id, member)]);
        match self.raft.initialize(members).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!("cluster already initialized, skipping bootstrap");
                Ok(())
            }
            Err(err) => Err(Error::Consensus(err.to_string())),
        }
    }

    /// Add a node as a voter. Idempotent when a member with the same id
    /// AND transport address already exists; a member sharing only one
    /// of the two is stale and removed first.
    pub async fn join(&self, id: &str, member: Member) -> Result<()> {
        let node_id = node_id_for(id);
        let membership = {
            let metrics = self.raft.metrics().borrow().clone();
            metrics.membership_config.membership().clone()
        };
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();

        let mut stale: BTreeSet<NodeId> = BTreeSet::new();
        for (existing_id, existing) in membership.nodes() {
            let same_id = *existing_id == node_id;
            let same_addr = existing.raft_addr == member.raft_addr;
            if same_id && same_addr && voters.contains(existing_id) {
                info!(%id, member = %member, "node already a member, ignoring join");
                return Ok(());
            }
            if same_id || same_addr {
                stale.insert(*existing_id);
            }
        }

        let stale_voters: BTreeSet<NodeId> = stale.intersection(&voters).copied().collect();
        let stale_learners: BTreeSet<NodeId> = stale.difference(&voters).copied().collect();
        if !stale_voters.is_empty() {
            info!(?stale_voters, "removing stale members before join");
            self.change_membership(ChangeMembers::RemoveVoters(stale_voters))
                .await?;
        }
        if !stale_learners.is_empty() {
            self.change_membership(ChangeMembers::RemoveNodes(stale_learners))
                .await?;
        }

        self.raft
            .add_learner(node_id, member.clone(), true)
            .await
            .map_err(map_write_error)?;
        self.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])))
            .await?;
        info!(%id, member = %member, "node joined as voter");
        Ok(())
    }

    /// Remove a server from the cluster entirely.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let node_id = node_id_for(id);
        self.change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([node_id])))
            .await?;
        self.change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([node_id])))
            .await
    }

    async fn change_membership(&self, change: ChangeMembers<NodeId, Member>) -> Result<()> {
        self.raft
            .change_membership(change, false)
            .await
            .map(|_| ())
            .map_err(map_write_error)
    }

    /// Force a snapshot of the current state machine.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| Error::Consensus(e.to_string()))
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }
}

fn map_write_error(err: RaftError<NodeId, ClientWriteError<NodeId, Member>>) -> Error {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => Error::NotLeader {
            leader: forward.leader_node.map(|member| member.client_addr),
        },
        other => Error::Consensus(other.to_string()),
    }
}
