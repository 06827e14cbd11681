//! Node assembly: configuration, startup wiring and shutdown.
//!
//! Starting a node brings up, in order: the state machine (restoring the
//! newest on-disk snapshot), the consensus instance, the inter-node RPC
//! listener, the client session front-end, and the worker loop. A fresh
//! node without a seed bootstraps a single-node cluster; with a seed it
//! announces itself through the seed's client port and is added as a
//! voter by the leader.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::{Config, SnapshotPolicy};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::raft::{
    node_id_for, LogStore, Member, NodeId, Raft, RpcNetwork, StateMachineStore,
};
use crate::session::{self, PortAllocator, Preamble, SessionContext};
use crate::space::SpaceHandle;
use crate::worker;

/// Attempts to announce a join to the seed before giving up.
const JOIN_ATTEMPTS: u32 = 5;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory for consensus-managed state (snapshots).
    pub data_dir: PathBuf,
    /// Client-facing TCP bind address.
    pub haddr: String,
    /// Consensus transport bind address.
    pub raddr: String,
    /// Node identity; defaults to the transport address.
    pub id: String,
    /// Seed address of an existing cluster to join, if any.
    pub join: Option<String>,
}

/// A running node. Dropping the handle does not stop the node; call
/// [`shutdown`](Node::shutdown).
pub struct Node {
    pub space: SpaceHandle,
    node_id: NodeId,
    client_addr: SocketAddr,
    raft_addr: SocketAddr,
    raft: Raft,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node and, depending on configuration, bootstrap a new
    /// cluster or join an existing one.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let node_id = node_id_for(&config.id);
        info!(id = %config.id, node_id, "starting node");

        std::fs::create_dir_all(&config.data_dir)?;
        let state_machine = StateMachineStore::open(&config.data_dir)?;
        let log_store = LogStore::new();
        if let Some(last_applied) = state_machine.last_applied().await {
            log_store.align_to_snapshot(last_applied).await;
        }

        let raft_config = Config {
            heartbeat_interval: 250,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(1000),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| Error::Consensus(e.to_string()))?,
        );

        let raft = Raft::new(
            node_id,
            raft_config,
            RpcNetwork,
            log_store,
            state_machine.clone(),
        )
        .await
        .map_err(|e| Error::Consensus(e.to_string()))?;

        // bind both listeners before advertising any address
        let raft_listener = TcpListener::bind(&config.raddr).await?;
        let raft_addr = raft_listener.local_addr()?;
        let client_listener = TcpListener::bind(&config.haddr).await?;
        let client_addr = client_listener.local_addr()?;

        let advertised = Member::new(raft_addr.to_string(), client_addr.to_string());
        let space = SpaceHandle::new(raft.clone(), state_machine);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(crate::raft::server::run(
            raft_listener,
            raft.clone(),
        )));

        let ctx = Arc::new(SessionContext {
            space: space.clone(),
            client_addr: client_addr.to_string(),
            bind_host: client_addr.ip().to_string(),
            ports: PortAllocator::new(client_addr.port().wrapping_add(1)),
        });
        tasks.push(tokio::spawn(session::run(client_listener, ctx)));
        tasks.push(tokio::spawn(worker::run(space.clone())));

        match &config.join {
            None => {
                space.initialize(node_id, advertised).await?;
            }
            Some(seed) => {
                announce_join(seed, &config.id, &advertised).await?;
            }
        }

        info!(client = %client_addr, raft = %raft_addr, "node started");
        Ok(Node {
            space,
            node_id,
            client_addr,
            raft_addr,
            raft,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The actually bound client-facing address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The actually bound consensus transport address.
    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    /// Stop consensus and all listeners.
    pub async fn shutdown(self) {
        if let Err(err) = self.raft.shutdown().await {
            warn!(%err, "raft shutdown failed");
        }
        for task in self.tasks {
            task.abort();
        }
        info!("node stopped");
    }
}

/// Announce this node to the seed's client port so the leader adds it as
/// a voter.
async fn announce_join(seed: &str, id: &str, advertised: &Member) -> Result<()> {
    let preamble = Preamble {
        kind: "join".to_string(),
        addr: advertised.raft_addr.clone(),
        id: id.to_string(),
        haddr: advertised.client_addr.clone(),
    };
    let mut payload = serde_json::to_vec(&preamble)
        .map_err(|e| Error::Protocol(format!("encoding join preamble: {}", e)))?;
    payload.push(b'\n');

    let mut last_err = None;
    for attempt in 1..=JOIN_ATTEMPTS {
        match TcpStream::connect(seed).await {
            Ok(mut stream) => {
                stream.write_all(&payload).await?;
                stream.shutdown().await?;
                info!(%seed, "join announced");
                return Ok(());
            }
            Err(err) => {
                warn!(%seed, attempt, %err, "join attempt failed");
                last_err = Some(err);
                tokio::time::sleep(JOIN_RETRY_DELAY * attempt).await;
            }
        }
    }
    Err(Error::Transport(last_err.expect("at least one attempt")))
}
