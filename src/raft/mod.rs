//! Consensus integration: the replicated command log behind the tuple
//! space.
//!
//! The tuple space is a state machine driven by an externally replicated
//! log: every mutating or matching primitive is submitted as a
//! [`Command`], committed through the log, and applied in log order on
//! every replica. This module declares the log's type configuration and
//! member identity; the submodules provide the in-memory log storage,
//! the state machine itself, and the inter-node RPC transport.

use std::fmt;
use std::hash::Hasher;
use std::io::Cursor;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;

use crate::tuple::Tuple;

pub mod log_store;
pub mod network;
pub mod server;
pub mod state_machine;

pub use log_store::LogStore;
pub use network::RpcNetwork;
pub use state_machine::StateMachineStore;

pub type NodeId = u64;

/// A cluster member: the consensus transport address plus the
/// client-facing address used for leader redirects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub raft_addr: String,
    pub client_addr: String,
}

impl Member {
    pub fn new(raft_addr: impl Into<String>, client_addr: impl Into<String>) -> Self {
        Member {
            raft_addr: raft_addr.into(),
            client_addr: client_addr.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{raft: {}, client: {}}}", self.raft_addr, self.client_addr)
    }
}

/// A command replicated through the log and applied to every replica's
/// local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Write(Tuple),
    Take(Tuple),
    Read(Tuple),
}

/// The state machine's answer to an applied command, handed back to the
/// submitter on the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResponse {
    /// `Write`: whether the tuple was inserted.
    Written(bool),
    /// `Take`/`Read`: the first matching tuple in index order, if any.
    Found(Option<Tuple>),
    /// Blank or membership entries.
    Empty,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        Node = Member,
);

pub type Raft = openraft::Raft<TypeConfig>;

/// Map a string node id onto the consensus module's 64-bit id. The hash
/// is keyed SipHash-2-4 with fixed keys so every node derives the same
/// mapping independently of process or platform.
pub fn node_id_for(id: &str) -> NodeId {
    let mut hasher = SipHasher24::new_with_keys(0x6c696e6461, 0x7370616365);
    hasher.write(id.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        assert_eq!(node_id_for("localhost:12000"), node_id_for("localhost:12000"));
        assert_ne!(node_id_for("localhost:12000"), node_id_for("localhost:12001"));
    }
}
