//! Inter-node consensus RPC client.
//!
//! RPCs travel over plain TCP as length-prefixed JSON frames: a `u32`
//! little-endian byte length followed by one serialized message. A
//! connection is kept open per peer and re-established on failure;
//! openraft drives retries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};

use super::{Member, NodeId, TypeConfig};

/// Upper bound on a single RPC frame; a peer announcing more is broken.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One consensus RPC, as framed on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

pub(crate) async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

pub(crate) async fn read_frame<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Factory handed to the consensus module; builds one connection handle
/// per peer.
#[derive(Debug, Default, Clone)]
pub struct RpcNetwork;

impl RaftNetworkFactory<TypeConfig> for RpcNetwork {
    type Network = RpcConnection;

    async fn new_client(&mut self, target: NodeId, node: &Member) -> Self::Network {
        RpcConnection {
            target,
            addr: node.raft_addr.clone(),
            stream: None,
        }
    }
}

pub struct RpcConnection {
    target: NodeId,
    addr: String,
    stream: Option<TcpStream>,
}

impl RpcConnection {
    async fn call<Resp, E>(
        &mut self,
        request: &RaftRequest,
    ) -> Result<Resp, RPCError<NodeId, Member, E>>
    where
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(request).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let response = match self.exchange(&payload).await {
            Ok(response) => response,
            Err(err) => {
                // drop the cached connection; the next call reconnects
                self.stream = None;
                debug!(peer = self.target, addr = %self.addr, %err, "raft rpc failed");
                return Err(RPCError::Unreachable(Unreachable::new(&err)));
            }
        };

        let result: Result<Resp, E> = serde_json::from_slice(&response)
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn exchange(&mut self, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        if self.stream.is_none() {
            self.stream = Some(TcpStream::connect(&self.addr).await?);
        }
        let stream = self.stream.as_mut().expect("connected above");
        write_frame(stream, payload).await?;
        read_frame(stream).await
    }
}

impl RaftNetwork<TypeConfig> for RpcConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Member, RaftError<NodeId>>> {
        self.call(&RaftRequest::AppendEntries(rpc)).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Member, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.call(&RaftRequest::InstallSnapshot(rpc)).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Member, RaftError<NodeId>>> {
        self.call(&RaftRequest::Vote(rpc)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello frame");
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
