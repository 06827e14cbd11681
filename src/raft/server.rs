//! Inter-node consensus RPC listener.
//!
//! Accepts peer connections on the consensus transport address and
//! serves framed RPCs until the peer hangs up, dispatching each request
//! into the local raft instance.

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::network::{read_frame, write_frame, RaftRequest};
use super::Raft;

pub async fn run(listener: TcpListener, raft: Raft) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "raft transport listening");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let raft = raft.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_peer(stream, raft).await {
                        debug!(%peer, %err, "raft peer connection closed");
                    }
                });
            }
            Err(err) => {
                debug!(%err, "raft transport accept failed");
            }
        }
    }
}

async fn serve_peer(mut stream: TcpStream, raft: Raft) -> std::io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };
        let request: RaftRequest = serde_json::from_slice(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let response = match request {
            RaftRequest::AppendEntries(rpc) => {
                serde_json::to_vec(&raft.append_entries(rpc).await)
            }
            RaftRequest::Vote(rpc) => serde_json::to_vec(&raft.vote(rpc).await),
            RaftRequest::InstallSnapshot(rpc) => {
                serde_json::to_vec(&raft.install_snapshot(rpc).await)
            }
        }
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        write_frame(&mut stream, &response).await?;
    }
}
