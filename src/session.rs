//! Client session front-end.
//!
//! A node accepts TCP sessions on its well-known client address. Each
//! session starts with one newline-delimited JSON preamble declaring
//! intent: `join` registers the sender as a voter through the consensus
//! membership, `request` hands the client a private ephemeral port on
//! the leader (or a redirect to the leader elsewhere). The one-shot
//! handler on the ephemeral port accepts a single bank request, lifts it
//! into a request tuple, and answers with the matched response tuple.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::raft::Member;
use crate::space::SpaceHandle;
use crate::tuple;
use crate::tuple::Element;
use crate::worker::{POLL_INTERVAL, REQ, RES};

/// How long a one-shot handler waits for the client to dial in.
const HANDOFF_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a session waits for the worker's response tuple.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Session preamble, sent by clients and joining nodes alike.
#[derive(Debug, Serialize, Deserialize)]
pub struct Preamble {
    #[serde(rename = "type")]
    pub kind: String,
    pub addr: String,
    pub id: String,
    /// Client-facing address of a joining node, used for later
    /// redirects. Absent in plain client requests.
    #[serde(default)]
    pub haddr: String,
}

/// Answer to a `request` preamble. When `leader` is true the two-byte
/// little-endian ephemeral port follows on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionAck {
    pub addr: String,
    pub leader: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BankRequest {
    #[serde(rename = "BankAccount")]
    pub bank_account: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Requisition")]
    pub requisition: String,
    #[serde(rename = "RequisitionData")]
    pub requisition_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BankResponse {
    #[serde(rename = "BankAccount")]
    pub bank_account: String,
    #[serde(rename = "Message")]
    pub message: String,
}

/// Ephemeral port counter for the two-phase handoff. Allocation is a
/// post-increment under the lock; handlers decrement on exit, so the
/// window of live ports stays small and ports are reused.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        PortAllocator {
            base,
            next: Mutex::new(base),
        }
    }

    pub async fn allocate(&self) -> u16 {
        let mut next = self.next.lock().await;
        let port = *next;
        *next = next.checked_add(1).unwrap_or(self.base);
        port
    }

    pub async fn release(&self) {
        let mut next = self.next.lock().await;
        if *next > self.base {
            *next -= 1;
        }
    }
}

/// Everything a session needs, shared across connections.
pub struct SessionContext {
    pub space: SpaceHandle,
    /// This node's advertised client-facing address.
    pub client_addr: String,
    /// Host part of `client_addr`, where ephemeral listeners bind.
    pub bind_host: String,
    pub ports: PortAllocator,
}

/// Accept client sessions forever.
pub async fn run(listener: TcpListener, ctx: Arc<SessionContext>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "client front-end listening");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!(%peer, "session opened");
                    if let Err(err) = handle_session(stream, ctx).await {
                        debug!(%peer, %err, "session closed with error");
                    }
                });
            }
            Err(err) => debug!(%err, "client accept failed"),
        }
    }
}

async fn handle_session(stream: TcpStream, ctx: Arc<SessionContext>) -> Result<()> {
    let mut stream = BufStream::new(stream);
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    let preamble: Preamble = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("malformed preamble: {}", e)))?;

    match preamble.kind.as_str() {
        "join" => handle_join(preamble, ctx).await,
        "request" => handle_request_preamble(stream, ctx).await,
        other => Err(Error::Protocol(format!("unknown session type {:?}", other))),
    }
}

async fn handle_join(preamble: Preamble, ctx: Arc<SessionContext>) -> Result<()> {
    info!(id = %preamble.id, addr = %preamble.addr, "join requested");
    let member = Member::new(preamble.addr, preamble.haddr);
    match ctx.space.join(&preamble.id, member).await {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(id = %preamble.id, %err, "join failed");
            Err(err)
        }
    }
}

async fn handle_request_preamble(
    mut stream: BufStream<TcpStream>,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    if !ctx.space.is_leader() {
        let ack = SessionAck {
            addr: ctx.space.leader_client_addr().unwrap_or_default(),
            leader: false,
        };
        send_json(&mut stream, &ack).await?;
        return Ok(());
    }

    let port = ctx.ports.allocate().await;
    let listener = match TcpListener::bind((ctx.bind_host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(err) => {
            // e.g. the OS still holds the port in TIME_WAIT; the client
            // sees a closed session and retries
            ctx.ports.release().await;
            warn!(port, %err, "ephemeral bind failed");
            return Err(Error::Transport(err));
        }
    };

    let ack = SessionAck {
        addr: ctx.client_addr.clone(),
        leader: true,
    };
    send_json(&mut stream, &ack).await?;
    stream.write_all(&port.to_le_bytes()).await?;
    stream.flush().await?;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let result = handle_one_shot(listener, &ctx).await;
        ctx.ports.release().await;
        if let Err(err) = result {
            debug!(port, %err, "one-shot session failed");
        }
    });
    Ok(())
}

/// Serve exactly one bank request on the handed-off port.
async fn handle_one_shot(listener: TcpListener, ctx: &SessionContext) -> Result<()> {
    let (stream, _) = timeout(HANDOFF_ACCEPT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| Error::Protocol("client never dialed handed-off port".into()))??;
    drop(listener);

    let mut stream = BufStream::new(stream);
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    let request: BankRequest = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))?;

    let message = match process_request(ctx, &request).await {
        Ok(message) => message,
        // recoverable errors surface in the response message
        Err(err @ (Error::Undefined | Error::Codec(_) | Error::Protocol(_))) => err.to_string(),
        Err(err) => return Err(err),
    };

    let response = BankResponse {
        bank_account: request.bank_account,
        message,
    };
    send_json(&mut stream, &response).await
}

async fn process_request(ctx: &SessionContext, request: &BankRequest) -> Result<String> {
    ctx.space
        .write(tuple![
            REQ,
            request.bank_account.as_str(),
            request.password.as_str(),
            request.requisition.as_str(),
            request.requisition_data.as_str()
        ])
        .await?;

    let response_query = tuple![RES, request.bank_account.as_str(), Element::Any];
    let response = timeout(
        RESPONSE_TIMEOUT,
        ctx.space.take_blocking(&response_query, POLL_INTERVAL),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    Ok(response
        .elements()
        .get(2)
        .and_then(Element::as_str)
        .unwrap_or_default()
        .to_string())
}

async fn send_json<T: Serialize>(
    stream: &mut BufStream<TcpStream>,
    value: &T,
) -> Result<()> {
    let mut payload = serde_json::to_vec(value)
        .map_err(|e| Error::Protocol(format!("encoding response: {}", e)))?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}
