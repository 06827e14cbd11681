//! Shared helpers for integration tests: in-process nodes on ephemeral
//! ports and a minimal session-protocol client.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::sleep;

use lindad::node::{Node, NodeConfig};
use lindad::session::{BankRequest, BankResponse, Preamble, SessionAck};

/// Per-test data directory path; not cleaned, so restarts can reuse it.
pub fn test_data_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lindad_test_{}_{}", name, std::process::id()))
}

pub async fn start_node(name: &str, id: &str, join: Option<String>) -> Node {
    let data_dir = test_data_dir(name);
    let _ = std::fs::remove_dir_all(&data_dir);
    let config = NodeConfig {
        data_dir,
        haddr: "127.0.0.1:0".to_string(),
        raddr: "127.0.0.1:0".to_string(),
        id: id.to_string(),
        join,
    };
    Node::start(config).await.expect("node starts")
}

/// Restart against an existing data directory (no cleanup).
pub async fn restart_node(data_dir: PathBuf, id: &str) -> Node {
    let config = NodeConfig {
        data_dir,
        haddr: "127.0.0.1:0".to_string(),
        raddr: "127.0.0.1:0".to_string(),
        id: id.to_string(),
        join: None,
    };
    Node::start(config).await.expect("node restarts")
}

pub async fn wait_for_leader(node: &Node) {
    for _ in 0..150 {
        if node.space.is_leader() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("node never became leader");
}

pub async fn wait_for_voters(node: &Node, expected: usize) {
    for _ in 0..150 {
        let voters = node
            .space
            .raft()
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .count();
        if voters == expected {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("cluster never reached {} voters", expected);
}

pub fn bank_request(account: &str, password: &str, op: &str, operand: &str) -> BankRequest {
    BankRequest {
        bank_account: account.to_string(),
        password: password.to_string(),
        requisition: op.to_string(),
        requisition_data: operand.to_string(),
    }
}

async fn send_line<T: serde::Serialize>(
    stream: &mut BufStream<TcpStream>,
    value: &T,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(value).unwrap();
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.flush().await
}

/// Phase one of the session protocol against one node.
pub async fn open_session(addr: &str) -> SessionOutcome {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut stream = BufStream::new(stream);
    let preamble = Preamble {
        kind: "request".to_string(),
        addr: String::new(),
        id: String::new(),
        haddr: String::new(),
    };
    send_line(&mut stream, &preamble).await.expect("send preamble");

    let mut line = String::new();
    stream.read_line(&mut line).await.expect("read ack");
    let ack: SessionAck = serde_json::from_str(line.trim()).expect("parse ack");

    if !ack.leader {
        return SessionOutcome::Redirect(ack.addr);
    }

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await.expect("read port");
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    SessionOutcome::Handoff(format!("{}:{}", host, u16::from_le_bytes(port_bytes)))
}

pub enum SessionOutcome {
    Redirect(String),
    Handoff(String),
}

/// Full client round-trip: follow at most one redirect, then exchange
/// the bank request on the handed-off port.
pub async fn submit(addr: &str, request: &BankRequest) -> BankResponse {
    let mut target = addr.to_string();
    for _ in 0..2 {
        match open_session(&target).await {
            SessionOutcome::Handoff(private_addr) => {
                let stream = TcpStream::connect(&private_addr)
                    .await
                    .expect("connect handed-off port");
                let mut stream = BufStream::new(stream);
                send_line(&mut stream, request).await.expect("send request");
                let mut line = String::new();
                stream.read_line(&mut line).await.expect("read response");
                return serde_json::from_str(line.trim()).expect("parse response");
            }
            SessionOutcome::Redirect(leader) => {
                assert!(!leader.is_empty(), "redirect without a known leader");
                target = leader;
            }
        }
    }
    panic!("no leader after redirect");
}
