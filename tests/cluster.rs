//! Multi-node tests: follower redirect, join idempotence and
//! replication across members.

mod common;

use common::{
    bank_request, open_session, start_node, submit, wait_for_leader, wait_for_voters,
    SessionOutcome,
};
use lindad::session::Preamble;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn send_join(seed: &str, id: &str, raddr: &str, haddr: &str) {
    let preamble = Preamble {
        kind: "join".to_string(),
        addr: raddr.to_string(),
        id: id.to_string(),
        haddr: haddr.to_string(),
    };
    let mut payload = serde_json::to_vec(&preamble).unwrap();
    payload.push(b'\n');
    let mut stream = TcpStream::connect(seed).await.expect("connect seed");
    stream.write_all(&payload).await.expect("send join");
    stream.shutdown().await.ok();
}

#[tokio::test]
async fn test_follower_redirects_to_leader() {
    let seed = start_node("redirect_a", "a", None).await;
    wait_for_leader(&seed).await;
    let seed_addr = seed.client_addr().to_string();

    let follower = start_node("redirect_b", "b", Some(seed_addr.clone())).await;
    wait_for_voters(&seed, 2).await;

    // a request preamble on the follower names the leader and closes
    let follower_addr = follower.client_addr().to_string();
    match open_session(&follower_addr).await {
        SessionOutcome::Redirect(leader) => assert_eq!(leader, seed_addr),
        SessionOutcome::Handoff(_) => panic!("follower handed off a port"),
    }

    // reconnecting to the named leader succeeds end to end
    let response = submit(&follower_addr, &bank_request("77", "pw", "create", "")).await;
    assert_eq!(response.message, "Account created");

    follower.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_write_on_follower_fails_not_leader() {
    let seed = start_node("notleader_a", "a", None).await;
    wait_for_leader(&seed).await;
    let follower = start_node(
        "notleader_b",
        "b",
        Some(seed.client_addr().to_string()),
    )
    .await;
    wait_for_voters(&seed, 2).await;

    let err = follower
        .space
        .write(lindad::tuple!["x"])
        .await
        .expect_err("follower must reject writes");
    match err {
        lindad::Error::NotLeader { leader } => {
            assert_eq!(leader.as_deref(), Some(seed.client_addr().to_string().as_str()));
        }
        other => panic!("expected NotLeader, got {}", other),
    }

    follower.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let seed = start_node("idem_a", "a", None).await;
    wait_for_leader(&seed).await;
    let seed_addr = seed.client_addr().to_string();

    let joiner = start_node("idem_b", "b", Some(seed_addr.clone())).await;
    wait_for_voters(&seed, 2).await;

    // the same join again leaves the configuration unchanged
    send_join(
        &seed_addr,
        "b",
        &joiner.raft_addr().to_string(),
        &joiner.client_addr().to_string(),
    )
    .await;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    wait_for_voters(&seed, 2).await;

    joiner.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_three_node_replication() {
    let seed = start_node("repl_a", "a", None).await;
    wait_for_leader(&seed).await;
    let seed_addr = seed.client_addr().to_string();

    let b = start_node("repl_b", "b", Some(seed_addr.clone())).await;
    wait_for_voters(&seed, 2).await;
    let c = start_node("repl_c", "c", Some(seed_addr.clone())).await;
    wait_for_voters(&seed, 3).await;

    let response = submit(&seed_addr, &bank_request("900", "pw", "create", "")).await;
    assert_eq!(response.message, "Account created");
    let response = submit(&seed_addr, &bank_request("900", "pw", "deposit", "42")).await;
    assert_eq!(response.message, "Deposit successful");

    // a session against any member lands on the leader and observes
    // the committed state
    let response = submit(
        &c.client_addr().to_string(),
        &bank_request("900", "pw", "balance", ""),
    )
    .await;
    assert_eq!(response.message, "Balance: 42");

    c.shutdown().await;
    b.shutdown().await;
    seed.shutdown().await;
}
