//! Single-node end-to-end tests: replicated primitives, the bank
//! scenarios over real TCP sessions, and snapshot-based restart.

mod common;

use common::{bank_request, restart_node, start_node, submit, wait_for_leader};
use lindad::tuple;
use lindad::tuple::Element;

#[tokio::test]
async fn test_replicated_write_read_take() {
    let node = start_node("prims", "n1", None).await;
    wait_for_leader(&node).await;

    assert!(node.space.write(tuple!["job", 1, 0.5]).await.unwrap());

    // a committed write is observable through read, twice
    let q = tuple!["job", Element::Any, Element::Any];
    assert_eq!(
        node.space.read(q.clone()).await.unwrap(),
        Some(tuple!["job", 1, 0.5])
    );
    assert!(node.space.read(q.clone()).await.unwrap().is_some());

    // take removes; a second take finds nothing
    assert!(node.space.take(q.clone()).await.unwrap().is_some());
    assert_eq!(node.space.take(q).await.unwrap(), None);

    node.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_take_yields_exactly_one() {
    let node = start_node("race", "n1", None).await;
    wait_for_leader(&node).await;

    assert!(node.space.write(tuple!["contested"]).await.unwrap());

    let space_a = node.space.clone();
    let space_b = node.space.clone();
    let (a, b) = tokio::join!(
        space_a.take(tuple!["contested"]),
        space_b.take(tuple!["contested"]),
    );
    let wins = [a.unwrap(), b.unwrap()];
    assert_eq!(wins.iter().filter(|t| t.is_some()).count(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_write_undefined_rejected() {
    let node = start_node("undef", "n1", None).await;
    wait_for_leader(&node).await;

    assert!(node.space.write(tuple![Element::Any]).await.is_err());
    assert!(node.space.take(tuple![Element::None]).await.is_err());

    node.shutdown().await;
}

#[tokio::test]
async fn test_bank_create_and_balance() {
    let node = start_node("create", "n1", None).await;
    wait_for_leader(&node).await;
    let addr = node.client_addr().to_string();

    let response = submit(&addr, &bank_request("1234", "pass", "create", "")).await;
    assert_eq!(response.bank_account, "1234");
    assert_eq!(response.message, "Account created");

    let response = submit(&addr, &bank_request("1234", "pass", "balance", "")).await;
    assert_eq!(response.message, "Balance: 0");

    node.shutdown().await;
}

#[tokio::test]
async fn test_bank_deposit_then_balance() {
    let node = start_node("deposit", "n1", None).await;
    wait_for_leader(&node).await;
    let addr = node.client_addr().to_string();

    submit(&addr, &bank_request("1234", "pass", "create", "")).await;
    let response = submit(&addr, &bank_request("1234", "pass", "deposit", "100")).await;
    assert_eq!(response.message, "Deposit successful");

    let response = submit(&addr, &bank_request("1234", "pass", "balance", "")).await;
    assert_eq!(response.message, "Balance: 100");

    node.shutdown().await;
}

#[tokio::test]
async fn test_bank_withdraw_insufficient_funds() {
    let node = start_node("withdraw", "n1", None).await;
    wait_for_leader(&node).await;
    let addr = node.client_addr().to_string();

    submit(&addr, &bank_request("1234", "pass", "create", "")).await;
    submit(&addr, &bank_request("1234", "pass", "deposit", "100")).await;

    let response = submit(&addr, &bank_request("1234", "pass", "withdraw", "250")).await;
    assert_eq!(response.message, "Insufficient funds");

    // the balance must remain observable and unchanged
    let response = submit(&addr, &bank_request("1234", "pass", "balance", "")).await;
    assert_eq!(response.message, "Balance: 100");

    let response = submit(&addr, &bank_request("1234", "pass", "withdraw", "40")).await;
    assert_eq!(response.message, "Withdrawal successful");
    let response = submit(&addr, &bank_request("1234", "pass", "balance", "")).await;
    assert_eq!(response.message, "Balance: 60");

    node.shutdown().await;
}

#[tokio::test]
async fn test_bank_wrong_password_and_delete() {
    let node = start_node("delete", "n1", None).await;
    wait_for_leader(&node).await;
    let addr = node.client_addr().to_string();

    submit(&addr, &bank_request("1234", "pass", "create", "")).await;

    let response = submit(&addr, &bank_request("1234", "wrong", "balance", "")).await;
    assert_eq!(response.message, "Account not found");

    let response = submit(&addr, &bank_request("1234", "pass", "delete", "")).await;
    assert_eq!(response.message, "Account deleted");
    let response = submit(&addr, &bank_request("1234", "pass", "balance", "")).await;
    assert_eq!(response.message, "Account not found");

    node.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_restart_recovers_tuples() {
    let node = start_node("snapshot", "n1", None).await;
    wait_for_leader(&node).await;
    let data_dir = common::test_data_dir("snapshot");

    for i in 0..50 {
        assert!(node.space.write(tuple!["persisted", i]).await.unwrap());
    }
    node.space.trigger_snapshot().await.unwrap();
    // give the snapshot builder a moment to hit the disk
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    node.shutdown().await;

    let node = restart_node(data_dir, "n1").await;
    wait_for_leader(&node).await;
    for i in 0..50 {
        assert_eq!(
            node.space.read(tuple!["persisted", i]).await.unwrap(),
            Some(tuple!["persisted", i]),
            "tuple {} lost across restart",
            i
        );
    }

    node.shutdown().await;
}
