//! Request worker: consumes request tuples from the space and produces
//! response tuples.
//!
//! Workers are cooperating coroutines whose only communication medium is
//! the tuple space itself. The loop runs on every node but is effective
//! only on the leader; elsewhere every take fails with `NotLeader` and
//! the worker sleeps and retries. Nothing is cached across iterations.
//!
//! Requests are `(REQ, account, password, operation, operand)` tuples;
//! each one yields a `(RES, account, message)` tuple. Account state
//! lives in the space as `(account, password, balance)` tuples.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::space::SpaceHandle;
use crate::tuple;
use crate::tuple::{Element, Tuple};

/// Tag of tuples consumed by workers.
pub const REQ: &str = "REQ";
/// Tag of tuples produced by workers.
pub const RES: &str = "RES";

/// Fallback poll interval when no write signal arrives.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the worker loop forever.
pub async fn run(space: SpaceHandle) {
    info!("worker started");
    let query = tuple![
        REQ,
        Element::Any,
        Element::Any,
        Element::Any,
        Element::Any
    ];
    loop {
        match space.take_blocking(&query, POLL_INTERVAL).await {
            Ok(request) => {
                if let Err(err) = handle_request(&space, &request).await {
                    warn!(%request, %err, "request handling failed");
                }
            }
            Err(Error::NotLeader { .. }) => {
                // not our turn; the leader's worker owns the queue
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(err) => {
                warn!(%err, "worker take failed");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Dispatch one request tuple to the bank-account handler.
async fn handle_request(space: &SpaceHandle, request: &Tuple) -> crate::error::Result<()> {
    let fields: Vec<&str> = request.elements()[1..]
        .iter()
        .filter_map(Element::as_str)
        .collect();
    let [account, password, operation, operand] = fields[..] else {
        warn!(%request, "dropping malformed request tuple");
        return Ok(());
    };

    debug!(account, operation, operand, "processing request");
    let message = apply_operation(space, account, password, operation, operand).await?;
    space.write(tuple![RES, account, message]).await?;
    Ok(())
}

async fn apply_operation(
    space: &SpaceHandle,
    account: &str,
    password: &str,
    operation: &str,
    operand: &str,
) -> crate::error::Result<String> {
    let account_query = tuple![account, password, Element::Any];

    let message = match operation {
        "create" => {
            space.write(tuple![account, password, 0]).await?;
            "Account created".to_string()
        }

        "delete" => match space.take(account_query).await? {
            Some(_) => "Account deleted".to_string(),
            None => "Account not found".to_string(),
        },

        "deposit" => match space.take(account_query).await? {
            Some(stored) => {
                let balance = account_balance(&stored);
                match operand.parse::<i32>().ok().and_then(|n| balance.checked_add(n)) {
                    Some(updated) => {
                        space.write(tuple![account, password, updated]).await?;
                        "Deposit successful".to_string()
                    }
                    None => {
                        space.write(stored).await?;
                        "Invalid amount".to_string()
                    }
                }
            }
            None => "Account not found".to_string(),
        },

        "withdraw" => match space.take(account_query).await? {
            Some(stored) => {
                let balance = account_balance(&stored);
                match operand.parse::<i32>() {
                    Ok(amount) if balance >= amount => {
                        space.write(tuple![account, password, balance - amount]).await?;
                        "Withdrawal successful".to_string()
                    }
                    Ok(_) => {
                        // balance unchanged and still observable
                        space.write(stored).await?;
                        "Insufficient funds".to_string()
                    }
                    Err(_) => {
                        space.write(stored).await?;
                        "Invalid amount".to_string()
                    }
                }
            }
            None => "Account not found".to_string(),
        },

        "balance" => match space.read(account_query).await? {
            Some(stored) => format!("Balance: {}", account_balance(&stored)),
            None => "Account not found".to_string(),
        },

        _ => "Unknown operation".to_string(),
    };
    Ok(message)
}

fn account_balance(stored: &Tuple) -> i32 {
    stored.elements().get(2).and_then(Element::as_int).unwrap_or(0)
}
