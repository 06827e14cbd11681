//! lindactl — interactive bank-account client.
//!
//! Reads commands from stdin, runs the two-phase session protocol
//! against the cluster and prints the worker's response. Redirects to
//! the current leader are followed with exponential backoff.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use clap::Parser;
use lindad::session::{BankRequest, BankResponse, Preamble, SessionAck};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "lindactl", version, about = "Tuple-space bank-account client")]
struct Args {
    /// Client-facing address of any cluster node
    #[arg(long, default_value = "localhost:11000")]
    addr: String,
}

fn main() {
    let args = Args::parse();
    print_commands();

    let stdin = std::io::stdin();
    loop {
        print!("Enter command: ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                eprintln!("Error reading command: {}", err);
                return;
            }
        }

        let Some(request) = parse_command(line.trim()) else {
            println!("Invalid command");
            print_commands();
            continue;
        };

        match submit(&args.addr, &request) {
            Ok(response) => println!("{}: {}", response.bank_account, response.message),
            Err(err) => eprintln!("Error: {}", err),
        }
    }
}

fn print_commands() {
    println!("Commands:");
    println!("  <bankAccount> <password> create");
    println!("  <bankAccount> <password> deposit <amount>");
    println!("  <bankAccount> <password> withdraw <amount>");
    println!("  <bankAccount> <password> balance");
    println!("  <bankAccount> <password> delete");
}

fn parse_command(line: &str) -> Option<BankRequest> {
    let args: Vec<&str> = line.split_whitespace().collect();
    if args.len() < 3 {
        return None;
    }
    Some(BankRequest {
        bank_account: args[0].to_string(),
        password: args[1].to_string(),
        requisition: args[2].to_string(),
        requisition_data: args[3..].join(" "),
    })
}

/// Run one full session: find the leader, receive the port handoff and
/// exchange the request on the private port.
fn submit(addr: &str, request: &BankRequest) -> Result<BankResponse, String> {
    let mut target = addr.to_string();
    let mut backoff = INITIAL_BACKOFF;

    for _ in 0..MAX_ATTEMPTS {
        match open_session(&target) {
            Ok((host, port)) => return exchange(&host, port, request),
            Err(SessionError::Redirect(leader)) => {
                println!("Redirected to leader at {}", leader);
                target = leader;
            }
            Err(SessionError::NoLeader) => {
                println!("No leader known yet, retrying...");
            }
            Err(SessionError::Other(err)) => {
                eprintln!("Session error: {}", err);
            }
        }
        std::thread::sleep(backoff);
        backoff *= 2;
    }
    Err("no leader reachable".to_string())
}

enum SessionError {
    Redirect(String),
    NoLeader,
    Other(String),
}

/// Phase one: declare intent and receive the handed-off port.
fn open_session(target: &str) -> Result<(String, u16), SessionError> {
    let stream =
        TcpStream::connect(target).map_err(|e| SessionError::Other(e.to_string()))?;
    let mut stream = BufReader::new(stream);

    let preamble = Preamble {
        kind: "request".to_string(),
        addr: String::new(),
        id: String::new(),
        haddr: String::new(),
    };
    send_json(stream.get_mut(), &preamble).map_err(SessionError::Other)?;

    let mut line = String::new();
    stream
        .read_line(&mut line)
        .map_err(|e| SessionError::Other(e.to_string()))?;
    let ack: SessionAck =
        serde_json::from_str(line.trim()).map_err(|e| SessionError::Other(e.to_string()))?;

    if !ack.leader {
        return if ack.addr.is_empty() {
            Err(SessionError::NoLeader)
        } else {
            Err(SessionError::Redirect(ack.addr))
        };
    }

    let mut port_bytes = [0u8; 2];
    stream
        .read_exact(&mut port_bytes)
        .map_err(|e| SessionError::Other(e.to_string()))?;
    let port = u16::from_le_bytes(port_bytes);

    let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(target);
    Ok((host.to_string(), port))
}

/// Phase two: submit the request on the private port.
fn exchange(host: &str, port: u16, request: &BankRequest) -> Result<BankResponse, String> {
    let stream = TcpStream::connect((host, port)).map_err(|e| e.to_string())?;
    let mut stream = BufReader::new(stream);
    send_json(stream.get_mut(), request)?;

    let mut line = String::new();
    stream.read_line(&mut line).map_err(|e| e.to_string())?;
    serde_json::from_str(line.trim()).map_err(|e| e.to_string())
}

fn send_json<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), String> {
    let mut payload = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    payload.push(b'\n');
    stream.write_all(&payload).map_err(|e| e.to_string())
}
