//! Operator console: line commands on stdin and a bridge that prints what
//! the network delivers.

use anyhow::{Result, bail};
use farm_network::{
    AlertBridge, Envelope, MessageId, Payload, PeerId, PeerNode, PestDetection,
    UndeliverableNotice,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const DEFAULT_PEST_TYPE: &str = "whitefly";
const DEFAULT_ZONE: &str = "main";

const HELP: &str = "\
Commands:
  connect <addr>                      introduce this node to a neighbor
  add <peer_id> <addr>                register a neighbor directly
  peers                               list known neighbors
  status                              node and store summary
  queue                               messages still waiting for relay
  alert <count> [pest_type] [zone]    raise a pest alert from a trap count
  query <text>                        ask the network a question
  answer <query_id> <text>            reply to a received query
  alerts                              recent alerts sent and received
  help                                this text
  quit                                stop the node and exit";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Empty,
    Help,
    Connect(String),
    AddPeer { peer_id: PeerId, addr: String },
    Peers,
    Status,
    Queue,
    Alert(PestDetection),
    Query(String),
    Answer { query_id: MessageId, text: String },
    Alerts,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match word.to_ascii_lowercase().as_str() {
            "" => Self::Empty,
            "help" | "?" => Self::Help,
            "connect" => match args.as_slice() {
                [addr] => Self::Connect(addr.to_string()),
                _ => bail!("usage: connect <addr>"),
            },
            "add" => match args.as_slice() {
                [peer_id, addr] => Self::AddPeer {
                    peer_id: PeerId::from_string(*peer_id),
                    addr: addr.to_string(),
                },
                _ => bail!("usage: add <peer_id> <addr>"),
            },
            "peers" => Self::Peers,
            "status" => Self::Status,
            "queue" => Self::Queue,
            "alert" => {
                let Some((count, extra)) = args.split_first() else {
                    bail!("usage: alert <count> [pest_type] [zone]");
                };
                let count: u32 = count
                    .parse()
                    .map_err(|_| anyhow::anyhow!("pest count must be a whole number, got {count}"))?;
                if extra.len() > 2 {
                    bail!("usage: alert <count> [pest_type] [zone]");
                }
                let pest_type = extra.first().copied().unwrap_or(DEFAULT_PEST_TYPE);
                let zone = extra.get(1).copied().unwrap_or(DEFAULT_ZONE);
                Self::Alert(PestDetection::new(pest_type, count, zone))
            }
            "query" => {
                if rest.is_empty() {
                    bail!("usage: query <text>");
                }
                Self::Query(rest.to_string())
            }
            "answer" => match rest.split_once(char::is_whitespace) {
                Some((id, text)) if !text.trim().is_empty() => Self::Answer {
                    query_id: MessageId::from(id),
                    text: text.trim().to_string(),
                },
                _ => bail!("usage: answer <query_id> <text>"),
            },
            "alerts" => Self::Alerts,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}', try 'help'"),
        };
        Ok(command)
    }
}

/// Run one command against the node. Returns `false` when the console
/// should exit.
pub async fn execute(node: &PeerNode, command: Command) -> Result<bool> {
    match command {
        Command::Empty => {}
        Command::Help => println!("{HELP}"),
        Command::Connect(addr) => {
            node.connect(&addr).await?;
            println!("Introduced to {addr}");
        }
        Command::AddPeer { peer_id, addr } => {
            node.add_peer(peer_id.clone(), addr.clone()).await;
            println!("Added {peer_id} at {addr}");
        }
        Command::Peers => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("No known peers");
            }
            for entry in peers {
                println!(
                    "  {:<40} {:<24} {:<8} last seen {}",
                    entry.peer_id,
                    entry.address,
                    entry.status,
                    entry.last_seen_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Status => {
            let status = node.status().await;
            println!("Node:    {} ({})", status.name, status.peer_id);
            println!(
                "Listen:  {}",
                status.listen_addr.as_deref().unwrap_or("not running")
            );
            println!(
                "Reach:   {}",
                status.advertised_addr.as_deref().unwrap_or("not running")
            );
            println!(
                "Peers:   {} alive, {} suspect, {} dead",
                status.peers_alive, status.peers_suspect, status.peers_dead
            );
            println!(
                "Store:   {} new, {} queued, {} delivered, {} expired",
                status.store.new, status.store.queued, status.store.delivered, status.store.expired
            );
        }
        Command::Queue => {
            let queued = node.queued();
            if queued.is_empty() {
                println!("Nothing queued");
            }
            for record in queued {
                let pending: Vec<&str> = record.pending.iter().map(PeerId::as_str).collect();
                println!(
                    "  {} {} attempts={} pending=[{}]",
                    record.message_id,
                    record.envelope.kind(),
                    record.attempt_count,
                    pending.join(", ")
                );
            }
        }
        Command::Alert(detection) => {
            let severity = detection.to_alert().severity;
            let id = node.send_alert(&detection).await?;
            println!(
                "Sent {severity} alert {id}: {} x{} in {}",
                detection.pest_type, detection.pest_count, detection.zone
            );
        }
        Command::Query(text) => {
            let id = node.query(text).await?;
            println!("Sent query {id}");
        }
        Command::Answer { query_id, text } => {
            let id = node.answer_query(&query_id, text).await?;
            println!("Sent answer {id} to {query_id}");
        }
        Command::Alerts => {
            let recent = node.recent_alerts();
            if recent.is_empty() {
                println!("No recent alerts");
            }
            for record in recent {
                println!(
                    "  {} {:?} {} {} from {} ({})",
                    record.at.format("%H:%M:%S"),
                    record.direction,
                    record.alert.severity,
                    record.alert.zone,
                    record.origin,
                    record.message_id
                );
            }
        }
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read commands from stdin until `quit`, end of input or Ctrl-C.
pub async fn run(node: &PeerNode) -> Result<()> {
    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                let command = match Command::parse(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                match execute(node, command).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Command failed: {e}");
                        println!("Error: {e}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }
    Ok(())
}

/// Human-readable rendering of a delivered message.
pub fn describe(envelope: &Envelope) -> String {
    match envelope.payload() {
        Payload::PestAlert(alert) => {
            let mut out = format!(
                "[{} ALERT] zone {} from {}",
                alert.severity,
                alert.zone,
                envelope.origin()
            );
            if let (Some(pest), Some(count)) = (&alert.pest_type, alert.pest_count) {
                out.push_str(&format!(": {pest} x{count}"));
            }
            if let Some(note) = &alert.note {
                out.push_str(&format!("\n  note: {note}"));
            }
            for step in alert.severity.recommendations() {
                out.push_str(&format!("\n  - {step}"));
            }
            out
        }
        Payload::Query(query) => format!(
            "[QUERY {}] from {}: {}\n  reply with: answer {} <text>",
            envelope.id(),
            envelope.origin(),
            query.text,
            envelope.id()
        ),
        Payload::QueryResponse(response) => format!(
            "[ANSWER to {}] from {}: {}",
            response.query_id,
            envelope.origin(),
            response.text
        ),
        Payload::Heartbeat(hb) => format!("[HEARTBEAT] {} at {}", envelope.origin(), hb.address),
    }
}

/// Bridge that prints deliveries and undeliverable notices on the console.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleBridge;

impl AlertBridge for ConsoleBridge {
    fn deliver_local(&self, envelope: &Envelope) {
        println!("\n{}", describe(envelope));
    }

    fn undeliverable(&self, notice: &UndeliverableNotice) {
        let unreached: Vec<&str> = notice.unreached.iter().map(PeerId::as_str).collect();
        println!(
            "\n[UNDELIVERABLE] {} {} after {} attempts (unreached: {})",
            notice.envelope.kind(),
            notice.envelope.id(),
            notice.attempts,
            unreached.join(", ")
        );
    }
}
