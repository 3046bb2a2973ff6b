//! Console front end: parses stdin commands and prints engine events.

use std::time::SystemTime;

use anyhow::{anyhow, bail};
use thrill_core::{Event, PeerId, PeerRecord, RequestId, ThrillRequest, WithdrawReason};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::actor::{Input, Snapshot};

const HELP: &str = "\
commands:
  start                      start scanning
  stop                       stop scanning
  peers                      list nearby peers
  pending                    list thrills waiting for an answer
  thrill <peer>              send a thrill
  accept <n|id>              accept a pending thrill (number from `pending` or id prefix)
  decline <n|id>             decline a pending thrill
  range <peer> <m> [x y z]   feed a distance (and direction) for a peer
  range <peer> off           the peer moved out of ranging
  status                     show the status line
  quit                       exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Peers,
    Pending,
    Thrill(PeerId),
    Accept(String),
    Decline(String),
    /// `reading` is `None` for `off`.
    Range {
        peer: PeerId,
        reading: Option<Reading>,
    },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub distance_m: f32,
    pub direction: Option<[f32; 3]>,
}

/// What the printer task shows.
pub enum Output {
    Event(Event),
    Notice(String),
}

/// Parse one console line. Blank lines are `Ok(None)`.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let cmd = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "start" => Command::Start,
        "stop" => Command::Stop,
        "peers" => Command::Peers,
        "pending" => Command::Pending,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "thrill" => Command::Thrill(PeerId::new(required(rest, "thrill <peer>")?)),
        "accept" => Command::Accept(required(rest, "accept <n|id>")?.to_owned()),
        "decline" => Command::Decline(required(rest, "decline <n|id>")?.to_owned()),
        "range" => parse_range(rest)?,
        other => bail!("unknown command '{}' (try 'help')", other),
    };
    Ok(Some(cmd))
}

fn required<'a>(rest: &'a str, usage: &str) -> anyhow::Result<&'a str> {
    if rest.is_empty() {
        bail!("usage: {}", usage);
    }
    Ok(rest)
}

fn parse_range(rest: &str) -> anyhow::Result<Command> {
    const USAGE: &str = "usage: range <peer> <meters> [x y z] | range <peer> off";
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let (peer, args) = match parts.split_first() {
        Some((peer, args)) if !args.is_empty() => (PeerId::new(*peer), args),
        _ => bail!(USAGE),
    };
    if args == ["off"] {
        return Ok(Command::Range { peer, reading: None });
    }
    let numbers = args
        .iter()
        .map(|s| s.parse::<f32>())
        .collect::<Result<Vec<f32>, _>>()
        .map_err(|_| anyhow!(USAGE))?;
    let reading = match numbers.as_slice() {
        [d] => Reading {
            distance_m: *d,
            direction: None,
        },
        [d, x, y, z] => Reading {
            distance_m: *d,
            direction: Some([*x, *y, *z]),
        },
        _ => bail!(USAGE),
    };
    Ok(Command::Range {
        peer,
        reading: Some(reading),
    })
}

/// Pick a pending request by its 1-based position or a case-insensitive id prefix.
pub fn resolve_request(pending: &[ThrillRequest], selector: &str) -> anyhow::Result<RequestId> {
    if let Ok(n) = selector.parse::<usize>() {
        if let Some(r) = n.checked_sub(1).and_then(|i| pending.get(i)) {
            return Ok(r.id);
        }
    }
    let needle = selector.to_ascii_lowercase();
    let mut matches = pending
        .iter()
        .filter(|r| r.id.to_string().starts_with(&needle));
    match (matches.next(), matches.next()) {
        (Some(r), None) => Ok(r.id),
        (Some(_), Some(_)) => bail!("'{}' matches more than one pending thrill", selector),
        (None, _) => bail!("no pending thrill matches '{}'", selector),
    }
}

/// Read commands from stdin until `quit` or EOF. Listing commands are answered from the
/// latest snapshot; everything else goes to the actor.
pub async fn run_console(
    inputs: mpsc::UnboundedSender<Input>,
    snapshots: watch::Receiver<Snapshot>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        match cmd {
            Command::Help => println!("{}", HELP),
            Command::Status => {
                let s = snapshots.borrow();
                let scanning = if s.scanning { "scanning" } else { "idle" };
                println!("{} ({})", s.status, scanning);
            }
            Command::Peers => print_peers(&snapshots.borrow().peers),
            Command::Pending => print_pending(&snapshots.borrow().pending),
            cmd => {
                let quit = cmd == Command::Quit;
                if inputs.send(Input::Command(cmd)).is_err() || quit {
                    return Ok(());
                }
            }
        }
    }
    let _ = inputs.send(Input::Command(Command::Quit));
    Ok(())
}

fn print_peers(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("no peers");
        return;
    }
    for p in peers {
        println!("  {}", describe_peer(p));
    }
}

fn describe_peer(p: &PeerRecord) -> String {
    let distance = match p.last_distance_m {
        Some(d) => format!("{:.1} m", d),
        None => "-".to_owned(),
    };
    let reach = if p.can_interact() { "in range" } else { "" };
    let state = format!("{:?}", p.connection_state);
    format!("{:<20} {:<12} {:>8}  {}", p.peer_id.as_str(), state, distance, reach)
        .trim_end()
        .to_owned()
}

fn print_pending(pending: &[ThrillRequest]) {
    if pending.is_empty() {
        println!("no pending thrills");
        return;
    }
    let now = SystemTime::now();
    for (i, r) in pending.iter().enumerate() {
        let age = now.duration_since(r.created_at).map(|d| d.as_secs()).unwrap_or(0);
        println!("  {}. {} from {} ({}s ago)", i + 1, short_id(&r.id), r.from_name, age);
    }
}

fn short_id(id: &RequestId) -> String {
    id.to_string().chars().take(8).collect()
}

/// Text for an event, or `None` for events only the snapshot needs.
fn render(event: &Event) -> Option<String> {
    match event {
        Event::StatusChanged(text) => Some(format!("* {}", text)),
        Event::RequestReceived(r) => Some(format!(
            "! {} wants to thrill you: 'accept {}' or 'decline {}'",
            r.from_name,
            short_id(&r.id),
            short_id(&r.id)
        )),
        Event::RequestWithdrawn {
            request_id, reason, ..
        } => {
            let why = match reason {
                WithdrawReason::Superseded => "replaced by a newer one",
                WithdrawReason::Expired => "expired",
            };
            Some(format!("- thrill {} {}", short_id(request_id), why))
        }
        Event::PeerDiscovered(p) => Some(format!("+ {}", p.peer_id)),
        Event::PeerLost(peer) => Some(format!("- {}", peer)),
        Event::PeerUpdated(_)
        | Event::RequestResolved { .. }
        | Event::ResponseReceived { .. } => None,
    }
}

pub async fn print_output(mut rx: mpsc::UnboundedReceiver<Output>) {
    while let Some(out) = rx.recv().await {
        match out {
            Output::Event(event) => {
                if let Some(line) = render(&event) {
                    println!("{}", line);
                }
            }
            Output::Notice(text) => println!("{}", text),
        }
    }
}
