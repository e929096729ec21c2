//! Line-oriented console commands

use meshcall_core::{ConnectionRegistry, ConnectionState, Direction, SessionAction};
use serde::Serialize;

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Forward an action to the session
    Action(SessionAction),
    /// Print the session snapshot
    Status,
    /// List identifiers on the network
    Peers,
    /// List registered connections
    Connections,
    /// Print the command list
    Help,
    /// Leave and exit
    Quit,
}

pub const HELP: &str = "\
Commands:
  call <id>   Call a peer
  mute        Toggle microphone
  video       Toggle camera
  share       Toggle screen sharing
  status      Show session state
  peers       List reachable peers
  conns       List connections
  leave       Leave the session
  quit        Leave and exit";

/// Parse one console line
///
/// Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "call" | "c" => match words.next() {
            Some(peer) => ConsoleCommand::Action(SessionAction::Call(peer.to_string())),
            None => return Err("usage: call <id>".to_string()),
        },
        "mute" | "m" => ConsoleCommand::Action(SessionAction::ToggleMute),
        "video" | "v" => ConsoleCommand::Action(SessionAction::ToggleVideo),
        "share" | "s" => ConsoleCommand::Action(SessionAction::ToggleScreenShare),
        "leave" => ConsoleCommand::Action(SessionAction::Leave),
        "status" | "st" => ConsoleCommand::Status,
        "peers" | "p" => ConsoleCommand::Peers,
        "conns" | "connections" => ConsoleCommand::Connections,
        "help" | "h" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}

/// One line of the `conns` listing
#[derive(Debug, Serialize)]
pub struct ConnectionRow {
    pub id: String,
    pub remote: Option<String>,
    pub direction: Direction,
    pub state: ConnectionState,
    pub created_at: String,
    pub open_secs: Option<i64>,
    pub streams: usize,
}

/// Rows for every registered connection, oldest first
pub fn connection_rows(registry: &ConnectionRegistry) -> Vec<ConnectionRow> {
    let mut connections: Vec<_> = registry
        .ids()
        .into_iter()
        .filter_map(|id| registry.get(id))
        .collect();
    connections.sort_by_key(|c| c.created_at());
    connections
        .into_iter()
        .map(|c| ConnectionRow {
            id: c.id().to_string(),
            remote: c.remote_peer().map(ToString::to_string),
            direction: c.direction(),
            state: c.state(),
            created_at: c.created_at().to_rfc3339(),
            open_secs: c.duration().map(|d| d.num_seconds()),
            streams: c.stream_ids().len(),
        })
        .collect()
}
