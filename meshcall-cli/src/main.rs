//! Meshcall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{connection_rows, parse_command, ConsoleCommand, HELP};
use meshcall_core::loopback::{LoopbackNetwork, LoopbackSignaling, SyntheticDevices};
use meshcall_core::prelude::*;
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod console;

type LoopbackSession = SessionOrchestrator<SyntheticDevices, LoopbackSignaling>;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Display name (random if omitted)
    #[arg(short, long, env = "MESHCALL_DISPLAY_NAME")]
    name: Option<String>,

    /// Signaling broker host
    #[arg(long, env = "MESHCALL_SIGNALING_HOST", default_value = "localhost")]
    host: String,

    /// Signaling broker port
    #[arg(long, env = "MESHCALL_SIGNALING_PORT", default_value_t = 9000)]
    port: u16,

    /// Signaling broker path
    #[arg(long, env = "MESHCALL_SIGNALING_PATH", default_value = "/peerjs")]
    path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted call between in-process participants
    Demo {
        /// Number of remote participants
        #[arg(long, default_value_t = 2)]
        peers: usize,

        /// Share the screen halfway through
        #[arg(long)]
        share: bool,
    },

    /// Interactive session against in-process echo peers
    Console {
        /// Identifiers of the echo peers to start
        #[arg(long, value_delimiter = ',', default_value = "echo")]
        echo: Vec<String>,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SessionConfig {
        display_name: cli.name.clone().unwrap_or_else(generate_display_name),
        signaling: SignalingConfig {
            host: cli.host.clone(),
            port: cli.port,
            path: cli.path.clone(),
            secure: false,
        },
        ..SessionConfig::default()
    };
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Demo { peers, share } => handle_demo(config, peers, share).await?,
        Commands::Console { echo } => handle_console(config, echo).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn start_session(
    network: &Arc<LoopbackNetwork>,
    config: SessionConfig,
    peer_id: Option<&str>,
) -> Result<LoopbackSession> {
    let mut signaling = LoopbackSignaling::new(network.clone());
    if let Some(id) = peer_id {
        signaling = signaling.with_peer_id(id);
    }
    let mut session = SessionOrchestrator::builder(Arc::new(SyntheticDevices::new()), Arc::new(signaling))
        .with_config(config)
        .build()?;
    session
        .start()
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    Ok(session)
}

async fn settle(sessions: &mut [LoopbackSession]) {
    loop {
        let mut handled = 0;
        for session in sessions.iter_mut() {
            handled += session.drain_pending().await;
        }
        if handled == 0 {
            break;
        }
    }
}

fn print_snapshot(label: &str, session: &LoopbackSession) -> Result<()> {
    println!("{}: {}", label, serde_json::to_string_pretty(&session.snapshot())?);
    Ok(())
}

async fn handle_demo(config: SessionConfig, peers: usize, share: bool) -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut sessions = vec![start_session(&network, config.clone(), None).await?];
    for n in 0..peers {
        let remote = SessionConfig {
            display_name: generate_display_name(),
            ..config.clone()
        };
        sessions.push(start_session(&network, remote, Some(&format!("guest-{}", n + 1))).await?);
    }

    let targets: Vec<String> = sessions[1..]
        .iter()
        .filter_map(|s| s.my_identifier().map(ToString::to_string))
        .collect();
    for target in &targets {
        if let Err(e) = sessions[0].call(target) {
            println!("call to {} failed: {}", target, e.user_message());
        }
    }
    settle(&mut sessions).await;
    print_snapshot("in call", &sessions[0])?;

    if share {
        if let Err(e) = sessions[0].toggle_screen_share().await {
            println!("{}", e.user_message());
        }
        settle(&mut sessions).await;
        print_snapshot("sharing", &sessions[0])?;

        if let Err(e) = sessions[0].toggle_screen_share().await {
            println!("{}", e.user_message());
        }
        settle(&mut sessions).await;
        print_snapshot("camera restored", &sessions[0])?;
    }

    sessions[0].leave();
    settle(&mut sessions).await;
    for (n, session) in sessions.iter().enumerate().skip(1) {
        print_snapshot(&format!("peer {} after leave", n), session)?;
    }
    Ok(())
}

async fn handle_console(config: SessionConfig, echo: Vec<String>) -> Result<()> {
    let network = LoopbackNetwork::new();
    let mut sessions = vec![start_session(&network, config.clone(), None).await?];
    for id in &echo {
        let remote = SessionConfig {
            display_name: id.clone(),
            ..config.clone()
        };
        sessions.push(start_session(&network, remote, Some(id)).await?);
    }

    let mut notices = sessions[0].subscribe();
    println!(
        "Joined as {} ({})",
        sessions[0].config().display_name,
        sessions[0]
            .my_identifier()
            .map_or_else(|| "no id".to_string(), ToString::to_string)
    );
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };

        match command {
            ConsoleCommand::Action(action) => {
                let leaving = action == SessionAction::Leave;
                if let Err(e) = sessions[0].dispatch(action).await {
                    tracing::debug!(error = %e, "Console action failed");
                }
                if leaving {
                    settle(&mut sessions).await;
                    break;
                }
            }
            ConsoleCommand::Status => print_snapshot("status", &sessions[0])?,
            ConsoleCommand::Peers => {
                for id in network.peer_ids() {
                    println!("  {}", id);
                }
            }
            ConsoleCommand::Connections => {
                let rows = connection_rows(sessions[0].connections());
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => break,
        }

        settle(&mut sessions).await;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                SessionNotice::Warning { message } => println!("! {}", message),
                SessionNotice::RemoteStreamsChanged { streams } => {
                    println!("remote streams: {}", streams.join(", "));
                }
                SessionNotice::PeerIdAssigned(id) => println!("identifier: {}", id),
                SessionNotice::Ended => println!("session ended"),
            }
        }
    }

    sessions[0].leave();
    println!("Bye");
    Ok(())
}

fn generate_display_name() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "User-{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        rng.gen_range(100..1000)
    )
}
