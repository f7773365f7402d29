//! duet: two-player story sessions from the terminal.
//!
//! `duet relay` runs the rendezvous relay. `duet host` and `duet join CODE`
//! connect through it and read play commands from stdin.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use duet_core::room_code::DEFAULT_NAMESPACE;
use duet_core::{PeerSession, Role, SyncConfig, SystemClock};
use duet_daemon::{ClientConfig, Command, DirStoryLoader, Driver, RelayServer, VirtualCamera, WsSignaling};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often session and protocol timers are checked.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Two-player narrative sessions over a peer link")]
struct Cli {
    #[command(subcommand)]
    command: Mode,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the rendezvous relay
    Relay {
        /// Address to listen on
        #[arg(short, long, env = "DUET_LISTEN", default_value = "0.0.0.0:9300")]
        listen: String,
    },
    /// Open a room and wait for the other player
    Host(ClientArgs),
    /// Join a room by its code
    Join {
        /// Room code shown to the host
        code: String,
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Relay URL
    #[arg(long, env = "DUET_RELAY_URL", default_value = "ws://127.0.0.1:9300")]
    relay: String,

    /// Directory holding <story>.json files
    #[arg(long, env = "DUET_STORIES_DIR", default_value = "stories")]
    stories: PathBuf,

    /// Signaling namespace shared by both players
    #[arg(long, env = "DUET_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Do not offer camera or microphone
    #[arg(long)]
    no_media: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,duet_daemon=debug"
    } else {
        "info,duet_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Mode::Relay { listen } => run_relay(&listen).await,
        Mode::Host(client) => run_client(client, None).await,
        Mode::Join { code, client } => run_client(client, Some(code)).await,
    }
}

async fn run_relay(listen: &str) -> Result<()> {
    let listener = RelayServer::bind(listen).await?;
    tokio::select! {
        result = RelayServer::new().run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

async fn run_client(args: ClientArgs, join: Option<String>) -> Result<()> {
    let config = ClientConfig::new(&args.relay, args.stories, &args.namespace, !args.no_media)?;
    let role = if join.is_some() { Role::Guest } else { Role::Host };
    let clock = Arc::new(SystemClock);
    let camera = if config.media {
        VirtualCamera::new()
    } else {
        VirtualCamera::disabled()
    };
    let loader = Arc::new(DirStoryLoader::new(&config.stories_dir));

    match loader.list().await {
        Ok(ids) => info!("Stories: {}", ids.join(", ")),
        Err(e) => warn!("Cannot list stories: {}", e),
    }

    let session = PeerSession::new(
        role,
        config.session_config(),
        Arc::new(WsSignaling::new(&config.relay_url)),
        Arc::new(camera),
        clock.clone(),
    );
    let mut driver = Driver::new(session, loader, clock, SyncConfig::default());

    let code = match &join {
        Some(code) => driver.join(code).await?,
        None => driver.host().await?,
    };
    println!("Room code: {}", code);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = driver.next_peer_event() => {
                driver.handle_peer_event(event).await;
            }

            _ = ticker.tick() => {
                driver.tick().await;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(Command::State) => println!("{}", driver.describe()),
                    Ok(command) => {
                        if let Err(e) = driver.execute(command).await {
                            println!("{}", e);
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    driver.close().await;
    Ok(())
}
