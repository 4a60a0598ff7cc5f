//! peerchat - Peer-to-peer text chat over WebRTC data channels

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerchat::chat::{ChatClient, ChatHandle, ClientConfig, ClientUpdate, DEFAULT_SERVER_URL};
use peerchat::network::{SignalingClient, WebRtcFactory};

#[derive(Parser)]
#[command(name = "peerchat")]
#[command(about = "Peer-to-peer text chat over WebRTC data channels")]
#[command(version)]
struct Cli {
    /// Signaling server URL (e.g., wss://example.com/ws)
    #[arg(short, long, env = "PEERCHAT_SERVER", default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Name to register with
    #[arg(short, long, env = "PEERCHAT_NAME")]
    name: Option<String>,

    /// STUN/TURN server URL; repeat to use several (defaults to public STUN)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig {
            server_url: self.server,
            name: self.name,
            ..Default::default()
        };
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        config
    }
}

fn setup_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn prompt() {
    print!("chat> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("Commands:");
    println!("  /name <name>   register under a name");
    println!("  /users         list online users");
    println!("  /chat <user>   start a chat with a user");
    println!("  /quit          exit");
    println!("Any other line is sent to the active chat.");
}

/// Print one update from the client task
fn print_update(update: &ClientUpdate, local: Option<&str>) {
    match update {
        ClientUpdate::Users(users) => {
            if users.is_empty() {
                println!("\nNo other users online.");
            } else {
                println!("\nOnline: {}", users.join(", "));
            }
        }
        ClientUpdate::Registered(true) => {}
        ClientUpdate::Registered(false) => {
            println!("\nRegistration rejected. Use /name to pick another name.");
        }
        ClientUpdate::ActivePeer(peer) => println!("\nChatting with {}", peer),
        ClientUpdate::ChannelOpened(peer) => println!("\nConnected to {}", peer),
        ClientUpdate::ChannelClosed(peer) => println!("\nConnection to {} closed", peer),
        ClientUpdate::Message(message) => {
            if Some(message.sender.as_str()) != local {
                println!("\n{}: {}", message.sender, message.body);
            }
        }
    }
    prompt();
}

/// Handle one line of user input; returns false to quit
async fn handle_line(handle: &ChatHandle, line: &str) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }

    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let outcome = match command {
        "/quit" => return Ok(false),
        "/help" => {
            print_help();
            Ok(())
        }
        "/name" => handle.register(argument).await,
        "/users" => {
            let view = handle.view().await?;
            if view.users.is_empty() {
                println!("No other users online.");
            } else {
                for user in &view.users {
                    let marker = if view.active_peer.as_deref() == Some(user) {
                        " (active)"
                    } else {
                        ""
                    };
                    println!("  - {}{}", user, marker);
                }
            }
            Ok(())
        }
        "/chat" if !argument.is_empty() => handle.start_chat(argument).await,
        "/chat" => {
            println!("Usage: /chat <user>");
            Ok(())
        }
        _ if command.starts_with('/') => {
            println!("Unknown command {}. Type /help for a list.", command);
            Ok(())
        }
        _ => handle.send_message(line).await,
    };

    if let Err(e) = outcome {
        println!("Error: {}", e);
    }
    Ok(true)
}

async fn run(config: ClientConfig) -> Result<()> {
    info!("Connecting to signaling server: {}", config.server_url);

    let connection = SignalingClient::new(&config.server_url)
        .connect()
        .await
        .with_context(|| format!("Failed to reach {}", config.server_url))?;

    let factory = Arc::new(WebRtcFactory::new(config.ice_servers.clone()));
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let (handle, mut client_task) = ChatClient::spawn(connection, factory, Some(updates_tx));

    println!("Connected to {}.", config.server_url);
    match config.name.as_deref() {
        Some(name) => handle.register(name).await?,
        None => println!("Pick a name with /name <name>."),
    }
    print_help();
    prompt();

    let mut local = config.name.clone();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }

            Some(update) = updates.recv() => {
                print_update(&update, local.as_deref());
            }

            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&handle, &line).await? {
                            break;
                        }
                        if let Ok(view) = handle.view().await {
                            local = view.name;
                        }
                        prompt();
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }

            _ = &mut client_task => {
                println!("\nSignaling server closed the connection.");
                return Ok(());
            }
        }
    }

    // Dropping the last handle stops the client and closes every session
    drop(handle);
    let _ = client_task.await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = cli.into_config();
    config.validate()?;

    run(config).await
}
