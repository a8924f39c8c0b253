//! Chimera CLI - drive the memory core from a terminal

mod transcript;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use chimera_core::prelude::*;

#[derive(Parser)]
#[command(name = "chimera")]
#[command(about = "Chimera conversation memory CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); defaults to chimera.toml plus CHIMERA_* variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log every memory event as JSON
    #[arg(long, global = true, env = "CHIMERA_LOG_EVENTS")]
    log_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the memory core interactively
    Repl {
        /// User the conversation belongs to
        #[arg(short, long, default_value_t = 1)]
        user_id: UserId,

        /// Mode tag stored with every turn
        #[arg(short, long, default_value = "auto")]
        mode: String,
    },
    /// Feed a JSONL transcript through the memory core
    Replay {
        /// Transcript path
        path: PathBuf,

        /// Print the final context window of every user
        #[arg(long)]
        show_context: bool,
    },
    /// List durable long-term turns of a user
    Ltm {
        /// User to inspect
        #[arg(short, long)]
        user_id: UserId,

        /// Maximum number of turns
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
    /// Version information
    Version,
}

fn load_config(path: Option<&Path>) -> Result<ChimeraConfig> {
    let config = match path {
        Some(path) => ChimeraConfig::from_file(path),
        None => ChimeraConfig::load(),
    };
    config.context("failed to load configuration")
}

async fn start_actor(config: &ChimeraConfig, log_events: bool) -> Result<MemoryActor> {
    let backend = chimera_core::persistence::backend_from_config(&config.storage);
    let mut builder = MemoryActor::builder(config.memory.clone(), backend);
    if log_events {
        builder = builder.hook(Arc::new(LoggingHook));
    }

    let actor = builder.build()?;
    actor
        .initialize()
        .await
        .with_context(|| format!("failed to open store at {}", config.storage.url))?;
    Ok(actor)
}

fn print_ack(ack: &StoreAck) {
    println!(
        "#{} importance={}{}{}",
        ack.sequence,
        ack.importance,
        if ack.promotion_scheduled { " promoted" } else { "" },
        if ack.evicted > 0 {
            format!(" evicted={}", ack.evicted)
        } else {
            String::new()
        }
    );
}

async fn repl(actor: &MemoryActor, user_id: UserId, mode: &str) -> Result<()> {
    println!("Type a message to store it. Commands: /bot <text>, /context, /turns, /stats, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line {
            "/quit" | "/exit" => break,
            "/context" => actor.get_context(user_id).await.map(|window| {
                println!("{}", window.text);
                println!(
                    "-- {} turns, {} chars, {} dropped",
                    window.turns.len(),
                    window.char_len(),
                    window.dropped
                );
            }),
            "/turns" => actor.get_turns(user_id).await.map(|turns| {
                for turn in turns {
                    println!(
                        "#{} [{}] importance={} promoted={} {}",
                        turn.sequence,
                        turn.role,
                        turn.importance.unwrap_or_default(),
                        turn.promoted,
                        turn.content
                    );
                }
            }),
            "/stats" => {
                actor.flush().await;
                serde_json::to_string_pretty(&actor.gateway_stats())
                    .map(|json| println!("{}", json))
                    .map_err(MemoryError::from)
            }
            _ => {
                let stored = match line.strip_prefix("/bot ") {
                    Some(reply) => actor.store_bot_response(user_id, reply, mode).await,
                    None => actor.store_user_message(user_id, line, mode).await,
                };
                stored.map(|ack| print_ack(&ack))
            }
        };

        // validation errors are reported and the session continues
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
    }
    Ok(())
}

async fn replay(actor: &MemoryActor, path: &Path, show_context: bool) -> Result<()> {
    let lines = transcript::load(path).await?;
    let mut users: Vec<UserId> = Vec::new();
    let mut rejected = 0usize;

    for line in &lines {
        let result = match line.role {
            Role::User => {
                actor
                    .store_user_message(line.user_id, line.content.as_str(), line.mode.as_str())
                    .await
            }
            Role::Assistant => {
                actor
                    .store_bot_response(line.user_id, line.content.as_str(), line.mode.as_str())
                    .await
            }
        };
        match result {
            Ok(_) => {
                if !users.contains(&line.user_id) {
                    users.push(line.user_id);
                }
            }
            Err(MemoryError::Validation(reason)) => {
                tracing::warn!(user_id = line.user_id, %reason, "Skipping transcript line");
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    actor.flush().await;

    println!(
        "replayed {} turns for {} users ({} rejected)",
        lines.len() - rejected,
        users.len(),
        rejected
    );
    if show_context {
        for user_id in users {
            let window = actor.get_context(user_id).await?;
            println!("== user {} ==", user_id);
            println!("{}", window.text);
        }
    }
    println!("{}", serde_json::to_string_pretty(&actor.gateway_stats())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("chimera {}", env!("CARGO_PKG_VERSION"));
            println!("chimera-core {}", chimera_core::VERSION);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Repl { user_id, mode } => {
            let config = load_config(cli.config.as_deref())?;
            let actor = start_actor(&config, cli.log_events).await?;
            let result = repl(&actor, user_id, &mode).await;
            actor.shutdown().await?;
            result?;
        }
        Commands::Replay { path, show_context } => {
            let config = load_config(cli.config.as_deref())?;
            let actor = start_actor(&config, cli.log_events).await?;
            let result = replay(&actor, &path, show_context).await;
            actor.shutdown().await?;
            result?;
        }
        Commands::Ltm { user_id, limit } => {
            let config = load_config(cli.config.as_deref())?;
            let actor = start_actor(&config, cli.log_events).await?;
            let turns = actor.recent_long_term(user_id, limit).await;
            actor.shutdown().await?;
            for turn in turns? {
                println!(
                    "{} #{} [{}] importance={} {}",
                    turn.created_at.format("%Y-%m-%d %H:%M:%S"),
                    turn.sequence,
                    turn.role,
                    turn.importance.unwrap_or_default(),
                    turn.content
                );
            }
        }
    }

    Ok(())
}
