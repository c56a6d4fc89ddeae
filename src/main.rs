//! # chunkyard CLI
//!
//! The `chunkyard` binary runs the upload server and offers maintenance
//! commands over the same store and staging area.
//!
//! ## Usage
//!
//! ```bash
//! chunkyard --config ./config/chunkyard.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chunkyard init` | Create the SQLite database and staging directories |
//! | `chunkyard serve` | Start the upload HTTP server |
//! | `chunkyard status <id>` | Print a session's progress as JSON |
//! | `chunkyard assemble <id>` | Assemble a complete session |
//! | `chunkyard cleanup <id>` | Remove a session's staged chunks |
//! | `chunkyard reap` | Purge expired sessions and orphaned staging |
//! | `chunkyard completions <shell>` | Print shell completions |

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;

use chunkyard::config::{self, Config};
use chunkyard::service::UploadService;
use chunkyard::{assembler, logging, migrate, progress, reaper, server};

/// chunkyard: resumable chunked uploads with ordered reassembly.
///
/// All commands except `completions` read a TOML configuration file given
/// by `--config`. See `config/chunkyard.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chunkyard",
    about = "Resumable chunked uploads: session tracking, chunk staging, and ordered reassembly",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chunkyard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and staging directories.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Start the upload HTTP server.
    ///
    /// Binds to `[server].bind` and runs the orphan reaper in the
    /// background. Stops on Ctrl-C.
    Serve,

    /// Print the progress of an upload session as JSON.
    Status {
        /// Upload session id.
        id: String,
    },

    /// Assemble a session whose chunks have all arrived.
    Assemble {
        /// Upload session id.
        id: String,
    },

    /// Remove the staged chunks and partial artifact of a session.
    Cleanup {
        /// Upload session id.
        id: String,

        /// Also delete the session record.
        #[arg(long)]
        cancel: bool,
    },

    /// Purge expired sessions and remove orphaned staging directories.
    Reap {
        /// Override `reaper.grace_secs`.
        #[arg(long)]
        grace_secs: Option<u64>,
    },

    /// Print shell completions to stdout.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "chunkyard", &mut io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging.level);

    let command = match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            tokio::fs::create_dir_all(&cfg.staging.root).await?;
            tokio::fs::create_dir_all(&cfg.staging.artifact_root).await?;
            println!("Database initialized successfully.");
            return Ok(());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
            return Ok(());
        }
        other => other,
    };

    let service = UploadService::open(&cfg).await?;
    let result = run_session_command(&service, &cfg, command).await;
    service.close().await;
    result
}

/// Commands that operate on an open service.
async fn run_session_command(
    service: &UploadService,
    cfg: &Config,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Status { id } => print_json(&progress::get_progress(service, &id).await?),
        Commands::Assemble { id } => print_json(&assembler::assemble(service, &id).await?),
        Commands::Cleanup { id, cancel } => {
            print_json(&assembler::cleanup(service, &id, cancel).await?)
        }
        Commands::Reap { grace_secs } => {
            let grace = Duration::from_secs(grace_secs.unwrap_or(cfg.reaper.grace_secs));
            print_json(&reaper::sweep(service, grace).await?)
        }
        Commands::Init | Commands::Serve | Commands::Completions { .. } => {
            // Handled in main
            unreachable!()
        }
    }
}
