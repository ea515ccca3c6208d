//! termmesh CLI entry point. Grounded on `happy-cli::main` (clap derive
//! tree, tracing init skipped for the `daemon run` foreground path since
//! that path sets up its own file-logging sink).

mod commands;
mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use termmesh_core::types::SessionKind;
use tracing::error;

#[derive(Parser)]
#[command(name = "termmesh")]
#[command(author, version, about = "Terminal multiplexer daemon with LAN peer federation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Manage locally supervised sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Manage the LAN peer fabric
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon as a detached background process
    Start,
    /// Stop the running daemon
    Stop,
    /// Restart the daemon
    Restart,
    /// Report whether the daemon is running
    Status,
    /// Internal: run the daemon in the foreground. Used by `start`'s
    /// detached child; not meant to be invoked directly in normal use.
    #[clap(hide = true)]
    Run,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List all local sessions
    List,
    /// Create a new session
    Create {
        /// Assistant kind to launch
        #[arg(value_enum)]
        kind: CliSessionKind,
        /// Working directory for the new session
        #[arg(default_value = ".")]
        dir: String,
        /// Optional display name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Close a session's PTY, keeping its record
    Close { id: String },
    /// Remove a session's record entirely
    Remove { id: String },
    /// Restart a closed session
    Restart { id: String },
}

#[derive(Subcommand)]
enum PeerAction {
    /// Show this machine's peer fabric identity and status
    Status,
    /// List discovered peer hosts
    List,
    /// Connect to a discovered peer by instance id
    Connect { instance_id: String },
    /// Disconnect from a connected peer
    Disconnect { instance_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliSessionKind {
    KindA,
    KindB,
}

impl From<CliSessionKind> for SessionKind {
    fn from(kind: CliSessionKind) -> Self {
        match kind {
            CliSessionKind::KindA => SessionKind::KindA,
            CliSessionKind::KindB => SessionKind::KindB,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let is_daemon_run = matches!(cli.command, Commands::Daemon { action: DaemonAction::Run });

    if !is_daemon_run {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(if cli.verbose {
                "termmesh_daemon=debug,termmesh_core=debug,termmesh_crypto=debug"
            } else {
                "termmesh_daemon=info"
            })
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    let result = match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start => commands::daemon::start().await,
            DaemonAction::Stop => commands::daemon::stop().await,
            DaemonAction::Restart => commands::daemon::restart().await,
            DaemonAction::Status => commands::daemon::status().await,
            DaemonAction::Run => commands::daemon::run().await,
        },
        Commands::Session { action } => match action {
            SessionAction::List => commands::session::list().await,
            SessionAction::Create { kind, dir, name } => {
                commands::session::create(kind.into(), dir, name).await
            }
            SessionAction::Close { id } => commands::session::close(id).await,
            SessionAction::Remove { id } => commands::session::remove(id).await,
            SessionAction::Restart { id } => commands::session::restart(id).await,
        },
        Commands::Peer { action } => match action {
            PeerAction::Status => commands::peer::status().await,
            PeerAction::List => commands::peer::list().await,
            PeerAction::Connect { instance_id } => commands::peer::connect(instance_id).await,
            PeerAction::Disconnect { instance_id } => commands::peer::disconnect(instance_id).await,
        },
    };

    if let Err(ref e) = result {
        error!("command failed: {e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    result
}
