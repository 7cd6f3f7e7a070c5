//! Ferry CLI - managed file transfers from the command line
//!
//! Runs a host (`serve`), queues and drives transfers, controls remote
//! hosts and watches spooled directories.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ferry - managed, resumable file transfers
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory of this host
    #[arg(long, env = "FERRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default settings and register this host
    Init {
        /// Identity of this host
        #[arg(long)]
        host_id: String,

        /// Address to accept connections on
        #[arg(long, default_value = "0.0.0.0:6666")]
        listen: String,

        /// Shared secret peers use to authenticate this host
        #[arg(long, env = "FERRY_HOST_KEY")]
        key: String,
    },

    /// Accept connections and run queued transfers until shut down
    Serve,

    /// Queue a transfer for the commander
    Submit {
        #[command(flatten)]
        transfer: TransferArgs,

        /// Not started before this time (RFC 3339)
        #[arg(long)]
        start: Option<String>,

        /// Wait for the transfer to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Run a transfer now and wait for it
    Send {
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show one transfer
    Status {
        #[command(flatten)]
        target: TransferRef,
    },

    /// List transfers, most recent first
    List {
        /// Filter by status (tosubmit, running, interrupted, done, inerror)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by rule
        #[arg(short, long)]
        rule: Option<String>,

        /// Maximum rows, 0 for all
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Stop a transfer, keeping it resumable
    Stop {
        #[command(flatten)]
        target: TransferRef,
    },

    /// Cancel a transfer for good
    Cancel {
        #[command(flatten)]
        target: TransferRef,
    },

    /// Queue an interrupted or failed transfer again
    Restart {
        #[command(flatten)]
        target: TransferRef,
    },

    /// Delete a finished transfer
    Delete {
        #[command(flatten)]
        target: TransferRef,
    },

    /// Delete finished transfers older than some days
    Purge {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Show or change this host's bandwidth limits
    Bandwidth {
        #[command(flatten)]
        limits: BandwidthArgs,
    },

    /// Send a control request to a remote host
    Remote {
        /// Remote host id
        host: String,

        #[command(subcommand)]
        action: RemoteAction,
    },

    /// Rule management
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Known hosts management
    Host {
        #[command(subcommand)]
        action: HostAction,
    },

    /// Watch directories and send their stable files until the stop file
    /// appears
    Spool {
        #[command(flatten)]
        spool: SpoolArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Rule to apply
    rule: String,

    /// Remote host id
    host: String,

    /// File to send or fetch
    file: String,

    /// Free text or JSON stored with the transfer
    #[arg(long, default_value = "")]
    info: String,

    /// Check an end-to-end digest
    #[arg(long)]
    digest: bool,

    /// Block size in bytes
    #[arg(long)]
    blocksize: Option<u32>,

    /// Reuse a transfer id
    #[arg(long)]
    id: Option<i64>,
}

/// A transfer is named by its id and the remote host
#[derive(Args)]
struct TransferRef {
    /// Transfer id
    id: i64,

    /// Remote host id
    remote: String,

    /// The remote host requested the transfer
    #[arg(long)]
    passive: bool,
}

#[derive(Args, Default)]
struct BandwidthArgs {
    /// Process-wide read cap in bytes/s, 0 for none
    #[arg(long)]
    global_read: Option<u64>,

    /// Process-wide write cap in bytes/s, 0 for none
    #[arg(long)]
    global_write: Option<u64>,

    /// Per-channel read cap in bytes/s, 0 for none
    #[arg(long)]
    session_read: Option<u64>,

    /// Per-channel write cap in bytes/s, 0 for none
    #[arg(long)]
    session_write: Option<u64>,

    /// Shaping granularity in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Stop a transfer on the remote host
    Stop {
        id: i64,
        /// The remote host requested the transfer
        #[arg(long)]
        passive: bool,
    },

    /// Cancel a transfer on the remote host
    Cancel {
        id: i64,
        #[arg(long)]
        passive: bool,
    },

    /// Show or change the remote limits
    Bandwidth {
        #[command(flatten)]
        limits: BandwidthArgs,
    },

    /// Shut the remote host down
    Shutdown {
        /// Ask it to come back up
        #[arg(long)]
        restart: bool,
    },

    /// Refuse new transfers on the remote host
    Block,

    /// Accept new transfers again
    Unblock,

    /// Check the remote host answers
    Test {
        #[arg(default_value = "ping")]
        message: String,
    },

    /// Ask about remote files or a transfer
    Info {
        kind: InfoArg,

        /// Rule whose directory is looked at
        #[arg(long, default_value = "")]
        rule: String,

        /// File name or glob pattern
        #[arg(long)]
        file: Option<String>,

        /// Transfer id, for `transfer`
        #[arg(long)]
        id: Option<i64>,
    },

    /// Run a named business handler
    Business {
        name: String,
        #[arg(default_value = "")]
        args: String,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum InfoArg {
    Exist,
    List,
    MlsDetail,
    MlsList,
    Transfer,
}

#[derive(Subcommand)]
enum RuleAction {
    /// List rules
    List,

    /// Add or replace a rule
    Add {
        id: String,

        /// Direction seen from the requester
        #[arg(long, default_value = "send")]
        direction: DirectionArg,

        /// direct, send-through or recv-through
        #[arg(long, default_value = "direct")]
        mode: String,

        /// Hosts allowed to use the rule, all when empty
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,

        #[arg(long)]
        recv_path: Option<PathBuf>,

        #[arg(long)]
        send_path: Option<PathBuf>,

        #[arg(long)]
        work_path: Option<PathBuf>,
    },

    /// Remove a rule
    Remove { id: String },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum DirectionArg {
    Send,
    Recv,
}

#[derive(Subcommand)]
enum HostAction {
    /// List known hosts
    List,

    /// Add or replace a host
    Add {
        id: String,

        #[arg(long)]
        address: String,

        #[arg(long, default_value_t = 6666)]
        port: u16,

        /// Shared secret of that host
        #[arg(long)]
        key: String,

        /// Connect over TLS
        #[arg(long)]
        ssl: bool,

        /// The host never accepts connections
        #[arg(long)]
        client: bool,

        /// Granted roles (transfer, control, read, system, business)
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// Remove a host
    Remove { id: String },
}

#[derive(Args)]
struct SpoolArgs {
    /// JSON file holding the whole spool configuration
    #[arg(long, conflicts_with_all = ["dir", "rule", "host"])]
    config: Option<PathBuf>,

    /// Directory to watch, repeatable
    #[arg(long)]
    dir: Vec<PathBuf>,

    /// Rule used for every transfer
    #[arg(long)]
    rule: Option<String>,

    /// Target host, repeatable
    #[arg(long)]
    host: Vec<String>,

    #[arg(long)]
    status_file: Option<PathBuf>,

    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Only file names matching this regex
    #[arg(long)]
    regex: Option<String>,

    #[arg(long)]
    recursive: bool,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    elapse_ms: u64,

    /// Smaller files are ignored
    #[arg(long, default_value_t = 1)]
    min_size: u64,

    /// Run transfers directly instead of queueing them
    #[arg(long)]
    direct: bool,

    /// Transfers handed over at once
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Send files again when their content changes
    #[arg(long)]
    resend_changed: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(ferry_core::FerryCore::default_data_dir);

    match cli.command {
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "ferry", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init { host_id, listen, key } => {
            return commands::init(&data_dir, &host_id, &listen, &key, cli.output).await;
        }
        Commands::Serve => return commands::serve(&data_dir).await,
        _ => {}
    }

    let core = ferry_core::FerryCore::open(&data_dir).await?;

    match cli.command {
        Commands::Submit { transfer, start, wait } => {
            commands::submit(&core, transfer, start, wait, cli.output).await?
        }
        Commands::Send { transfer } => commands::send(&core, transfer, cli.output).await?,
        Commands::Status { target } => commands::status(&core, target, cli.output).await?,
        Commands::List { status, rule, limit } => {
            commands::list(&core, status, rule, limit, cli.output).await?
        }
        Commands::Stop { target } => commands::stop(&core, target, cli.output).await?,
        Commands::Cancel { target } => commands::cancel(&core, target, cli.output).await?,
        Commands::Restart { target } => commands::restart(&core, target, cli.output).await?,
        Commands::Delete { target } => commands::delete(&core, target).await?,
        Commands::Purge { days } => commands::purge(&core, days, cli.output).await?,
        Commands::Bandwidth { limits } => commands::bandwidth(&core, limits, cli.output).await?,
        Commands::Remote { host, action } => commands::remote(&core, &host, action, cli.output).await?,
        Commands::Rule { action } => commands::rule_action(&core, action, cli.output).await?,
        Commands::Host { action } => commands::host_action(&core, action, cli.output).await?,
        Commands::Spool { spool } => commands::spool(&core, spool, cli.output).await?,
        Commands::Completions { .. } | Commands::Init { .. } | Commands::Serve => {}
    }

    Ok(())
}
