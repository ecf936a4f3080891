//! Kickoff - minimalistic task dispatch for heterogeneous compute
//! clusters.
//!
//! One binary for all three roles: `kickoff server` holds the task
//! database, `kickoff worker` pulls and executes matching tasks, and the
//! remaining subcommands enqueue and inspect tasks from anywhere with
//! network access to the server.

use clap::{Parser, Subcommand};
use kickoff_proto::DEFAULT_TASK_SERVER_PORT;
use tracing_subscriber::EnvFilter;

mod commands;
mod utils;

/// Kickoff - task dispatch for heterogeneous compute clusters.
///
/// Tasks are opaque shell commands tagged with the resources they
/// require; workers advertise the resources they have and pull whatever
/// matches. Kickoff transports no payloads and stores no output - your
/// command is responsible for both.
#[derive(Parser)]
#[command(name = "kickoff", version, about, arg_required_else_help = true)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new task
    New {
        /// Server address as host[:port]
        #[arg(long)]
        server: String,

        /// Resource tags a worker must have, e.g. "cuda, big-mem"
        #[arg(long, default_value = "")]
        require: String,

        /// Resource tags a worker should ideally have
        #[arg(long, default_value = "")]
        want: String,

        /// Command line to execute on the worker
        #[arg(required = true, trailing_var_arg = true)]
        cmd: Vec<String>,
    },

    /// Cancel a running task
    Cancel {
        /// Task ID (up to 16 hex digits)
        id: String,

        #[arg(long)]
        server: String,
    },

    /// Show a task's status, schedule, and command
    Info {
        /// Task ID (up to 16 hex digits)
        id: String,

        #[arg(long)]
        server: String,
    },

    /// List all live tasks (works up to 100 tasks)
    List {
        #[arg(long)]
        server: String,
    },

    /// Show server and task counters
    Stats {
        #[arg(long)]
        server: String,
    },

    /// Run a worker that pulls and executes matching tasks
    Worker {
        #[arg(long)]
        server: String,

        /// Resource tags this worker has, e.g. "cuda, avx512"
        #[arg(long, default_value = "")]
        have: String,
    },

    /// Run the task server
    Server {
        #[arg(long, default_value_t = DEFAULT_TASK_SERVER_PORT)]
        port: u16,
    },
}

fn init_tracing(command: &Commands) {
    // Long-running roles narrate at info; one-shot commands stay quiet
    // unless RUST_LOG says otherwise.
    let default_level = match command {
        Commands::Server { .. } | Commands::Worker { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn server_addr(addr: &str) -> anyhow::Result<String> {
    utils::parse_server_addr(addr, DEFAULT_TASK_SERVER_PORT)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::New {
            server,
            require,
            want,
            cmd,
        } => {
            commands::cmd_new(
                &server_addr(&server)?,
                cmd,
                utils::parse_resource_tags(&require),
                utils::parse_resource_tags(&want),
            )
            .await
        }
        Commands::Cancel { id, server } => commands::cmd_cancel(&server_addr(&server)?, &id).await,
        Commands::Info { id, server } => {
            commands::cmd_info(&server_addr(&server)?, &id, cli.json).await
        }
        Commands::List { server } => commands::cmd_list(&server_addr(&server)?, cli.json).await,
        Commands::Stats { server } => commands::cmd_stats(&server_addr(&server)?, cli.json).await,
        Commands::Worker { server, have } => {
            commands::cmd_worker(&server_addr(&server)?, utils::parse_resource_tags(&have)).await
        }
        Commands::Server { port } => commands::cmd_server(port).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(-1);
    }
}
