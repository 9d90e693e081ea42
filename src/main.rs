use clap::{Parser, Subcommand};
use hive::serve::{PermissionServeOptions, ServeOptions};
use hive::session::SessionPaths;
use hive::supervisor::{self, StartOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hive", about = "Hierarchical agent-swarm orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a swarm from a configuration file
    Start {
        /// Path to the swarm declaration
        #[arg(default_value = "hive.yml")]
        config: PathBuf,

        /// Initial prompt for the main instance
        #[arg(short, long)]
        prompt: Option<String>,

        /// Run the main instance without a permission gate
        #[arg(long, default_value_t = false)]
        vibe: bool,

        /// Resume a prior session by id
        #[arg(long)]
        session_id: Option<String>,

        /// Isolate instances in git worktrees, optionally with a
        /// custom label
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        worktree: Option<String>,

        /// Mirror the session log to stdout while running
        #[arg(long, default_value_t = false)]
        tail: bool,
    },

    /// List recorded sessions, or summarize one
    Sessions {
        /// Session directory to summarize
        path: Option<PathBuf>,
    },

    /// Serve one instance (spawned by generated manifests)
    #[command(hide = true)]
    Serve {
        #[arg(long)]
        session_path: PathBuf,
        #[arg(long)]
        instance: String,
        #[arg(long, default_value = "user")]
        caller: String,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value_t = false)]
        task_json: bool,
    },

    /// Permission server for one instance (spawned by generated
    /// manifests)
    #[command(hide = true)]
    PermissionStdio {
        #[arg(long)]
        session_path: PathBuf,
        #[arg(long)]
        instance: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Start {
            config,
            prompt,
            vibe,
            session_id,
            worktree,
            tail,
        } => {
            let worktree = worktree.map(|label| {
                if label.is_empty() {
                    None
                } else {
                    Some(label)
                }
            });
            match supervisor::start(StartOptions {
                config_path: config,
                prompt,
                vibe,
                session_id,
                worktree,
                tail_logs: tail,
            })
            .await
            {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        Commands::Sessions { path } => {
            let result = match path {
                Some(path) => supervisor::inspect(&SessionPaths::new(path)),
                None => supervisor::list(),
            };
            match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        Commands::Serve {
            session_path,
            instance,
            caller,
            prompt,
            task_json,
        } => hive::serve::run(ServeOptions {
            session_path,
            instance,
            caller,
            prompt,
            task_json,
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("error: {e}");
            1
        }),
        Commands::PermissionStdio {
            session_path,
            instance,
        } => hive::serve::run_permission_stdio(PermissionServeOptions {
            session_path,
            instance,
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("error: {e}");
            1
        }),
    };
    std::process::exit(code);
}
