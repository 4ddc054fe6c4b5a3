use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use progeny::config::ProgenyConfig;
use progeny::logging::{self, LogOptions};
use progeny::spinner::models::SelectorParts;

mod cmd;

#[derive(Parser)]
#[command(name = "progeny")]
#[command(version, about = "Spin up and reap per-user annotation tool instances")]
pub struct Cli {
    /// Path to progeny.toml (defaults to ./progeny.toml)
    #[arg(long, global = true, env = "PROGENY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP management server
    Serve {
        /// Interface to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Launch an instance for a user
    Spin(SpinArgs),
    /// Terminate the sessions matching one selector
    Cleanup {
        #[command(flatten)]
        selector: SelectorArgs,
    },
    /// List live sessions, optionally filtered by one selector
    List {
        #[command(flatten)]
        selector: SelectorArgs,
    },
    /// Prune registry rows whose process is gone
    Reconcile,
    /// List prebaked projects
    Prebaked,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct SpinArgs {
    #[arg(short, long)]
    pub username: String,

    /// Session name (defaults to the username)
    #[arg(short, long)]
    pub session_name: Option<String>,

    /// Append -2, -3, ... when the session name is taken
    #[arg(long)]
    pub uniquify: bool,

    /// Raw recipe command line, e.g. "textcat.manual db data.jsonl"
    #[arg(long, conflicts_with_all = ["prebaked", "recipe"])]
    pub command: Option<String>,

    /// Name of a prebaked project
    #[arg(long, conflicts_with = "recipe")]
    pub prebaked: Option<String>,

    /// Recipe name, used with --arg and --kwarg
    #[arg(long)]
    pub recipe: Option<String>,

    /// Positional recipe argument (repeatable)
    #[arg(long = "arg", requires = "recipe")]
    pub args: Vec<String>,

    /// Recipe keyword argument as KEY=VALUE (repeatable)
    #[arg(long = "kwarg", requires = "recipe")]
    pub kwargs: Vec<String>,

    /// Tool config override as KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(long = "set", id = "set")]
    pub config: Vec<String>,
}

#[derive(Args, Clone, Default)]
pub struct SelectorArgs {
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub session_name: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    /// Sessions started more than this many seconds ago
    #[arg(long, value_name = "SECS")]
    pub older_than: Option<u64>,
}

impl SelectorArgs {
    pub fn into_parts(self) -> SelectorParts {
        SelectorParts {
            port: self.port,
            session_name: self.session_name,
            username: self.username,
            older_than_secs: self.older_than,
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default progeny.toml
    Init,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Config { command } = &cli.command {
        let path = ProgenyConfig::resolve_path(cli.config.as_deref());
        return cmd::cmd_config(&path, command.clone());
    }

    let config = ProgenyConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.json_logs || config.toml.logging.json,
        dir: config.logging_dir(),
    })?;

    match cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(config, host, port).await?,
        Commands::Spin(args) => cmd::cmd_spin(&config, args).await?,
        Commands::Cleanup { selector } => cmd::cmd_cleanup(&config, selector.into_parts()).await?,
        Commands::List { selector } => cmd::cmd_list(&config, selector.into_parts()).await?,
        Commands::Reconcile => cmd::cmd_reconcile(&config).await?,
        Commands::Prebaked => cmd::cmd_prebaked(&config)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
