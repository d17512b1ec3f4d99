mod ai;
mod cache;
mod commands;
mod config;
mod error;
mod executor;
mod os;
mod parser;
mod plugins;
mod resolver;
mod rules;
mod safety;
mod types;
mod ui;
mod vault;

use clap::{Parser, Subcommand};
use commands::QueryOptions;
use config::load_config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdr", version)]
#[command(about = "Turn plain-language requests into shell commands", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Show the command and its explanation without running anything
    #[arg(short, long)]
    explain: bool,

    /// Ask for a breakdown of each part of the command
    #[arg(short, long)]
    learn: bool,

    /// Skip saved commands and suggest a fresh one
    #[arg(short, long)]
    suggest: bool,

    /// Log resolution details to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// What you want to do; use `--` before requests that start with a subcommand name
    query: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a named command to the vault
    Save {
        name: String,

        /// The command; chain steps with &&
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// List saved commands
    List,

    /// Remove a saved command by id
    Remove { id: i64 },

    /// Drop all cached AI responses
    CacheClear,

    /// Check the backend, vault, cache and plugins
    Doctor,

    /// Open the config file in $EDITOR
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config();

    let result = match cli.command {
        Some(Commands::Save {
            name,
            command,
            description,
            tags,
        }) => commands::cmd_save(&name, &command, description.as_deref(), &tags),
        Some(Commands::List) => commands::cmd_list(),
        Some(Commands::Remove { id }) => commands::cmd_remove(id),
        Some(Commands::CacheClear) => commands::cmd_cache_clear(&config),
        Some(Commands::Doctor) => commands::cmd_doctor(&config),
        Some(Commands::Config) => commands::cmd_config(),
        None => {
            let query = cli.query.join(" ");
            if query.trim().is_empty() {
                eprintln!("usage: cmdr [-e] [-l] [-s] <request>");
                eprintln!("       cmdr save|list|remove|cache-clear|doctor|config");
                return;
            }
            let opts = QueryOptions {
                explain: cli.explain,
                learn: cli.learn,
                suggest: cli.suggest,
            };
            commands::cmd_query(&query, &config, opts)
        }
    };

    if let Err(e) = result {
        eprintln!("cmdr: {}", e);
        std::process::exit(1);
    }
}
