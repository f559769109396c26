//! Membase CLI: the main entry point.
//!
//! Commands:
//! - `init`           Write a default config and create the data directory
//! - `add`            Store a message
//! - `get`            Print one tier of a conversation
//! - `conversations`  List stored conversations
//! - `delete`         Remove messages by index
//! - `clear`          Remove a tier or a whole conversation
//! - `consolidate`    Run one consolidation cycle now
//! - `pull`           Load conversations from the hub
//! - `run`            Keep consolidating and mirroring until Ctrl-C
//! - `status`         Show configuration and store counts

use clap::{Parser, Subcommand};
use membase_core::message::{Role, Tier};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "membase",
    about = "Membase: tiered conversational memory for agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.membase/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account to operate on (overrides config and MEMBASE_ACCOUNT)
    #[arg(short, long, global = true)]
    account: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the data directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Store a message
    Add {
        /// Conversation id
        #[arg(short, long)]
        conversation: String,

        /// Message text
        text: String,

        /// system, user or assistant
        #[arg(short, long, default_value = "user")]
        role: Role,

        /// Sender name (defaults to the account)
        #[arg(short, long)]
        name: Option<String>,

        /// stm, ltm or profile
        #[arg(short, long, default_value = "stm")]
        tier: Tier,
    },

    /// Print one tier of a conversation, oldest first
    Get {
        #[arg(short, long)]
        conversation: String,

        #[arg(short, long, default_value = "stm")]
        tier: Tier,

        /// Only the last N messages
        #[arg(short = 'n', long)]
        recent: Option<usize>,

        /// Print the wire JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List stored conversations
    Conversations,

    /// Remove messages by memory index
    Delete {
        #[arg(short, long)]
        conversation: String,

        #[arg(short, long, default_value = "stm")]
        tier: Tier,

        /// Memory indices to remove
        #[arg(required = true)]
        indices: Vec<u64>,
    },

    /// Remove a tier, or every tier of a conversation
    Clear {
        #[arg(short, long)]
        conversation: String,

        /// Only this tier
        #[arg(short, long)]
        tier: Option<Tier>,

        /// Required to actually delete
        #[arg(long)]
        confirm: bool,
    },

    /// Run one consolidation cycle and report what it did
    Consolidate,

    /// Load conversations from the hub into local storage
    Pull {
        /// Only this conversation (default: all)
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Consolidate and mirror in the background until Ctrl-C
    Run,

    /// Show configuration and store counts
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if let Commands::Init { force } = cli.command {
        return commands::init::run(cli.config.as_deref(), force);
    }

    let config = commands::load_config(cli.config.as_deref(), cli.account)?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Add {
            conversation,
            text,
            role,
            name,
            tier,
        } => commands::memory::add(&config, &conversation, text, role, name, tier).await?,
        Commands::Get {
            conversation,
            tier,
            recent,
            json,
        } => commands::memory::get(&config, &conversation, tier, recent, json).await?,
        Commands::Conversations => commands::memory::conversations(&config).await?,
        Commands::Delete {
            conversation,
            tier,
            indices,
        } => commands::memory::delete(&config, &conversation, tier, &indices).await?,
        Commands::Clear {
            conversation,
            tier,
            confirm,
        } => commands::memory::clear(&config, &conversation, tier, confirm).await?,
        Commands::Consolidate => commands::consolidate::run(&config).await?,
        Commands::Pull { conversation } => {
            commands::pull::run(&config, conversation.as_deref()).await?
        }
        Commands::Run => commands::run::run(&config).await?,
        Commands::Status => commands::status::run(&config).await?,
    }

    Ok(())
}
