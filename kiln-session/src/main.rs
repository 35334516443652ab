use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use kiln_session::state::schema::{EntityType, Priority, Status};

mod commands;

#[derive(Parser)]
#[command(name = "kiln-session")]
#[command(about = "Feature pipeline scheduling and execution for kiln")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/kiln/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and apply migrations
    Init,

    /// Submit a feature; creates its first pipeline task
    Submit {
        /// What the feature should do
        description: String,

        /// low, normal, high or critical
        #[arg(long, default_value = "normal")]
        priority: Priority,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List features
    List {
        /// Only features in this status
        #[arg(long)]
        status: Option<Status>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a feature and its tasks
    Status {
        /// Feature id
        feature: String,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show recorded state transitions
    History {
        /// feature or task (requires --id)
        #[arg(long, requires = "id")]
        entity_type: Option<EntityType>,

        /// Entity id
        #[arg(long, requires = "entity_type")]
        id: Option<String>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show recent audit log entries
    Audit {
        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the scheduler in the foreground until no work is runnable
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u32>,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Detect (and optionally resolve) deadlocks in a JSON work-item file
    Deadlocks {
        /// JSON array of work items
        #[arg(long)]
        items: PathBuf,

        /// Apply rule-based resolutions and print the updated items
        #[arg(long)]
        resolve: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Configuration subcommands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,

    /// Print the default config file path
    Path,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<u8> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init => commands::init::run(config),

        Commands::Submit {
            description,
            priority,
            format,
        } => commands::submit::run(config, &description, priority, format == OutputFormat::Json),

        Commands::List {
            status,
            limit,
            format,
        } => commands::list::run(config, status, limit, format == OutputFormat::Json),

        Commands::Status { feature, format } => {
            commands::status::run(config, &feature, format == OutputFormat::Json)
        }

        Commands::History {
            entity_type,
            id,
            limit,
            format,
        } => commands::history::transitions(
            config,
            entity_type.zip(id),
            limit,
            format == OutputFormat::Json,
        ),

        Commands::Audit { limit, format } => {
            commands::history::audit(config, limit, format == OutputFormat::Json)
        }

        Commands::Run { max_ticks, format } => {
            commands::run::run(config, max_ticks, format == OutputFormat::Json)
        }

        Commands::Deadlocks {
            items,
            resolve,
            format,
        } => {
            if resolve {
                commands::deadlocks::resolve(&items, format == OutputFormat::Json)
            } else {
                commands::deadlocks::detect(&items, format == OutputFormat::Json)
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config::show(config),
            ConfigCommands::Path => commands::config::path(),
        },
    }
}
