mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pagebot_common::ProviderKind;
use pagebot_security::RedactingWriter;
use tracing_subscriber::EnvFilter;

/// pagebot - multi-provider reply engine for business page conversations.
#[derive(Parser, Debug)]
#[command(name = "pagebot", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML or TOML config file.
    #[arg(short, long, global = true, env = "PAGEBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate one reply for a conversation request read from a JSON file.
    Ask {
        /// Request file (`-` for stdin).
        request: PathBuf,
    },
    /// Describe an image given as URL, data URL or bare base64.
    DescribeImage {
        reference: String,
        /// Override the description prompt.
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Transcribe a voice message given as URL, data URL or bare base64.
    Transcribe { reference: String },
    /// Best free model table.
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },
    /// Manage pooled credentials.
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    /// Refresh the table from the provider catalog once and print it.
    Refresh,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Import raw keys, one per line.
    Import {
        file: PathBuf,
        /// Model the keys are valid for (`*` for any model).
        #[arg(long)]
        model: String,
        /// Provider of every key; inferred from the key prefix when omitted.
        #[arg(long)]
        provider: Option<ProviderKind>,
    },
    /// List stored credentials with their health state.
    List,
    /// Delete a stored credential.
    Remove { id: i64 },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = pagebot_config::ConfigLoader::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask { request } => commands::ask(config, &request).await,
        Commands::DescribeImage { reference, prompt } => {
            commands::describe_image(config, &reference, prompt).await
        }
        Commands::Transcribe { reference } => commands::transcribe(config, &reference).await,
        Commands::Models {
            command: ModelsCommand::Refresh,
        } => commands::refresh_models(config).await,
        Commands::Keys { command } => match command {
            KeysCommand::Import {
                file,
                model,
                provider,
            } => commands::import_keys(&config, &file, &model, provider),
            KeysCommand::List => commands::list_keys(&config),
            KeysCommand::Remove { id } => commands::remove_key(&config, id),
        },
    }
}
