mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ollama-agent")]
#[command(about = "Chat with a local model that can run commands and call MCP tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Model to use for this run (overrides config)
    #[arg(short, long)]
    model: Option<String>,

    /// Reasoning effort: low, medium, high or disabled
    #[arg(short, long)]
    effort: Option<String>,

    /// Built-in tool timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Run a single prompt and exit (interactive mode if not provided)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Session ID to continue
    #[arg(short, long)]
    session: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage stored chat sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// List stored sessions, most recently active first
    List,
    /// Delete a session and its history
    Delete {
        /// Session ID
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Some(Commands::Sessions { command }) => match command {
            SessionsCommands::List => {
                commands::sessions::list().await?;
            }
            SessionsCommands::Delete { session_id } => {
                commands::sessions::delete(&session_id).await?;
            }
        },
        None => {
            let options = commands::chat::ChatOptions {
                model: cli.model,
                effort: cli.effort,
                timeout: cli.timeout,
                session: cli.session,
            };
            commands::chat::run(cli.prompt, options).await?;
        }
    }

    Ok(())
}
