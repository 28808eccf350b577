use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use llmfold_core::{ChatRequest, Message, PromptBudgeter, TokenEstimator};
use llmfold_proxy::{run_server, ServerConfig};
use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "llmfold")]
#[command(version)]
#[command(about = "llmfold - request batching and token budgeting for LLM backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batching proxy
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Base URL of the OpenAI-compatible downstream provider
        #[arg(short, long)]
        downstream_url: Option<String>,

        /// How long a batch stays open, in milliseconds
        #[arg(long)]
        batch_window_ms: Option<u64>,

        /// Maximum requests merged into one call
        #[arg(long)]
        max_batch_size: Option<usize>,
    },

    /// Print the token estimate of a text file
    Estimate {
        /// File to measure
        file: PathBuf,

        /// Characters per token
        #[arg(long, default_value_t = llmfold_core::tokens::DEFAULT_CHARS_PER_TOKEN)]
        chars_per_token: f64,
    },

    /// Fit a conversation into a context budget and print the result as JSON
    Fit {
        /// JSON file: an array of messages or an object with a `messages` array
        file: PathBuf,

        /// Context budget in tokens
        #[arg(short, long)]
        budget: usize,

        /// Per-request token overhead
        #[arg(short, long, default_value_t = 0)]
        overhead: usize,

        /// Tokens reserved for the answer
        #[arg(short, long)]
        max_output: Option<u32>,

        /// Characters per token
        #[arg(long, default_value_t = llmfold_core::tokens::DEFAULT_CHARS_PER_TOKEN)]
        chars_per_token: f64,
    },
}

/// Accepted shapes of the `fit` input file
#[derive(Deserialize)]
#[serde(untagged)]
enum Conversation {
    Messages(Vec<Message>),
    Body { messages: Vec<Message> },
}

impl Conversation {
    fn into_messages(self) -> Vec<Message> {
        match self {
            Conversation::Messages(messages) | Conversation::Body { messages } => messages,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, downstream_url, batch_window_ms, max_batch_size } => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if let Some(url) = downstream_url {
                config.proxy.downstream_url = url;
            }
            if let Some(ms) = batch_window_ms {
                config.batcher.batch_window = Duration::from_millis(ms);
            }
            if let Some(n) = max_batch_size {
                config.batcher.max_batch_size = n.max(1);
            }

            init_logging(config.proxy.verbose);
            run_server(config).await?;
        }

        Commands::Estimate { file, chars_per_token } => {
            let text = read(&file)?;
            let estimator = TokenEstimator::new(chars_per_token);

            println!("File: {}", file.display());
            println!("Characters: {}", text.chars().count());
            println!("Tokens: {}", estimator.estimate(&text));
        }

        Commands::Fit { file, budget, overhead, max_output, chars_per_token } => {
            let raw = read(&file)?;
            let conversation: Conversation = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a message list", file.display()))?;

            let mut request = ChatRequest::new("fit", conversation.into_messages());
            request.max_output_tokens = max_output;
            request.validate()?;

            let budgeter = PromptBudgeter::new(
                TokenEstimator::new(chars_per_token),
                llmfold_core::budget::DEFAULT_OUTPUT_TOKENS,
            );
            let fitted = budgeter.fit(&request, budget, overhead);

            println!("{}", serde_json::to_string_pretty(&fitted)?);
        }
    }

    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "llmfold_proxy=debug,tower_http=debug"
    } else {
        "llmfold_proxy=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
