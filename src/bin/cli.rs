//! Command-line driver for llama-runloop.
//!
//! Runs the coordinator against the in-memory demo engine, which echoes the
//! prompt (or replays `--script` pieces) one fragment per step.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use futures::StreamExt;
use llama_runloop::native::MockEngine;
use llama_runloop::{Coordinator, LlamaError, RunloopConfig};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Model lifecycle and streaming generation demo.
#[derive(Parser)]
#[command(name = "llama-runloop", version)]
struct Cli {
    /// JSON file with run loop settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the generation bound.
    #[arg(short = 'n', long, global = true)]
    n_len: Option<usize>,

    /// Fixed pieces the demo engine replays instead of echoing the prompt.
    #[arg(long, global = true, num_args = 1..)]
    script: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load a model, generate one completion, and unload.
    Generate {
        /// Model file to load.
        #[arg(short, long)]
        model: PathBuf,

        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,
    },

    /// Interactive loop. Lines are prompts; `/load PATH`, `/unload`, and
    /// `/quit` manage the model.
    Chat {
        /// Model file to load at startup.
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RunloopConfig::from_json_file(path)?,
        None => RunloopConfig::default(),
    };
    if let Some(n_len) = cli.n_len {
        config = config.with_n_len(n_len);
    }

    let engine = if cli.script.is_empty() {
        MockEngine::new()
    } else {
        MockEngine::new().with_script(cli.script.clone())
    };
    let coordinator = Coordinator::new(engine, config)?;

    match cli.command {
        Command::Generate { model, prompt } => {
            coordinator.load(&model).await?;
            stream_reply(&coordinator, &prompt).await?;
            coordinator.unload().await?;
        }
        Command::Chat { model } => {
            if let Some(model) = model {
                coordinator.load(&model).await?;
            }
            chat(&coordinator, BufReader::new(tokio::io::stdin())).await?;
            coordinator.unload().await?;
        }
    }
    Ok(())
}

/// Print one completion as it streams.
async fn stream_reply(coordinator: &Coordinator, prompt: &str) -> llama_runloop::Result<()> {
    let mut stream = coordinator.send(prompt)?;
    let mut stdout = io::stdout();
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?);
        stdout.flush()?;
    }
    println!();
    Ok(())
}

/// Read prompts and commands from `input` until EOF or `/quit`.
async fn chat<R>(coordinator: &Coordinator, input: R) -> llama_runloop::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let outcome = if let Some(path) = line.strip_prefix("/load ") {
            coordinator.load(path.trim()).await.map(|()| {
                println!("Loaded {}", path.trim());
            })
        } else if line == "/unload" {
            coordinator.unload().await
        } else if line == "/quit" {
            break;
        } else {
            stream_reply(coordinator, line).await
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_retryable() => eprintln!("busy: {e}"),
            Err(LlamaError::ModelNotLoaded) => eprintln!("no model loaded; use /load PATH"),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}
