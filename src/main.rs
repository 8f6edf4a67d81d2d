//! # Llama Assistant CLI (`llama-assistant`)
//!
//! Chat with a local language model about your own files.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `llama-assistant chat "<query>"` | Ask one question, optionally over lookup files and an image |
//! | `llama-assistant repl` | Interactive multi-turn conversation |
//! | `llama-assistant index <PATH>...` | Build an index and report chunk counts |
//! | `llama-assistant serve` | Start the local HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! # Ask about a document
//! llama-assistant chat "What is the capital of France?" --file notes/geo.txt
//!
//! # Ask about a screenshot
//! llama-assistant chat "What does this error mean?" --image capture.png
//!
//! # Talk to a different server
//! llama-assistant --config ./assistant.toml repl --file ./docs
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use llama_assistant::config::{self, Config};
use llama_assistant::embedding::create_embedder;
use llama_assistant::index::{DocumentIndex, VectorIndex};
use llama_assistant::models::{ImageRef, LookupFileSet};
use llama_assistant::pipeline::{AgentResponse, ChatRequest, ChatSession, RagAgent};
use llama_assistant::progress::{IndexProgressReporter, ProgressMode};
use llama_assistant::reader::DirectoryReader;
use llama_assistant::server;

/// Llama Assistant: retrieval-augmented chat over local files with a
/// local language model.
#[derive(Parser)]
#[command(name = "llama-assistant", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Indexing progress on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question.
    Chat {
        query: String,

        /// Lookup file or directory to answer from. Repeatable.
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Image to attach: a local path or a URL.
        #[arg(long)]
        image: Option<String>,

        /// Print the answer once complete instead of streaming it.
        #[arg(long)]
        no_stream: bool,
    },

    /// Interactive conversation on stdin.
    ///
    /// `/files <path>...` changes the lookup files, `/clear` forgets the
    /// conversation, `/quit` exits.
    Repl {
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },

    /// Index lookup files and print chunk counts per source.
    Index {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Start the HTTP API.
    Serve,
}

fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "llama_assistant=warn",
        1 => "llama_assistant=debug",
        _ => "llama_assistant=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
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
    init_tracing(cli.verbose, cli.log_json);

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Chat {
            query,
            files,
            image,
            no_stream,
        } => {
            let agent = RagAgent::from_config(&config)?;
            let mut session = ChatSession::from_config(&config, progress)?;
            let mut request = ChatRequest::new(query)
                .with_lookup_files(files)
                .streaming(!no_stream);
            if let Some(image) = image {
                request = request.with_image(ImageRef::new(image));
            }
            let response = agent.chat_completion(&mut session, request).await?;
            print_response(response).await?;
        }
        Commands::Repl { files } => run_repl(&config, progress, files).await?,
        Commands::Index { paths } => run_index(&config, progress, paths).await?,
        Commands::Serve => server::run_server(&config, progress).await?,
    }

    Ok(())
}

/// Print an answer to stdout, fragment by fragment when streaming.
async fn print_response(response: AgentResponse) -> Result<()> {
    match response {
        AgentResponse::Complete(turn) => println!("{}", turn.content.text()),
        AgentResponse::Streaming(mut reply) => {
            let mut stdout = std::io::stdout();
            while let Some(delta) = reply.next().await {
                if let Some(text) = delta?.content {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}

async fn run_repl(
    config: &Config,
    progress: Arc<dyn IndexProgressReporter>,
    files: Vec<PathBuf>,
) -> Result<()> {
    let agent = RagAgent::from_config(config)?;
    let mut session = ChatSession::from_config(config, progress)?;
    let mut lookup: LookupFileSet = files.into_iter().collect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest)) {
            ("/quit", _) | ("/exit", _) => break,
            ("/clear", _) => {
                let n = session.clear_chat_history();
                println!("Cleared {} turns.", n);
            }
            ("/files", rest) => {
                lookup = rest.split_whitespace().map(PathBuf::from).collect();
                match agent.update_index(&mut session, lookup.clone()).await {
                    Ok(_) => {
                        let stats = session.index_stats();
                        println!("Indexed {} chunks from {} files.", stats.chunks, stats.sources);
                    }
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            _ => {
                let request = ChatRequest::new(line)
                    .with_lookup_files(lookup.iter().cloned())
                    .streaming(true);
                let outcome = match agent.chat_completion(&mut session, request).await {
                    Ok(response) => print_response(response).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = outcome {
                    eprintln!("error: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

async fn run_index(
    config: &Config,
    progress: Arc<dyn IndexProgressReporter>,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let mut index = VectorIndex::new(
        embedder,
        Arc::new(DirectoryReader::new()?),
        config.chunking.max_tokens,
    )
    .with_batch_size(config.embedding.batch_size)
    .with_progress(progress);

    let set: LookupFileSet = paths.into_iter().collect();
    let stats = index.rebuild(&set).await?;

    for (path, chunks) in index.source_chunk_counts() {
        println!("{}  {} chunks", path.display(), chunks);
    }
    println!("{} chunks from {} files", stats.chunks, stats.sources);
    Ok(())
}
