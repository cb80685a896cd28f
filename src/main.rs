use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;

use rfscene::host::HostServices;
use rfscene::pipeline;
use rfscene::producer::{CapturedDocument, StreamSession};
use rfscene::protocol::Envelope;
use rfscene::scene::InMemoryScene;
use rfscene::{SessionCoordinator, StreamConfig};

#[derive(Parser)]
#[command(name = "rfscene", version, about = "Stream captured pages and rebuild them as scene graphs")]
struct Cli {
    /// JSON file with `producer` and `session` settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a captured document as a message transcript (one JSON message per line)
    Capture {
        document: PathBuf,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rebuild a scene from a message transcript and print the session report
    Replay {
        transcript: PathBuf,
        /// Also print the reconstructed tree
        #[arg(long)]
        tree: bool,
    },
    /// Stream a captured document straight into an in-memory scene
    Import {
        document: PathBuf,
        #[arg(long)]
        tree: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<StreamConfig> {
    let config = match path {
        Some(p) => {
            let text = fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", p.display()))?
        }
        None => StreamConfig::default(),
    };
    config.producer.validate()?;
    config.session.validate()?;
    Ok(config)
}

fn load_document(path: &Path) -> Result<CapturedDocument> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading document {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing document {}", path.display()))
}

async fn capture(config: StreamConfig, document: &Path, output: Option<&Path>) -> Result<()> {
    let document = load_document(document)?;
    let mut out: Box<dyn Write + Send> = match output {
        Some(p) => Box::new(BufWriter::new(
            fs::File::create(p).with_context(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let (tx, mut rx) = mpsc::channel::<Envelope>(pipeline::DEFAULT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(async move {
        let mut lines = 0u64;
        while let Some(envelope) = rx.recv().await {
            writeln!(out, "{}", envelope.to_json()?)?;
            lines += 1;
        }
        out.flush()?;
        anyhow::Ok(lines)
    });

    let mut session = StreamSession::new(config.producer)?;
    let summary = session.stream(document, &tx).await?;
    drop(tx);
    let lines = writer.await??;
    info!(
        "wrote {lines} messages ({} chunks, {} failed assets)",
        summary.chunks_sent, summary.failed_assets
    );
    Ok(())
}

async fn replay(config: StreamConfig, transcript: &Path, tree: bool) -> Result<()> {
    let file = fs::File::open(transcript)
        .with_context(|| format!("opening transcript {}", transcript.display()))?;
    let mut coordinator =
        SessionCoordinator::new(config.session, InMemoryScene::new(), HostServices::noop())?;

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        coordinator.process_json(&line);
    }
    let report = coordinator.drain().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if tree {
        print!("{}", coordinator.host().dump());
    }
    Ok(())
}

async fn import(config: StreamConfig, document: &Path, tree: bool) -> Result<()> {
    let document = load_document(document)?;
    let outcome = pipeline::stream_document(
        document,
        config.producer,
        config.session,
        InMemoryScene::new(),
        HostServices::noop(),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    if tree {
        print!("{}", outcome.host.dump());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Capture { document, output } => capture(config, &document, output.as_deref()).await,
        Command::Replay { transcript, tree } => replay(config, &transcript, tree).await,
        Command::Import { document, tree } => import(config, &document, tree).await,
    }
}
