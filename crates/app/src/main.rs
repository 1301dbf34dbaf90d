use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use corpus_tutor_core::{
    create_embedder, create_ocr_engine, Config, DocumentRegistry, EngineError, EngineParts,
    ImageDirSource, IngestRequest, IngestionPipeline, IngestionQueue, JobContext, KeywordClassifier,
    KnowledgeMode, LocalVectorStore, OllamaClient, PageRange, PipelineParts, Query, QueryEngine,
    SessionEvent, SessionState, StartedAnswer,
};
use corpus_tutor_core::{Embedder, IngestOutcome, VectorStore};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "corpus-tutor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file; built-in defaults are used when it does not exist.
    #[arg(long, env = "CORPUS_TUTOR_CONFIG", default_value = "corpus-tutor.toml")]
    config: PathBuf,

    /// Directory holding the chunk index and document registry.
    #[arg(long, env = "CORPUS_TUTOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for page artifacts and OCR transcripts.
    #[arg(long, env = "CORPUS_TUTOR_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Ollama base URL for generation.
    #[arg(long, env = "OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Generation model.
    #[arg(long, env = "CORPUS_TUTOR_MODEL")]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a PDF, a directory of page scans, or a folder of either.
    Ingest {
        path: PathBuf,
        /// First page to process (inclusive).
        #[arg(long, requires = "last_page")]
        first_page: Option<u32>,
        /// Last page to process (inclusive).
        #[arg(long, requires = "first_page")]
        last_page: Option<u32>,
    },
    /// Ingest several sources in parallel. Ctrl-C pauses running jobs at a page boundary.
    Queue {
        paths: Vec<PathBuf>,
        /// Jobs running at once (defaults to ingest.queue_depth).
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Continue a document after its last checkpoint.
    Resume { document_id: String },
    /// Re-process only the pages that failed.
    Retry { document_id: String },
    /// List OCR transcripts whose document has no indexed chunks.
    Scan {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Chunk, embed and index a stored OCR transcript.
    Import { path: PathBuf },
    /// Ask a question. Ctrl-C stops the answer.
    Ask {
        question: String,
        /// auto, corpus, general or hybrid.
        #[arg(long, default_value = "auto")]
        mode: KnowledgeMode,
        #[arg(long)]
        top_k: Option<usize>,
        /// Conversation scope used to isolate concurrent sessions.
        #[arg(long, default_value = "cli")]
        session: String,
        /// Show reasoning and the answer draft while they stream.
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Explain a grammar point such as けり or 係り結び.
    Explain {
        point: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Translate and analyze a classical passage.
    Translate {
        passage: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Remove chunks whose text repeats an earlier chunk.
    Dedup {
        /// Only look within this source.
        #[arg(long)]
        source: Option<String>,
    },
    /// Save a personal note, cited as [Note: <topic>].
    Note {
        text: String,
        #[arg(long)]
        topic: String,
    },
    /// Index counts per source.
    Stats,
    /// Ingestion status of every known document.
    Documents,
    /// Remove a document's chunks, registry entry, artifacts and transcript.
    Delete { document_id: String },
    /// Check the model service and the index.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        config = %cli.config.display(),
        "corpus-tutor boot"
    );

    match cli.command {
        Command::Ingest {
            path,
            first_page,
            last_page,
        } => {
            let pipeline = build_pipeline(&config)?;
            let ctx = JobContext::new();
            let watcher = stop_on_ctrl_c(ctx.stop.clone());

            let folder = path.is_dir() && ImageDirSource::open(&path).is_err();
            if folder {
                let report = pipeline.ingest_folder(&path, &ctx).await?;
                for skipped in &report.skipped {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped source");
                }
                for outcome in &report.outcomes {
                    print_outcome(outcome);
                }
                println!(
                    "{} sources ingested, {} skipped",
                    report.outcomes.len(),
                    report.skipped.len()
                );
            } else {
                let page_range = first_page
                    .zip(last_page)
                    .map(|(first, last)| PageRange { first, last });
                let request = IngestRequest::new(&path).with_page_range(page_range);
                let outcome = pipeline.ingest(request, &ctx).await?;
                print_outcome(&outcome);
            }
            watcher.abort();
        }
        Command::Queue { paths, depth } => {
            if paths.is_empty() {
                anyhow::bail!("no sources given");
            }
            let pipeline = Arc::new(build_pipeline(&config)?);
            let queue = IngestionQueue::new(pipeline, depth.unwrap_or(config.ingest.queue_depth));
            for path in paths {
                let job_id = queue.submit(IngestRequest::new(&path));
                println!("queued {job_id} {}", path.display());
            }

            let pauser = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        for status in queue.list() {
                            if status.state.is_active() {
                                if let Err(error) = queue.pause(&status.job_id) {
                                    warn!(job_id = %status.job_id, %error, "could not pause job");
                                }
                            }
                        }
                    }
                })
            };
            queue.wait_idle().await;
            pauser.abort();

            for status in queue.list() {
                println!("{} {} {}", status.job_id, status.state, status.path.display());
                if let Some(outcome) = &status.outcome {
                    print_outcome(outcome);
                }
                if let Some(error) = &status.error {
                    println!("  error: {error}");
                }
            }
        }
        Command::Resume { document_id } => {
            let pipeline = build_pipeline(&config)?;
            let ctx = JobContext::new();
            let watcher = stop_on_ctrl_c(ctx.stop.clone());
            let outcome = pipeline.resume(&document_id, &ctx).await?;
            watcher.abort();
            print_outcome(&outcome);
        }
        Command::Retry { document_id } => {
            let pipeline = build_pipeline(&config)?;
            let ctx = JobContext::new();
            let watcher = stop_on_ctrl_c(ctx.stop.clone());
            let outcome = pipeline.retry_failed_pages(&document_id, &ctx).await?;
            watcher.abort();
            print_outcome(&outcome);
        }
        Command::Scan { dir } => {
            let pipeline = build_pipeline(&config)?;
            let orphans = pipeline.scan_for_unindexed(dir.as_deref()).await?;
            if orphans.is_empty() {
                println!("every transcript is indexed");
            }
            for path in orphans {
                println!("{}", path.display());
            }
        }
        Command::Import { path } => {
            let pipeline = build_pipeline(&config)?;
            let outcome = pipeline.import_transcript(&path).await?;
            print_outcome(&outcome);
        }
        Command::Ask {
            question,
            mode,
            top_k,
            session,
            stream,
        } => {
            let engine = build_engine(&config)?;
            let mut query = Query::new(question).with_mode(mode);
            query.top_k = top_k;
            let started = engine.start(&session, &query).await.map_err(report)?;
            print_answer(started, stream).await?;
        }
        Command::Explain {
            point,
            session,
            stream,
        } => {
            let engine = build_engine(&config)?;
            let started = engine.explain_grammar(&session, &point).await.map_err(report)?;
            print_answer(started, stream).await?;
        }
        Command::Translate {
            passage,
            session,
            stream,
        } => {
            let engine = build_engine(&config)?;
            let started = engine.translate_passage(&session, &passage).await.map_err(report)?;
            print_answer(started, stream).await?;
        }
        Command::Dedup { source } => {
            let pipeline = build_pipeline(&config)?;
            let removed = pipeline.clean_duplicates(source.as_deref()).await?;
            println!("removed {removed} duplicate chunks");
        }
        Command::Note { text, topic } => {
            let engine = build_engine(&config)?;
            let chunk = engine.add_note(&text, &topic).await.map_err(report)?;
            println!("note saved as {}", chunk.chunk_id);
        }
        Command::Stats => {
            let store = open_store(&config)?;
            let stats = store.stats().await?;
            println!(
                "{} chunks from {} documents",
                stats.chunk_count, stats.document_count
            );
            for (source, count) in stats.chunks_per_source {
                println!("  {source}: {count}");
            }
        }
        Command::Documents => {
            let registry = DocumentRegistry::open(&config.storage.registry_path())?;
            for document in registry.list().await {
                println!(
                    "{} {} status={} pages={} checkpoint={} failed_pages={:?}",
                    document.document_id,
                    document.source_name,
                    document.status,
                    document.total_pages,
                    document
                        .checkpoint
                        .map_or_else(|| "-".to_string(), |page| page.to_string()),
                    document.failed_pages()
                );
                if let Some(error) = &document.fatal_error {
                    println!("  error: {error}");
                }
            }
        }
        Command::Delete { document_id } => {
            let pipeline = build_pipeline(&config)?;
            let report = pipeline.delete_document(&document_id).await?;
            println!(
                "removed {} chunks (registry entry: {}, transcript: {})",
                report.chunks_removed, report.registry_entry_removed, report.transcript_removed
            );
        }
        Command::Health => {
            let engine = build_engine(&config)?;
            let health = engine.health().await;
            println!(
                "model {}: {}",
                health.model,
                match (health.inference_reachable, health.model_installed) {
                    (true, true) => "ready",
                    (true, false) => "service reachable, model not installed",
                    (false, _) => "service unreachable",
                }
            );
            if let Some(error) = &health.inference_error {
                println!("  {error}");
            }
            for model in &health.installed_models {
                println!("  installed: {model}");
            }
            match (&health.index, &health.index_error) {
                (Some(index), _) => println!(
                    "index: {} chunks from {} documents",
                    index.chunk_count, index.document_count
                ),
                (None, Some(error)) => println!("index: {error}"),
                (None, None) => {}
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.work_dir {
        config.storage.work_dir = dir.clone();
    }
    if let Some(url) = &cli.ollama_url {
        config.inference.url = url.clone();
    }
    if let Some(model) = &cli.model {
        config.inference.model = model.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<LocalVectorStore>> {
    let path = config.storage.index_path();
    let store = LocalVectorStore::open(&path)
        .with_context(|| format!("opening index {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    Ok(Arc::from(create_embedder(&config.embedding)?))
}

fn build_pipeline(config: &Config) -> anyhow::Result<IngestionPipeline> {
    let registry = DocumentRegistry::open(&config.storage.registry_path())?;
    let pipeline = IngestionPipeline::new(
        PipelineParts {
            store: open_store(config)?,
            registry: Arc::new(registry),
            ocr: Arc::from(create_ocr_engine(&config.ocr)?),
            embedder: build_embedder(config)?,
            classifier: Arc::new(KeywordClassifier::new()?),
        },
        &config.storage,
        &config.ingest,
    )?;
    Ok(pipeline)
}

fn build_engine(config: &Config) -> anyhow::Result<QueryEngine> {
    let engine = QueryEngine::new(
        EngineParts {
            store: open_store(config)?,
            embedder: build_embedder(config)?,
            classifier: Arc::new(KeywordClassifier::new()?),
            inference: Arc::new(OllamaClient::new(&config.inference)?),
        },
        config,
    )?;
    Ok(engine)
}

fn stop_on_ctrl_c(stop: corpus_tutor_core::StopSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested, finishing the current page");
            stop.stop();
        }
    })
}

/// Prints the learner-facing message and keeps the error for the exit code.
fn report(error: EngineError) -> anyhow::Error {
    eprintln!("{}", error.user_message());
    anyhow::Error::new(error)
}

async fn print_answer(started: StartedAnswer, stream: bool) -> anyhow::Result<()> {
    let decision = started.decision.clone();
    eprintln!(
        "route: {} (confidence {:.2}, label {}) {}",
        decision.route, decision.confidence, decision.label, decision.explanation
    );

    let watcher = stop_on_ctrl_c(started.session.stop_handle());
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let running = tokio::spawn(started.run(Some(sender)));

    let mut stderr = std::io::stderr();
    while let Some(event) = receiver.recv().await {
        if !stream {
            continue;
        }
        let text = match event {
            SessionEvent::Reasoning(text) | SessionEvent::Answer(text) => text,
        };
        let _ = write!(stderr, "{text}");
        let _ = stderr.flush();
    }
    if stream {
        eprintln!();
    }

    let outcome = running.await.context("answer task panicked")?;
    watcher.abort();

    match outcome.state {
        SessionState::Done => {
            if let Some(answer) = outcome.answer {
                println!("{}", answer.text);
            }
            Ok(())
        }
        SessionState::Cancelled => {
            eprintln!("Stopped. The partial answer was discarded.");
            Ok(())
        }
        _ => {
            let message = outcome
                .error
                .unwrap_or_else(|| "The answer could not be completed.".to_string());
            eprintln!("{message}");
            anyhow::bail!("session {} ended in {}", outcome.session_id, outcome.state)
        }
    }
}

fn print_outcome(outcome: &IngestOutcome) {
    println!(
        "{} {} status={} pages={} chunks={} checkpoint={}{}",
        outcome.document_id,
        outcome.source_name,
        outcome.status,
        outcome.pages_processed,
        outcome.chunks_indexed,
        outcome
            .checkpoint
            .map_or_else(|| "-".to_string(), |page| page.to_string()),
        if outcome.stopped { " (stopped)" } else { "" }
    );
    if !outcome.failed_pages.is_empty() {
        println!("  failed pages: {:?}", outcome.failed_pages);
    }
}
