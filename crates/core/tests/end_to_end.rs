use async_trait::async_trait;
use corpus_tutor_core::config::{IngestConfig, StorageConfig};
use corpus_tutor_core::error::OcrError;
use corpus_tutor_core::traits::{OcrOutput, PageImage};
use corpus_tutor_core::{
    Config, DocumentRegistry, DocumentStatus, Embedder, EngineParts, GenerateRequest,
    InferenceError, InferenceService, IngestRequest, IngestionPipeline, JobContext,
    KeywordClassifier, LocalVectorStore, OcrEngine, PipelineParts, Query, QueryEngine,
    QueryFilters, QuestionLabel, Route, SessionEvent, SessionState, StopSignal, TokenStream,
    VectorStore,
};
use futures::stream;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Maps text onto one axis per topic so distances are exact.
struct ConceptEmbedder;

impl ConceptEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        if text.contains("未然形") {
            vec![1.0, 0.0, 0.0]
        } else if text.contains("枕草子") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        }
    }
}

#[async_trait]
impl Embedder for ConceptEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        Ok(texts.iter().map(|text| Self::vector(text)).collect())
    }
}

/// Page scans hold their text as bytes.
#[derive(Default)]
struct ScanOcr {
    failing: Mutex<HashSet<u32>>,
    seen: Mutex<Vec<u32>>,
    stop_on: Mutex<Option<(u32, StopSignal)>>,
}

impl ScanOcr {
    fn fail(&self, page: u32) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(page);
        }
    }

    fn stop_on(&self, page: u32, stop: StopSignal) {
        if let Ok(mut stop_on) = self.stop_on.lock() {
            *stop_on = Some((page, stop));
        }
    }

    fn clear(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
        if let Ok(mut stop_on) = self.stop_on.lock() {
            *stop_on = None;
        }
    }

    fn seen(&self) -> Vec<u32> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OcrEngine for ScanOcr {
    async fn recognize(&self, image: &PageImage) -> Result<OcrOutput, OcrError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(image.page);
        }
        if let Ok(stop_on) = self.stop_on.lock() {
            if let Some((page, stop)) = stop_on.as_ref() {
                if *page == image.page {
                    stop.stop();
                }
            }
        }
        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(&image.page))
            .unwrap_or(false);
        if failing {
            return Err(OcrError::Status("502 Bad Gateway".to_string()));
        }
        Ok(OcrOutput::from_text(String::from_utf8_lossy(&image.bytes), 0.95))
    }
}

/// Answers from the prompt it is given, unless a stream was queued for the
/// next generation.
#[derive(Default)]
struct TutorModel {
    queued: Mutex<VecDeque<TokenStream>>,
}

impl TutorModel {
    fn queue(&self, tokens: TokenStream) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.push_back(tokens);
        }
    }

    fn reply_for(prompt: &str) -> &'static str {
        if prompt.contains("[S1] Source:") {
            "<think>The excerpt on page 3 defines it.</think>未然形 is the irrealis base; ず and む attach to it [S1]."
        } else {
            "<think>No excerpts were given.</think>Sei Shōnagon wrote 枕草子 [S1]."
        }
    }
}

fn fragments(text: &str, size: usize) -> Vec<Result<String, InferenceError>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| Ok(piece.iter().collect::<String>()))
        .collect()
}

#[async_trait]
impl InferenceService for TutorModel {
    fn model(&self) -> &str {
        "qwen2.5:7b"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError> {
        let queued = self.queued.lock().ok().and_then(|mut queued| queued.pop_front());
        if let Some(tokens) = queued {
            return Ok(tokens);
        }
        Ok(Box::pin(stream::iter(fragments(
            Self::reply_for(&request.prompt),
            4,
        ))))
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(vec![self.model().to_string()])
    }
}

struct Tutor {
    _dir: TempDir,
    scans: PathBuf,
    store: Arc<LocalVectorStore>,
    ocr: Arc<ScanOcr>,
    model: Arc<TutorModel>,
    pipeline: IngestionPipeline,
    engine: QueryEngine,
}

fn tutor(pages: &[&str]) -> Result<Tutor, Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let scans = dir.path().join("kobun");
    fs::create_dir(&scans)?;
    for (index, text) in pages.iter().enumerate() {
        fs::write(scans.join(format!("page_{:04}.png", index + 1)), text.as_bytes())?;
    }

    let storage = StorageConfig {
        data_dir: dir.path().join("data"),
        work_dir: dir.path().join("work"),
    };
    let ingest = IngestConfig {
        checkpoint_every: 1,
        ..IngestConfig::default()
    };
    let store = Arc::new(LocalVectorStore::in_memory());
    let ocr = Arc::new(ScanOcr::default());
    let model = Arc::new(TutorModel::default());
    let classifier = Arc::new(KeywordClassifier::new()?);
    let embedder = Arc::new(ConceptEmbedder);

    let pipeline = IngestionPipeline::new(
        PipelineParts {
            store: store.clone(),
            registry: Arc::new(DocumentRegistry::in_memory()),
            ocr: ocr.clone(),
            embedder: embedder.clone(),
            classifier: classifier.clone(),
        },
        &storage,
        &ingest,
    )?;
    let engine = QueryEngine::new(
        EngineParts {
            store: store.clone(),
            embedder,
            classifier,
            inference: model.clone(),
        },
        &Config::default(),
    )?;

    Ok(Tutor {
        _dir: dir,
        scans,
        store,
        ocr,
        model,
        pipeline,
        engine,
    })
}

const TEXTBOOK: [&str; 3] = ["", "", "未然形は「ず」「む」に続く活用形である。"];

#[tokio::test]
async fn grammar_question_is_answered_from_the_textbook_page() -> TestResult {
    let tutor = tutor(&TEXTBOOK)?;
    let ingested = tutor
        .pipeline
        .ingest(IngestRequest::new(&tutor.scans), &JobContext::new())
        .await?;
    assert_eq!(ingested.status, DocumentStatus::Complete);
    assert_eq!(ingested.chunks_indexed, 1);

    let report = tutor
        .engine
        .ask("learner", &Query::new("未然形とは何ですか"), None)
        .await?;

    assert_eq!(report.decision.label, QuestionLabel::Grammar);
    assert_eq!(report.decision.route, Route::Corpus);
    assert_eq!(report.outcome.state, SessionState::Done);

    let answer = report.outcome.answer.ok_or("answer missing")?;
    assert!(answer.text.contains("[kobun p.3]"));
    assert!(!answer.text.contains("<think>"));
    assert!(!answer.text.contains("defines it"));
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].pages, vec![3]);
    let reasoning = report.outcome.reasoning.unwrap_or_default();
    assert!(reasoning.contains("The excerpt on page 3"));
    Ok(())
}

#[tokio::test]
async fn literature_question_on_an_empty_index_gets_general_knowledge() -> TestResult {
    let tutor = tutor(&[])?;
    let query = Query::new("Who wrote 枕草子?");

    let direct = tutor
        .store
        .query(&ConceptEmbedder::vector("枕草子"), 5, &QueryFilters::default())
        .await?;
    assert!(direct.is_empty());

    let prepared = tutor.engine.prepare(&query).await?;
    assert!(prepared.results.is_empty());
    assert_eq!(prepared.decision.metrics.density, 0.0);
    assert_eq!(prepared.decision.metrics.diversity, 0);

    let report = tutor.engine.ask("learner", &query, None).await?;
    assert_eq!(report.decision.label, QuestionLabel::Literature);
    assert_eq!(report.decision.route, Route::General);

    let answer = report.outcome.answer.ok_or("answer missing")?;
    assert!(answer.citations.is_empty());
    assert!(!answer.text.contains("[S1]"));
    assert!(answer.text.contains("Sei Shōnagon wrote 枕草子"));
    Ok(())
}

#[tokio::test]
async fn stopping_mid_stream_discards_the_partial_answer() -> TestResult {
    let tutor = tutor(&TEXTBOOK)?;
    tutor
        .pipeline
        .ingest(IngestRequest::new(&tutor.scans), &JobContext::new())
        .await?;

    let (tokens, receiver) = futures::channel::mpsc::unbounded::<Result<String, InferenceError>>();
    tutor.model.queue(Box::pin(receiver));
    let started = tutor
        .engine
        .start("learner", &Query::new("未然形とは何ですか"))
        .await?;
    let session_id = started.session.id().to_string();

    let (events, mut received) = tokio::sync::mpsc::unbounded_channel();
    let running = tokio::spawn(started.run(Some(events)));

    tokens.unbounded_send(Ok("<think>check the excerpt</think>".to_string()))?;
    tokens.unbounded_send(Ok("未然形 is".to_string()))?;
    loop {
        match received.recv().await {
            Some(SessionEvent::Answer(_)) => break,
            Some(SessionEvent::Reasoning(_)) => continue,
            None => return Err("stream ended before any answer text".into()),
        }
    }

    assert!(tutor.engine.stop("learner", &session_id));
    let _ = tokens.unbounded_send(Ok(" the irrealis base [S1].".to_string()));
    drop(tokens);

    let outcome = running.await?;
    assert_eq!(outcome.state, SessionState::Cancelled);
    assert!(outcome.answer.is_none());

    while let Some(event) = received.recv().await {
        if let SessionEvent::Answer(text) = event {
            assert!(!text.contains("irrealis"));
        }
    }
    assert_eq!(tutor.engine.sessions().active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn stopping_one_learner_leaves_another_untouched() -> TestResult {
    let tutor = tutor(&TEXTBOOK)?;
    tutor
        .pipeline
        .ingest(IngestRequest::new(&tutor.scans), &JobContext::new())
        .await?;
    let query = Query::new("未然形とは何ですか");

    let (tokens, receiver) = futures::channel::mpsc::unbounded::<Result<String, InferenceError>>();
    tutor.model.queue(Box::pin(receiver));
    let alice = tutor.engine.start("alice", &query).await?;
    let alice_id = alice.session.id().to_string();
    let bob = tutor.engine.start("bob", &query).await?;
    assert_eq!(tutor.engine.sessions().active_count(), 2);

    assert!(!tutor.engine.stop("bob", &alice_id));
    let alice_run = tokio::spawn(alice.run(None));
    tokens.unbounded_send(Ok("未然形".to_string()))?;
    assert!(tutor.engine.stop("alice", &alice_id));

    let bob_outcome = bob.run(None).await;
    let alice_outcome = alice_run.await?;
    drop(tokens);

    assert_eq!(alice_outcome.state, SessionState::Cancelled);
    assert_eq!(bob_outcome.state, SessionState::Done);
    let answer = bob_outcome.answer.ok_or("bob's answer missing")?;
    assert!(answer.text.contains("[kobun p.3]"));
    Ok(())
}

const CHAPTER: [&str; 4] = [
    "第一章 用言の活用。",
    "未然形は「ず」に続く形である。",
    "連用形は「けり」に続く。",
    "枕草子は清少納言の随筆である。",
];

#[tokio::test]
async fn one_failed_page_leaves_the_rest_searchable() -> TestResult {
    let tutor = tutor(&CHAPTER)?;
    tutor.ocr.fail(2);

    let outcome = tutor
        .pipeline
        .ingest(IngestRequest::new(&tutor.scans), &JobContext::new())
        .await?;

    assert_eq!(outcome.status, DocumentStatus::Partial);
    assert_eq!(outcome.failed_pages, vec![2]);

    let filters = QueryFilters {
        document_id: Some(outcome.document_id.clone()),
        ..QueryFilters::default()
    };
    let results = tutor
        .store
        .query(&ConceptEmbedder::vector(""), 10, &filters)
        .await?;
    let pages: BTreeSet<u32> = results.iter().map(|result| result.chunk.page).collect();
    assert_eq!(pages, BTreeSet::from([1, 3, 4]));
    Ok(())
}

#[tokio::test]
async fn interrupted_ingestion_resumes_after_its_checkpoint() -> TestResult {
    let tutor = tutor(&CHAPTER)?;
    let job = JobContext::new();
    tutor.ocr.stop_on(2, job.stop.clone());

    let first = tutor
        .pipeline
        .ingest(IngestRequest::new(&tutor.scans), &job)
        .await?;
    assert!(first.stopped);
    assert_eq!(first.status, DocumentStatus::Pending);
    assert_eq!(first.checkpoint, Some(2));
    assert_eq!(tutor.store.count_document(&first.document_id).await?, 2);

    tutor.ocr.clear();
    let resumed = tutor
        .pipeline
        .resume(&first.document_id, &JobContext::new())
        .await?;

    assert_eq!(resumed.status, DocumentStatus::Complete);
    assert_eq!(tutor.ocr.seen(), vec![1, 2, 3, 4]);
    assert_eq!(tutor.store.count_document(&first.document_id).await?, 4);
    Ok(())
}
