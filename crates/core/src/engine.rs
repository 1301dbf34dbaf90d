use crate::config::{Config, InferenceConfig, RetrievalConfig};
use crate::embeddings::Embedder;
use crate::error::{ConfigError, EngineError, InferenceError};
use crate::ingest::note_chunk;
use crate::models::{Chunk, IndexStats, KnowledgeMode, Query, RouteDecision, ScoredChunk};
use crate::prompt::{AssembledPrompt, PromptTemplates};
use crate::router::{KnowledgeRouter, RoutingStats};
use crate::scorer::score;
use crate::session::{SessionEvent, SessionOutcome, SessionRegistry, StreamSession};
use crate::traits::{GenerateRequest, InferenceService, QuestionClassifier, TokenStream, VectorStore};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Collaborators the engine reads and generates through.
pub struct EngineParts {
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub classifier: Arc<dyn QuestionClassifier>,
    pub inference: Arc<dyn InferenceService>,
}

/// Routing decision and prompt for one query, before any generation.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub decision: RouteDecision,
    pub prompt: AssembledPrompt,
    pub results: Vec<ScoredChunk>,
}

/// A generation that has started: the session plus its token stream.
pub struct StartedAnswer {
    pub decision: RouteDecision,
    pub session: StreamSession,
    pub tokens: TokenStream,
}

impl StartedAnswer {
    pub async fn run(self, events: Option<mpsc::UnboundedSender<SessionEvent>>) -> SessionOutcome {
        self.session.run(self.tokens, events).await
    }
}

#[derive(Debug, Clone)]
pub struct AnswerReport {
    pub decision: RouteDecision,
    pub outcome: SessionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub model: String,
    pub inference_reachable: bool,
    pub installed_models: Vec<String>,
    pub model_installed: bool,
    pub inference_error: Option<String>,
    pub index: Option<IndexStats>,
    pub index_error: Option<String>,
}

/// Classify, retrieve, score, route, assemble, then stream.
pub struct QueryEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<dyn QuestionClassifier>,
    inference: Arc<dyn InferenceService>,
    router: KnowledgeRouter,
    templates: PromptTemplates,
    retrieval: RetrievalConfig,
    generation: InferenceConfig,
    sessions: SessionRegistry,
    routing_stats: Mutex<RoutingStats>,
}

impl QueryEngine {
    pub fn new(parts: EngineParts, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            store: parts.store,
            embedder: parts.embedder,
            classifier: parts.classifier,
            inference: parts.inference,
            router: KnowledgeRouter::new(config.router.clone()),
            templates: PromptTemplates::from_config(&config.prompts)?,
            retrieval: config.retrieval.clone(),
            generation: config.inference.clone(),
            sessions: SessionRegistry::new(),
            routing_stats: Mutex::new(RoutingStats::default()),
        })
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn prepare(&self, query: &Query) -> Result<PreparedQuery, EngineError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyQuery);
        }

        let label = self.classifier.classify(text);
        let results = if query.mode == KnowledgeMode::General {
            Vec::new()
        } else {
            self.retrieve(query).await?
        };
        let metrics = score(&results, self.retrieval.distance_threshold);
        let decision = self.router.decide(label, metrics, query.mode);
        self.record(&decision);

        tracing::info!(
            route = %decision.route,
            confidence = decision.confidence,
            label = %decision.label,
            results = results.len(),
            clarification = decision.needs_clarification,
            "query routed"
        );

        let prompt = self.templates.assemble(&decision, query, &results);
        Ok(PreparedQuery {
            decision,
            prompt,
            results,
        })
    }

    /// Starts generation for `query` in `user_session`. An unreachable model
    /// fails here, before any session exists.
    pub async fn start(&self, user_session: &str, query: &Query) -> Result<StartedAnswer, EngineError> {
        let prepared = self.prepare(query).await?;
        let request = GenerateRequest {
            prompt: prepared.prompt.text,
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            max_tokens: self.generation.max_tokens,
        };
        let tokens = self.inference.generate(request).await?;

        let session = StreamSession::new(user_session, prepared.decision.route, prepared.prompt.sources)
            .registered(&self.sessions);
        tracing::debug!(session = %session.id(), user_session, model = %self.inference.model(), "generation started");
        Ok(StartedAnswer {
            decision: prepared.decision,
            session,
            tokens,
        })
    }

    pub async fn ask(
        &self,
        user_session: &str,
        query: &Query,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<AnswerReport, EngineError> {
        let started = self.start(user_session, query).await?;
        let decision = started.decision.clone();
        let outcome = started.run(events).await;
        Ok(AnswerReport { decision, outcome })
    }

    /// Asks for an explanation of one grammar point through the usual routing.
    pub async fn explain_grammar(&self, user_session: &str, point: &str) -> Result<StartedAnswer, EngineError> {
        let point = point.trim();
        if point.is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        let question = format!(
            "Explain the classical Japanese grammar point: {point}. Include formation rules, usage, and examples."
        );
        self.start(user_session, &Query::new(question)).await
    }

    /// Asks for a translation and analysis of a classical passage.
    pub async fn translate_passage(&self, user_session: &str, passage: &str) -> Result<StartedAnswer, EngineError> {
        let passage = passage.trim();
        if passage.is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        let question = format!("Translate and analyze this classical Japanese passage: {passage}");
        self.start(user_session, &Query::new(question)).await
    }

    pub fn stop(&self, user_session: &str, session_id: &str) -> bool {
        self.sessions.stop(user_session, session_id)
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.routing_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub async fn stats(&self) -> Result<IndexStats, EngineError> {
        Ok(self.store.stats().await?)
    }

    /// Embeds and indexes a personal note, cited later as `[Note: <topic>]`.
    pub async fn add_note(&self, text: &str, topic: &str) -> Result<Chunk, EngineError> {
        let mut chunk = note_chunk(text, topic)?;
        let mut vectors = self.embedder.embed_batch(&[chunk.text.clone()]).await?;
        chunk.embedding = vectors.pop().ok_or_else(|| InferenceError::BackendResponse {
            backend: "embedder".to_string(),
            details: "no vector returned for note".to_string(),
        })?;
        self.store.upsert(vec![chunk.clone()]).await?;
        tracing::info!(topic = ?chunk.note_topic, chunk_id = %chunk.chunk_id, "note added");
        Ok(chunk)
    }

    pub async fn health(&self) -> HealthReport {
        let model = self.inference.model().to_string();
        let (inference_reachable, installed_models, inference_error) =
            match self.inference.list_models().await {
                Ok(models) => (true, models, None),
                Err(error) => (false, Vec::new(), Some(error.to_string())),
            };
        let model_installed = installed_models
            .iter()
            .any(|name| name == &model || name.split(':').next() == Some(model.as_str()));
        let (index, index_error) = match self.store.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(error) => (None, Some(error.to_string())),
        };

        HealthReport {
            model,
            inference_reachable,
            installed_models,
            model_installed,
            inference_error,
            index,
            index_error,
        }
    }

    async fn retrieve(&self, query: &Query) -> Result<Vec<ScoredChunk>, EngineError> {
        let top_k = query.top_k.unwrap_or(self.retrieval.top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut vectors = self.embedder.embed_batch(&[query.text.trim().to_string()]).await?;
        let Some(vector) = vectors.pop() else {
            return Ok(Vec::new());
        };
        Ok(self.store.query(&vector, top_k, &query.filters).await?)
    }

    fn record(&self, decision: &RouteDecision) {
        match self.routing_stats.lock() {
            Ok(mut stats) => stats.record(decision),
            Err(poisoned) => poisoned.into_inner().record(decision),
        }
    }
}
