use crate::citations::{reconcile, ReconciledAnswer};
use crate::error::InferenceError;
use crate::models::Route;
use crate::parser::{ReasoningParser, Segment};
use crate::prompt::SourceRef;
use crate::traits::TokenStream;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Cooperative stop flag shared between a session and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopSignal::stop`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Open,
    Streaming,
    Done,
    Cancelled,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Open => "OPEN",
            SessionState::Streaming => "STREAMING",
            SessionState::Done => "DONE",
            SessionState::Cancelled => "CANCELLED",
            SessionState::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Incremental output delivered while a session streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Reasoning(String),
    Answer(String),
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub route: Route,
    /// Present only when the session reached DONE.
    pub answer: Option<ReconciledAnswer>,
    pub reasoning: Option<String>,
    /// Learner-facing message when the session ended in ERROR.
    pub error: Option<String>,
}

/// One generation request from OPEN to DONE, CANCELLED or ERROR.
///
/// The session owns its stop flag and buffers; nothing is shared with other
/// sessions except the registry entry that lets a caller find the flag.
pub struct StreamSession {
    id: String,
    user_session: String,
    route: Route,
    sources: Vec<SourceRef>,
    state: SessionState,
    stop: StopSignal,
    parser: ReasoningParser,
    reasoning: String,
    answer: String,
    _entry: Option<ActiveEntry>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("user_session", &self.user_session)
            .field("route", &self.route)
            .field("state", &self.state)
            .finish()
    }
}

impl StreamSession {
    pub fn new(user_session: impl Into<String>, route: Route, sources: Vec<SourceRef>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_session: user_session.into(),
            route,
            sources,
            state: SessionState::Open,
            stop: StopSignal::new(),
            parser: ReasoningParser::new(),
            reasoning: String::new(),
            answer: String::new(),
            _entry: None,
        }
    }

    /// Registers the session so it can be stopped by id until it ends.
    pub fn registered(mut self, registry: &SessionRegistry) -> Self {
        registry.insert(&self.user_session, &self.id, self.stop.clone());
        self._entry = Some(ActiveEntry {
            registry: registry.clone(),
            user_session: self.user_session.clone(),
            session_id: self.id.clone(),
        });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_session(&self) -> &str {
        &self.user_session
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Drains `tokens` until the model finishes, the stream fails or the
    /// session is stopped. No event is sent once a stop has been observed.
    pub async fn run(
        mut self,
        mut tokens: TokenStream,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> SessionOutcome {
        self.state = SessionState::Streaming;
        tracing::debug!(session = %self.id, user_session = %self.user_session, route = %self.route, "session streaming");

        let stop = self.stop.clone();
        let ending = loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                item = tokens.next() => Some(item),
            };

            match next {
                None => break Ending::Cancelled,
                Some(None) => {
                    let tail = self.parser.finish();
                    if !self.absorb(tail, events.as_ref()) {
                        break Ending::Cancelled;
                    }
                    break Ending::Done;
                }
                Some(Some(Err(error))) => break Ending::Failed(error),
                Some(Some(Ok(fragment))) => {
                    let segments = self.parser.feed(&fragment);
                    if !self.absorb(segments, events.as_ref()) {
                        break Ending::Cancelled;
                    }
                }
            }
        };
        drop(tokens);

        self.finish(ending)
    }

    /// Appends segments to the buffers and forwards them. Returns false when
    /// the session was stopped before everything was delivered.
    fn absorb(
        &mut self,
        segments: Vec<Segment>,
        events: Option<&mpsc::UnboundedSender<SessionEvent>>,
    ) -> bool {
        for segment in segments {
            if self.stop.is_stopped() {
                return false;
            }
            let event = match segment {
                Segment::Reasoning(text) => {
                    self.reasoning.push_str(&text);
                    SessionEvent::Reasoning(text)
                }
                Segment::Answer(text) => {
                    self.answer.push_str(&text);
                    SessionEvent::Answer(text)
                }
            };
            if let Some(sender) = events {
                // A caller that stopped listening still gets the final outcome.
                let _ = sender.send(event);
            }
        }
        !self.stop.is_stopped()
    }

    fn finish(mut self, ending: Ending) -> SessionOutcome {
        let (state, answer, reasoning, error) = match ending {
            Ending::Done => {
                let reconciled = reconcile(&self.answer, &self.sources, self.route);
                let reasoning = std::mem::take(&mut self.reasoning);
                (
                    SessionState::Done,
                    Some(reconciled),
                    (!reasoning.is_empty()).then_some(reasoning),
                    None,
                )
            }
            Ending::Cancelled => (SessionState::Cancelled, None, None, None),
            Ending::Failed(error) => {
                tracing::warn!(session = %self.id, %error, "token stream failed");
                (
                    SessionState::Error,
                    None,
                    None,
                    Some(error.user_message().to_string()),
                )
            }
        };
        self.state = state;
        self.answer.clear();
        self.reasoning.clear();
        tracing::info!(session = %self.id, route = %self.route, %state, "session ended");

        SessionOutcome {
            session_id: self.id.clone(),
            state,
            route: self.route,
            answer,
            reasoning,
            error,
        }
    }
}

enum Ending {
    Done,
    Cancelled,
    Failed(InferenceError),
}

/// Stop flags of the sessions currently streaming, keyed by user session and
/// session id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashMap<(String, String), StopSignal>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), StopSignal>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, user_session: &str, session_id: &str, stop: StopSignal) {
        self.lock()
            .insert((user_session.to_string(), session_id.to_string()), stop);
    }

    fn remove(&self, user_session: &str, session_id: &str) {
        self.lock()
            .remove(&(user_session.to_string(), session_id.to_string()));
    }

    /// Stops one session. Returns false when it is not (or no longer) active.
    pub fn stop(&self, user_session: &str, session_id: &str) -> bool {
        let key = (user_session.to_string(), session_id.to_string());
        match self.lock().get(&key) {
            Some(stop) => {
                stop.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every active session of one user session.
    pub fn stop_all(&self, user_session: &str) -> usize {
        let guard = self.lock();
        let mut stopped = 0;
        for ((owner, _), stop) in guard.iter() {
            if owner == user_session {
                stop.stop();
                stopped += 1;
            }
        }
        stopped
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

struct ActiveEntry {
    registry: SessionRegistry,
    user_session: String,
    session_id: String,
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        self.registry.remove(&self.user_session, &self.session_id);
    }
}
