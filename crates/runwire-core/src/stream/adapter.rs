//! Chat run orchestration.
//!
//! [`ChatClient`] submits a run, binds the backend ids it gets back, opens the
//! SSE stream, and applies events to the run store and the local transcript
//! from a spawned task. At most one stream is open per client; starting a new
//! run or cancelling aborts the previous one first.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use runwire_types::{ChatMessage, Role, ServerMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sse::{RunEvent, SseParser, StreamError};
use crate::config::Config;
use crate::reconcile::reconcile_messages;
use crate::runs::RunStore;
use crate::transport::{FetchOptions, SessionClient, TransportError};

const CHAT_PATH: &str = "/v1/chat";
const STREAM_PATH: &str = "/v1/chat/stream";
const CANCEL_PATH: &str = "/v1/chat/cancel";

/// Code recorded when the stream stays silent longer than the idle timeout.
pub const STREAM_TIMEOUT_CODE: &str = "E_STREAM_TIMEOUT";

/// Errors returned by [`ChatClient`] operations.
///
/// Failures after a run has been created are also recorded on the run, so
/// subscribers see them even when the caller ignores the result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unknown run: {0}")]
    UnknownRun(String),
}

type Transcript = Arc<watch::Sender<Arc<Vec<ChatMessage>>>>;

struct ActiveStream {
    run_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveStream {
    fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

// === Wire types ===

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_of_run_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    id: &'a str,
    role: Role,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        Self {
            id: &message.id,
            role: message.role,
            content: &message.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    run_id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    run_id: &'a str,
}

/// Client for creating, streaming, cancelling and retrying chat runs.
pub struct ChatClient {
    session: SessionClient,
    store: RunStore,
    config: Config,
    transcript: Transcript,
    active: Mutex<Option<ActiveStream>>,
}

impl ChatClient {
    /// Creates a client with its own session, CSRF cache and run store.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built for the base URL.
    pub fn new(config: Config) -> Result<Self, ChatError> {
        let session = SessionClient::new(&config)?;
        Ok(Self::with_session(session, RunStore::new(), config))
    }

    pub fn with_session(session: SessionClient, store: RunStore, config: Config) -> Self {
        let (transcript, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            session,
            store,
            config,
            transcript: Arc::new(transcript),
            active: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    /// Local transcript: optimistic user messages and streamed assistant
    /// content, in insertion order.
    pub fn transcript(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.transcript.borrow())
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Arc<Vec<ChatMessage>>> {
        self.transcript.subscribe()
    }

    /// Replaces the local transcript, e.g. after loading a conversation.
    pub fn replace_transcript(&self, messages: Vec<ChatMessage>) {
        self.transcript.send_replace(Arc::new(messages));
    }

    /// Display list for the current transcript merged with `server`.
    pub fn messages(&self, server: &[ServerMessage], now: DateTime<Utc>) -> Vec<ChatMessage> {
        let local = self.transcript();
        let state = self.store.snapshot();
        reconcile_messages(
            &local,
            server,
            &state,
            now,
            &self.config.reconcile_options(),
        )
    }

    /// Aborts any open stream and clears runs and the transcript.
    pub fn reset(&self) {
        if let Some(active) = self.take_active() {
            active.abort();
        }
        self.store.reset();
        self.transcript.send_replace(Arc::new(Vec::new()));
    }

    /// Submits `request_messages` as a new run and starts streaming its reply.
    ///
    /// Returns the local run id once the stream task is running. A failure to
    /// open the stream is recorded on the run and still returns `Ok`.
    ///
    /// # Errors
    /// Returns the transport error if run creation fails. The run is marked
    /// `error` first so the unsent messages stay visible.
    pub async fn send_run(
        &self,
        request_messages: &[ChatMessage],
        conversation_id: Option<&str>,
    ) -> Result<String, ChatError> {
        self.submit(request_messages, conversation_id, None).await
    }

    /// Re-submits the request snapshot of `run_id` as a new run linked to it.
    ///
    /// # Errors
    /// Returns [`ChatError::UnknownRun`] if the run does not exist, otherwise
    /// the same errors as [`ChatClient::send_run`].
    pub async fn retry(&self, run_id: &str) -> Result<String, ChatError> {
        let original = self
            .store
            .run(run_id)
            .ok_or_else(|| ChatError::UnknownRun(run_id.to_string()))?;
        tracing::info!(%run_id, "retrying run");
        self.submit(
            &original.request_messages,
            original.conversation_id.as_deref(),
            Some(run_id),
        )
        .await
    }

    /// Cancels a run locally and asks the backend to stop it.
    ///
    /// The run is `cancelled` when this returns, whatever the backend says.
    ///
    /// # Errors
    /// Returns [`ChatError::UnknownRun`] if the run does not exist.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ChatError> {
        let run = self
            .store
            .run(run_id)
            .ok_or_else(|| ChatError::UnknownRun(run_id.to_string()))?;

        if let Some(active) = self.take_active_for(run_id) {
            active.abort();
        }
        if run.status.is_terminal() {
            return Ok(());
        }
        self.store.mark_cancelled(run_id);

        match run.backend_run_id.as_deref() {
            Some(backend_run_id) => self.post_cancel(backend_run_id).await,
            None => {
                tracing::warn!(%run_id, "run has no backend id yet, cancelled locally only");
            }
        }
        Ok(())
    }

    async fn submit(
        &self,
        request_messages: &[ChatMessage],
        conversation_id: Option<&str>,
        retry_of: Option<&str>,
    ) -> Result<String, ChatError> {
        if let Some(previous) = self.take_active() {
            tracing::debug!(run_id = %previous.run_id, "superseding open stream");
            self.store.mark_cancelled(&previous.run_id);
            previous.abort();
        }
        // A run still creating or opening its stream has no handle yet; once
        // terminal, its own submission stops before streaming.
        if let Some(previous) = self.store.active_run()
            && !previous.status.is_terminal()
        {
            tracing::debug!(run_id = %previous.id, "superseding run in flight");
            self.store.mark_cancelled(&previous.id);
        }

        let source = request_messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User);
        let run_id = self.store.create_run(
            request_messages,
            retry_of,
            conversation_id,
            source.map(|message| message.id.as_str()),
        );
        self.append_pending(request_messages, &run_id);

        let backend_retry_of = retry_of
            .and_then(|id| self.store.run(id))
            .and_then(|run| run.backend_run_id);
        let created = match self
            .create_backend_run(request_messages, conversation_id, backend_retry_of.as_deref())
            .await
        {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(%run_id, "run creation failed: {err}");
                self.store.mark_error(&run_id, &err.code(), &err.to_string());
                return Err(err.into());
            }
        };

        if self.is_terminal(&run_id) {
            // Cancelled while the creation request was in flight.
            self.post_cancel(&created.run_id).await;
            return Ok(run_id);
        }

        self.store.attach_backend_run_id(&run_id, &created.run_id);
        if let Some(conversation_id) = &created.conversation_id {
            self.store.attach_conversation_id(&run_id, conversation_id);
        }
        if let Some(message_id) = &created.message_id {
            self.store.attach_source_message_id(&run_id, message_id);
            if let Some(source) = source {
                self.store.attach_message_backend_id(&source.id, message_id);
            }
        }

        let assistant_id = Uuid::new_v4().to_string();
        self.transcript.send_modify(|messages| {
            Arc::make_mut(messages).push(ChatMessage::assistant(&assistant_id, ""));
        });
        self.store
            .mark_message_pending(&assistant_id, true, Some(&run_id));
        self.store.start_run(&run_id, &assistant_id);

        let response = match self.open_stream(&created.run_id).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%run_id, "failed to open run stream: {err}");
                self.store.mark_error(&run_id, &err.code(), &err.to_string());
                return Ok(run_id);
            }
        };
        if self.is_terminal(&run_id) {
            return Ok(run_id);
        }

        tracing::debug!(%run_id, backend_run_id = %created.run_id, "run stream opened");
        let events = SseParser::new(Box::pin(response.bytes_stream()));
        let cancel = CancellationToken::new();
        let pump = StreamPump {
            store: self.store.clone(),
            transcript: Arc::clone(&self.transcript),
            run_id: run_id.clone(),
            assistant_id,
            idle_timeout: self.config.stream_idle_timeout(),
            deltas: BTreeMap::new(),
        };
        let task = tokio::spawn(pump.run(events, cancel.clone()));

        let replaced = self.active().replace(ActiveStream {
            run_id: run_id.clone(),
            cancel,
            task,
        });
        if let Some(replaced) = replaced {
            self.store.mark_cancelled(&replaced.run_id);
            replaced.abort();
        }
        Ok(run_id)
    }

    /// Appends request messages the transcript does not have yet and marks
    /// every unbound one pending under `run_id`.
    fn append_pending(&self, request_messages: &[ChatMessage], run_id: &str) {
        self.transcript.send_if_modified(|messages| {
            let missing: Vec<ChatMessage> = request_messages
                .iter()
                .filter(|message| !messages.iter().any(|existing| existing.id == message.id))
                .cloned()
                .collect();
            if missing.is_empty() {
                return false;
            }
            Arc::make_mut(messages).extend(missing);
            true
        });

        for message in request_messages {
            let bound = self
                .store
                .message_meta(&message.id)
                .is_some_and(|meta| meta.backend_message_id.is_some());
            if !bound {
                self.store
                    .mark_message_pending(&message.id, true, Some(run_id));
            }
        }
    }

    async fn create_backend_run(
        &self,
        request_messages: &[ChatMessage],
        conversation_id: Option<&str>,
        retry_of_run_id: Option<&str>,
    ) -> Result<ChatResponse, TransportError> {
        let body = ChatRequest {
            messages: request_messages.iter().map(WireMessage::from).collect(),
            conversation_id,
            retry_of_run_id,
        };
        let url = self.session.csrf().url(CHAT_PATH);
        let response = self
            .session
            .fetch_with_session(
                |http| http.post(&url).json(&body),
                FetchOptions::request(&self.config),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &text));
        }
        Ok(response.json().await?)
    }

    async fn open_stream(&self, backend_run_id: &str) -> Result<reqwest::Response, TransportError> {
        let url = self.session.csrf().url(STREAM_PATH);
        let response = self
            .session
            .fetch_with_session(
                |http| {
                    http.get(&url)
                        .query(&[("run_id", backend_run_id)])
                        .header(ACCEPT, "text/event-stream")
                },
                FetchOptions::stream(&self.config),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &text));
        }
        Ok(response)
    }

    async fn post_cancel(&self, backend_run_id: &str) {
        let url = self.session.csrf().url(CANCEL_PATH);
        let body = CancelRequest {
            run_id: backend_run_id,
        };
        let result = self
            .session
            .fetch_with_session(
                |http| http.post(&url).json(&body),
                FetchOptions::request(&self.config),
            )
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(%backend_run_id, "backend run cancelled");
            }
            Ok(response) => {
                tracing::warn!(
                    %backend_run_id,
                    status = response.status().as_u16(),
                    "backend cancel rejected"
                );
            }
            Err(err) => {
                tracing::warn!(%backend_run_id, "backend cancel failed: {err}");
            }
        }
    }

    fn is_terminal(&self, run_id: &str) -> bool {
        self.store
            .run(run_id)
            .is_none_or(|run| run.status.is_terminal())
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_active(&self) -> Option<ActiveStream> {
        self.active().take()
    }

    fn take_active_for(&self, run_id: &str) -> Option<ActiveStream> {
        let mut active = self.active();
        if active.as_ref().is_some_and(|stream| stream.run_id == run_id) {
            active.take()
        } else {
            None
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(active) = self.take_active() {
            active.abort();
        }
    }
}

/// Consumes one run's events and applies them to the store and transcript.
struct StreamPump {
    store: RunStore,
    transcript: Transcript,
    run_id: String,
    assistant_id: String,
    idle_timeout: Option<Duration>,
    deltas: BTreeMap<u64, String>,
}

impl StreamPump {
    async fn run<S>(mut self, mut events: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<RunEvent, StreamError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(run_id = %self.run_id, "run stream aborted");
                    return;
                }
                next = next_event(&mut events, self.idle_timeout) => next,
            };

            match next {
                None => {
                    tracing::warn!(run_id = %self.run_id, "run stream idle timeout");
                    self.store.mark_error(
                        &self.run_id,
                        STREAM_TIMEOUT_CODE,
                        "no stream event within the idle timeout",
                    );
                    return;
                }
                Some(None) => {
                    tracing::debug!(run_id = %self.run_id, "run stream closed");
                    self.store.mark_done(&self.run_id);
                    return;
                }
                Some(Some(Err(err))) => {
                    tracing::warn!(run_id = %self.run_id, "run stream failed: {err}");
                    self.store.mark_error(&self.run_id, err.code(), &err.message);
                    return;
                }
                Some(Some(Ok(event))) => {
                    if self.apply(event) {
                        return;
                    }
                }
            }
        }
    }

    /// Applies one event. Returns `true` once the run is finished.
    fn apply(&mut self, event: RunEvent) -> bool {
        match event {
            RunEvent::Delta {
                seq,
                text,
                message_id,
            } => {
                if self.deltas.contains_key(&seq) {
                    tracing::debug!(run_id = %self.run_id, seq, "duplicate delta ignored");
                    return false;
                }
                self.deltas.insert(seq, text);
                self.store.attach_event_seq(&self.run_id, seq);
                self.store.mark_delta(&self.run_id);
                self.store.attach_message_event_seq(&self.assistant_id, seq);
                if let Some(message_id) = message_id {
                    self.bind_result(&message_id);
                }
                self.render();
                false
            }
            RunEvent::Done {
                seq,
                message_id,
                conversation_id,
            } => {
                if let Some(seq) = seq {
                    self.store.attach_event_seq(&self.run_id, seq);
                }
                if let Some(conversation_id) = conversation_id {
                    self.store
                        .attach_conversation_id(&self.run_id, &conversation_id);
                }
                if let Some(message_id) = message_id {
                    self.bind_result(&message_id);
                }
                tracing::debug!(run_id = %self.run_id, "run done");
                self.store.mark_done(&self.run_id);
                true
            }
            RunEvent::Error { seq, code, message } => {
                if let Some(seq) = seq {
                    self.store.attach_event_seq(&self.run_id, seq);
                }
                tracing::warn!(run_id = %self.run_id, %code, "run failed: {message}");
                self.store.mark_error(&self.run_id, &code, &message);
                true
            }
            RunEvent::Ping => false,
            RunEvent::Ignored { event } => {
                tracing::debug!(run_id = %self.run_id, %event, "ignoring stream event");
                false
            }
        }
    }

    fn bind_result(&self, message_id: &str) {
        self.store
            .attach_result_message_id(&self.run_id, message_id);
        self.store
            .attach_message_backend_id(&self.assistant_id, message_id);
    }

    /// Rebuilds the assistant message from deltas in `seq` order.
    fn render(&self) {
        let content: String = self.deltas.values().map(String::as_str).collect();
        self.transcript.send_if_modified(|messages| {
            let Some(index) = messages
                .iter()
                .position(|message| message.id == self.assistant_id)
            else {
                return false;
            };
            if messages[index].content == content {
                return false;
            }
            Arc::make_mut(messages)[index].content = content;
            true
        });
    }
}

/// Next event, or `None` when the idle timeout elapses first.
async fn next_event<S>(
    events: &mut S,
    idle_timeout: Option<Duration>,
) -> Option<Option<Result<RunEvent, StreamError>>>
where
    S: Stream<Item = Result<RunEvent, StreamError>> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, events.next()).await.ok(),
        None => Some(events.next().await),
    }
}
