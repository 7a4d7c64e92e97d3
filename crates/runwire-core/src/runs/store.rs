//! Observable run store.
//!
//! Wraps [`RunState`] in a `watch` channel. Each action applies the
//! transition copy-on-write and publishes only if something changed, all
//! inside one `send_if_modified` call so subscribers never observe a partial
//! mutation. Snapshots already handed out are never modified.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use runwire_types::ChatMessage;
use tokio::sync::watch;
use uuid::Uuid;

use super::state::{MessageMeta, RunAction, RunField, RunOutcome, RunRecord, RunState};

/// Owner of the run state. Cloning shares the same underlying store.
#[derive(Clone)]
pub struct RunStore {
    tx: Arc<watch::Sender<Arc<RunState>>>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(RunState::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Applies an action and notifies subscribers if the state changed.
    pub fn dispatch(&self, action: RunAction) -> bool {
        // Clones the state only while a reader still holds the current snapshot.
        self.tx
            .send_if_modified(|snapshot| Arc::make_mut(snapshot).apply(action))
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<RunState> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver that yields a new snapshot after every effective mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RunState>> {
        self.tx.subscribe()
    }

    pub fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.tx.borrow().run(run_id).cloned()
    }

    pub fn message_meta(&self, local_id: &str) -> Option<MessageMeta> {
        self.tx.borrow().message_meta(local_id).cloned()
    }

    pub fn active_run(&self) -> Option<RunRecord> {
        self.tx.borrow().active_run().cloned()
    }

    /// Most recently created run, terminal or not.
    pub fn last_run(&self) -> Option<RunRecord> {
        self.tx.borrow().last_run().cloned()
    }

    pub fn retry_lineage(&self, run_id: &str) -> Vec<String> {
        self.tx.borrow().retry_lineage(run_id)
    }

    /// Waits until `run_id` reaches a terminal state and returns its record.
    ///
    /// Returns `None` if the run is unknown (or disappears on reset).
    pub async fn wait_for_terminal(&self, run_id: &str) -> Option<RunRecord> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|state| {
                state
                    .run(run_id)
                    .is_none_or(|run| run.status.is_terminal())
            })
            .await
            .ok()?;
        state.run(run_id).cloned()
    }

    /// Creates an idle run and makes it the active and last run.
    ///
    /// `request_messages` is copied; later changes to the caller's messages
    /// never reach the stored snapshot.
    pub fn create_run(
        &self,
        request_messages: &[ChatMessage],
        retry_of_run_id: Option<&str>,
        conversation_id: Option<&str>,
        source_message_id: Option<&str>,
    ) -> String {
        let run_id = Uuid::new_v4().to_string();
        self.dispatch(RunAction::Create {
            run_id: run_id.clone(),
            request_messages: Arc::from(request_messages),
            retry_of_run_id: retry_of_run_id.map(str::to_string),
            conversation_id: conversation_id.map(str::to_string),
            source_message_id: source_message_id.map(str::to_string),
            at: Utc::now(),
        });
        tracing::debug!(%run_id, retry_of = ?retry_of_run_id, "run created");
        run_id
    }

    pub fn start_run(&self, run_id: &str, assistant_message_id: &str) {
        self.dispatch(RunAction::Start {
            run_id: run_id.to_string(),
            assistant_message_id: assistant_message_id.to_string(),
        });
    }

    pub fn mark_delta(&self, run_id: &str) {
        self.dispatch(RunAction::MarkDelta {
            run_id: run_id.to_string(),
        });
    }

    pub fn attach_backend_run_id(&self, run_id: &str, backend_run_id: &str) {
        self.attach(run_id, RunField::BackendRunId, backend_run_id);
    }

    pub fn attach_conversation_id(&self, run_id: &str, conversation_id: &str) {
        self.attach(run_id, RunField::ConversationId, conversation_id);
    }

    pub fn attach_source_message_id(&self, run_id: &str, message_id: &str) {
        self.attach(run_id, RunField::SourceMessageId, message_id);
    }

    pub fn attach_result_message_id(&self, run_id: &str, message_id: &str) {
        self.attach(run_id, RunField::ResultMessageId, message_id);
    }

    fn attach(&self, run_id: &str, field: RunField, value: &str) {
        self.dispatch(RunAction::Attach {
            run_id: run_id.to_string(),
            field,
            value: value.to_string(),
        });
    }

    /// Records a stream sequence number: the first value seen sticks, the
    /// last is the maximum.
    pub fn attach_event_seq(&self, run_id: &str, seq: u64) {
        self.dispatch(RunAction::AttachEventSeq {
            run_id: run_id.to_string(),
            seq,
        });
    }

    /// Sets the pending flag. Creates metadata only when `run_id` is given.
    pub fn mark_message_pending(&self, local_id: &str, pending: bool, run_id: Option<&str>) {
        self.dispatch(RunAction::MarkMessagePending {
            local_id: local_id.to_string(),
            pending,
            run_id: run_id.map(str::to_string),
        });
    }

    pub fn attach_message_backend_id(&self, local_id: &str, backend_message_id: &str) {
        self.dispatch(RunAction::AttachMessageBackendId {
            local_id: local_id.to_string(),
            backend_id: backend_message_id.to_string(),
        });
    }

    pub fn attach_message_event_seq(&self, local_id: &str, seq: u64) {
        self.dispatch(RunAction::AttachMessageEventSeq {
            local_id: local_id.to_string(),
            seq,
        });
    }

    pub fn attach_message_lineage(
        &self,
        local_id: &str,
        parent_message_id: Option<&str>,
        branch_id: Option<&str>,
    ) {
        self.dispatch(RunAction::AttachMessageLineage {
            local_id: local_id.to_string(),
            parent_message_id: parent_message_id.map(str::to_string),
            branch_id: branch_id.map(str::to_string),
        });
    }

    /// Binds backend ids for every known local id in one notification.
    pub fn reconcile_message_map(&self, local_to_backend: HashMap<String, String>) {
        self.dispatch(RunAction::ReconcileMessageMap(local_to_backend));
    }

    pub fn mark_cancelled(&self, run_id: &str) {
        self.finish(run_id, RunOutcome::Cancelled);
    }

    pub fn mark_error(&self, run_id: &str, code: &str, message: &str) {
        self.finish(
            run_id,
            RunOutcome::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    pub fn mark_done(&self, run_id: &str) {
        self.finish(run_id, RunOutcome::Done);
    }

    fn finish(&self, run_id: &str, outcome: RunOutcome) {
        let label = match &outcome {
            RunOutcome::Done => "done",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Error { .. } => "error",
        };
        if self.dispatch(RunAction::Finish {
            run_id: run_id.to_string(),
            outcome,
            at: Utc::now(),
        }) {
            tracing::debug!(%run_id, outcome = label, "run finished");
        }
    }

    /// Clears all runs and message metadata.
    pub fn reset(&self) {
        self.dispatch(RunAction::Reset);
    }
}
