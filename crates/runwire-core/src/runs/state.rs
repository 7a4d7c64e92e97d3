//! Run state and its pure transitions.
//!
//! [`RunState::apply`] is the only way the aggregate changes. Each action is a
//! synchronous transform that reports whether anything changed, so the store
//! can publish exactly one snapshot per effective mutation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use runwire_types::ChatMessage;
use serde::{Deserialize, Serialize};

/// Error code recorded on every cancelled run.
pub const CANCELLED_CODE: &str = "E_CANCELLED";
/// Error message recorded on every cancelled run.
pub const CANCELLED_MESSAGE: &str = "Run cancelled by user";

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Streaming,
    Done,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Cancelled | RunStatus::Error)
    }
}

/// One client/backend exchange, tracked from submission to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    /// Messages submitted with the run. Copied at creation, never mutated.
    pub request_messages: Arc<[ChatMessage]>,
    /// Local id of the assistant placeholder bound by `start_run`.
    pub result_assistant_message_id: Option<String>,
    pub backend_run_id: Option<String>,
    pub conversation_id: Option<String>,
    pub source_message_id: Option<String>,
    pub result_message_id: Option<String>,
    /// First sequence number ever observed for this run.
    pub first_event_seq: Option<u64>,
    /// Highest sequence number observed for this run.
    pub last_event_seq: Option<u64>,
    pub retry_of_run_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub received_any_delta: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-message bookkeeping keyed by local message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub run_id: String,
    pub retry_of_run_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub branch_id: Option<String>,
    pub backend_message_id: Option<String>,
    pub pending: bool,
    /// Only ever increases once set.
    pub event_seq: Option<u64>,
}

/// Run fields that are attached after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunField {
    BackendRunId,
    ConversationId,
    SourceMessageId,
    ResultMessageId,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Cancelled,
    Error { code: String, message: String },
}

/// Mutations accepted by [`RunState::apply`].
#[derive(Debug, Clone)]
pub enum RunAction {
    Create {
        run_id: String,
        request_messages: Arc<[ChatMessage]>,
        retry_of_run_id: Option<String>,
        conversation_id: Option<String>,
        source_message_id: Option<String>,
        at: DateTime<Utc>,
    },
    Start {
        run_id: String,
        assistant_message_id: String,
    },
    MarkDelta {
        run_id: String,
    },
    Attach {
        run_id: String,
        field: RunField,
        value: String,
    },
    AttachEventSeq {
        run_id: String,
        seq: u64,
    },
    MarkMessagePending {
        local_id: String,
        pending: bool,
        run_id: Option<String>,
    },
    AttachMessageBackendId {
        local_id: String,
        backend_id: String,
    },
    AttachMessageEventSeq {
        local_id: String,
        seq: u64,
    },
    AttachMessageLineage {
        local_id: String,
        parent_message_id: Option<String>,
        branch_id: Option<String>,
    },
    ReconcileMessageMap(HashMap<String, String>),
    Finish {
        run_id: String,
        outcome: RunOutcome,
        at: DateTime<Utc>,
    },
    Reset,
}

/// Aggregate run state. Readers only ever see immutable snapshots of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    /// At most one run is active at a time.
    pub active_run_id: Option<String>,
    pub last_run_id: Option<String>,
    pub runs_by_id: HashMap<String, RunRecord>,
    pub message_meta_by_id: HashMap<String, MessageMeta>,
    /// Incremented once per effective mutation.
    pub revision: u64,
}

impl RunState {
    pub fn run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs_by_id.get(run_id)
    }

    pub fn message_meta(&self, local_id: &str) -> Option<&MessageMeta> {
        self.message_meta_by_id.get(local_id)
    }

    pub fn active_run(&self) -> Option<&RunRecord> {
        self.active_run_id.as_deref().and_then(|id| self.run(id))
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.last_run_id.as_deref().and_then(|id| self.run(id))
    }

    /// Run ids from the original submission to `run_id`, following
    /// `retry_of_run_id` links. Empty if the run is unknown.
    pub fn retry_lineage(&self, run_id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = self.run(run_id);
        while let Some(run) = cursor {
            if chain.len() > self.runs_by_id.len() || chain.contains(&run.id) {
                break;
            }
            chain.push(run.id.clone());
            cursor = run.retry_of_run_id.as_deref().and_then(|id| self.run(id));
        }
        chain.reverse();
        chain
    }

    /// Applies one action. Returns `true` if the state changed.
    pub fn apply(&mut self, action: RunAction) -> bool {
        let changed = match action {
            RunAction::Create {
                run_id,
                request_messages,
                retry_of_run_id,
                conversation_id,
                source_message_id,
                at,
            } => {
                if self.runs_by_id.contains_key(&run_id) {
                    false
                } else {
                    let record = RunRecord {
                        id: run_id.clone(),
                        status: RunStatus::Idle,
                        request_messages,
                        result_assistant_message_id: None,
                        backend_run_id: None,
                        conversation_id,
                        source_message_id,
                        result_message_id: None,
                        first_event_seq: None,
                        last_event_seq: None,
                        retry_of_run_id,
                        error_code: None,
                        error_message: None,
                        received_any_delta: false,
                        created_at: at,
                        finished_at: None,
                    };
                    self.runs_by_id.insert(run_id.clone(), record);
                    self.active_run_id = Some(run_id.clone());
                    self.last_run_id = Some(run_id);
                    true
                }
            }
            RunAction::Start {
                run_id,
                assistant_message_id,
            } => match self.runs_by_id.get_mut(&run_id) {
                Some(run) if run.status == RunStatus::Idle => {
                    run.status = RunStatus::Streaming;
                    run.result_assistant_message_id = Some(assistant_message_id);
                    true
                }
                _ => false,
            },
            RunAction::MarkDelta { run_id } => match self.live_run_mut(&run_id) {
                Some(run) if !run.received_any_delta => {
                    run.received_any_delta = true;
                    true
                }
                _ => false,
            },
            RunAction::Attach {
                run_id,
                field,
                value,
            } => self.live_run_mut(&run_id).is_some_and(|run| {
                let slot = match field {
                    RunField::BackendRunId => &mut run.backend_run_id,
                    RunField::ConversationId => &mut run.conversation_id,
                    RunField::SourceMessageId => &mut run.source_message_id,
                    RunField::ResultMessageId => &mut run.result_message_id,
                };
                set_if_changed(slot, value)
            }),
            RunAction::AttachEventSeq { run_id, seq } => {
                self.live_run_mut(&run_id).is_some_and(|run| {
                    let first = run.first_event_seq.or(Some(seq));
                    let last = Some(run.last_event_seq.map_or(seq, |last| last.max(seq)));
                    let changed = first != run.first_event_seq || last != run.last_event_seq;
                    run.first_event_seq = first;
                    run.last_event_seq = last;
                    changed
                })
            }
            RunAction::MarkMessagePending {
                local_id,
                pending,
                run_id,
            } => self.mark_message_pending(local_id, pending, run_id),
            RunAction::AttachMessageBackendId {
                local_id,
                backend_id,
            } => self
                .message_meta_by_id
                .get_mut(&local_id)
                .is_some_and(|meta| bind_backend_id(meta, backend_id)),
            RunAction::AttachMessageEventSeq { local_id, seq } => self
                .message_meta_by_id
                .get_mut(&local_id)
                .is_some_and(|meta| {
                    let next = meta.event_seq.map_or(seq, |current| current.max(seq));
                    if meta.event_seq == Some(next) {
                        false
                    } else {
                        meta.event_seq = Some(next);
                        true
                    }
                }),
            RunAction::AttachMessageLineage {
                local_id,
                parent_message_id,
                branch_id,
            } => self
                .message_meta_by_id
                .get_mut(&local_id)
                .is_some_and(|meta| {
                    let parent = parent_message_id
                        .is_some_and(|id| set_if_changed(&mut meta.parent_message_id, id));
                    let branch =
                        branch_id.is_some_and(|id| set_if_changed(&mut meta.branch_id, id));
                    parent || branch
                }),
            RunAction::ReconcileMessageMap(local_to_backend) => {
                let mut changed = false;
                for (local_id, backend_id) in local_to_backend {
                    if let Some(meta) = self.message_meta_by_id.get_mut(&local_id) {
                        changed |= bind_backend_id(meta, backend_id);
                    }
                }
                changed
            }
            RunAction::Finish {
                run_id,
                outcome,
                at,
            } => self.finish(&run_id, outcome, at),
            RunAction::Reset => {
                let empty = RunState {
                    revision: self.revision,
                    ..RunState::default()
                };
                if *self == empty {
                    false
                } else {
                    *self = empty;
                    true
                }
            }
        };

        if changed {
            self.revision += 1;
        }
        changed
    }

    fn live_run_mut(&mut self, run_id: &str) -> Option<&mut RunRecord> {
        self.runs_by_id
            .get_mut(run_id)
            .filter(|run| !run.status.is_terminal())
    }

    fn mark_message_pending(
        &mut self,
        local_id: String,
        pending: bool,
        run_id: Option<String>,
    ) -> bool {
        if let Some(meta) = self.message_meta_by_id.get_mut(&local_id) {
            let mut changed = false;
            if meta.pending != pending {
                meta.pending = pending;
                changed = true;
            }
            if let Some(run_id) = run_id
                && meta.run_id != run_id
            {
                meta.run_id = run_id;
                changed = true;
            }
            return changed;
        }

        // No orphan entries: creating metadata requires an owning run.
        let Some(run_id) = run_id else {
            return false;
        };
        let retry_of_run_id = self
            .runs_by_id
            .get(&run_id)
            .and_then(|run| run.retry_of_run_id.clone());
        self.message_meta_by_id.insert(
            local_id,
            MessageMeta {
                run_id,
                retry_of_run_id,
                pending,
                ..MessageMeta::default()
            },
        );
        true
    }

    fn finish(&mut self, run_id: &str, outcome: RunOutcome, at: DateTime<Utc>) -> bool {
        let Some(run) = self.live_run_mut(run_id) else {
            return false;
        };

        match outcome {
            RunOutcome::Done => run.status = RunStatus::Done,
            RunOutcome::Cancelled => {
                run.status = RunStatus::Cancelled;
                run.error_code = Some(CANCELLED_CODE.to_string());
                run.error_message = Some(CANCELLED_MESSAGE.to_string());
            }
            RunOutcome::Error { code, message } => {
                run.status = RunStatus::Error;
                run.error_code = Some(code);
                run.error_message = Some(message);
            }
        }
        run.finished_at = Some(at);

        if self.active_run_id.as_deref() == Some(run_id) {
            self.active_run_id = None;
        }
        true
    }
}

fn set_if_changed(slot: &mut Option<String>, value: String) -> bool {
    if slot.as_deref() == Some(value.as_str()) {
        false
    } else {
        *slot = Some(value);
        true
    }
}

fn bind_backend_id(meta: &mut MessageMeta, backend_id: String) -> bool {
    let was_pending = std::mem::replace(&mut meta.pending, false);
    set_if_changed(&mut meta.backend_message_id, backend_id) || was_pending
}
