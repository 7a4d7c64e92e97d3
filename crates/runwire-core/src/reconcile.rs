//! Merge of optimistic local messages with server-confirmed messages.
//!
//! [`reconcile_messages`] is a pure function of its inputs and safe to call on
//! every state change. Local messages are classified through their
//! [`MessageMeta`]:
//!
//! - bound to a backend id the server list contains: replaced by the server
//!   record (server content and timestamp win)
//! - bound to a backend id the server list does not contain yet: kept as is
//! - pending, unbound, and younger than the pending window: kept
//! - unbound and owned by a run that ended in `error`: kept regardless of age
//! - anything else: dropped
//!
//! Ordering between two messages uses, in order of precedence, their
//! `event_seq` when both have one, then server order when both came from the
//! server, then timestamps.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use runwire_types::{ChatMessage, ServerMessage};

use crate::runs::{MessageMeta, RunState, RunStatus};

/// Tunables for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// How long an unconfirmed pending message stays visible.
    pub pending_window: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            pending_window: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Server(usize),
    Local,
}

#[derive(Debug)]
struct Candidate {
    message: ChatMessage,
    seq: Option<u64>,
    origin: Origin,
}

enum Disposition<'a> {
    Superseded { backend_id: &'a str, seq: Option<u64> },
    Keep { identity: &'a str, seq: Option<u64> },
    Drop,
}

/// Produces the ordered, de-duplicated display list.
pub fn reconcile_messages(
    local: &[ChatMessage],
    server: &[ServerMessage],
    state: &RunState,
    now: DateTime<Utc>,
    options: &ReconcileOptions,
) -> Vec<ChatMessage> {
    let server_ids: HashSet<&str> = server.iter().map(|m| m.id.as_str()).collect();

    // Sequence numbers learned locally for messages the server now owns.
    let mut carried_seq: HashMap<&str, u64> = HashMap::new();
    let mut kept_local = Vec::new();

    for message in local {
        let meta = state.message_meta(&message.id);
        match classify(message, meta, state, &server_ids, now, options) {
            Disposition::Superseded { backend_id, seq } => {
                if let Some(seq) = seq {
                    carried_seq
                        .entry(backend_id)
                        .and_modify(|current| *current = (*current).max(seq))
                        .or_insert(seq);
                }
            }
            Disposition::Keep { identity, seq } => kept_local.push((identity, message, seq)),
            Disposition::Drop => {}
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut candidates = Vec::with_capacity(server.len() + kept_local.len());

    for (index, message) in server.iter().enumerate() {
        if !seen.insert(message.id.as_str()) {
            continue;
        }
        candidates.push(Candidate {
            message: ChatMessage::from(message),
            seq: message
                .event_seq
                .or_else(|| carried_seq.get(message.id.as_str()).copied()),
            origin: Origin::Server(index),
        });
    }

    for (identity, message, seq) in kept_local {
        // Unbound messages use their local id as identity.
        let fresh = seen.insert(identity);
        if fresh && (identity == message.id || seen.insert(message.id.as_str())) {
            candidates.push(Candidate {
                message: message.clone(),
                seq,
                origin: Origin::Local,
            });
        }
    }

    merge(candidates)
        .into_iter()
        .map(|candidate| candidate.message)
        .collect()
}

fn classify<'a>(
    message: &'a ChatMessage,
    meta: Option<&'a MessageMeta>,
    state: &RunState,
    server_ids: &HashSet<&str>,
    now: DateTime<Utc>,
    options: &ReconcileOptions,
) -> Disposition<'a> {
    let Some(meta) = meta else {
        return Disposition::Drop;
    };

    if let Some(backend_id) = meta.backend_message_id.as_deref() {
        return if server_ids.contains(backend_id) {
            Disposition::Superseded {
                backend_id,
                seq: meta.event_seq,
            }
        } else {
            Disposition::Keep {
                identity: backend_id,
                seq: meta.event_seq,
            }
        };
    }

    let keep = (meta.pending && is_recent(message.timestamp, now, options.pending_window))
        || state
            .run(&meta.run_id)
            .is_some_and(|run| run.status == RunStatus::Error);

    if keep {
        Disposition::Keep {
            identity: &message.id,
            seq: meta.event_seq,
        }
    } else {
        Disposition::Drop
    }
}

fn is_recent(timestamp: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now.signed_duration_since(timestamp) <= window,
        Err(_) => true,
    }
}

fn precedence(a: &Candidate, b: &Candidate) -> Ordering {
    if let (Some(x), Some(y)) = (a.seq, b.seq)
        && x != y
    {
        return x.cmp(&y);
    }
    if let (Origin::Server(i), Origin::Server(j)) = (a.origin, b.origin) {
        return i.cmp(&j);
    }
    a.message.timestamp.cmp(&b.message.timestamp)
}

/// Stable insertion merge.
///
/// The pairwise precedence is not guaranteed to be transitive when only some
/// messages carry a sequence number, so this never hands it to a sort that
/// requires a total order.
fn merge(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut position = merged.len();
        while position > 0 && precedence(&candidate, &merged[position - 1]) == Ordering::Less {
            position -= 1;
        }
        merged.insert(position, candidate);
    }
    merged
}
