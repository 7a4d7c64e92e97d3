//! Run lifecycle and local-to-backend message mapping.
//!
//! `idle → streaming → {done | cancelled | error}`. Terminal states reject
//! further transitions; repeating a terminal action is a no-op.

mod state;
mod store;

pub use state::{
    CANCELLED_CODE, CANCELLED_MESSAGE, MessageMeta, RunAction, RunField, RunOutcome, RunRecord,
    RunState, RunStatus,
};
pub use store::RunStore;
