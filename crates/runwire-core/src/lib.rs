//! Client-side chat run transport.
//!
//! Layers, leaf to root:
//! - [`transport`]: cookie reader, CSRF token cache with bootstrap, and the
//!   session-aware fetch wrapper.
//! - [`runs`]: the run store, a pure state container for run lifecycle and
//!   local-to-backend message mapping.
//! - [`reconcile`]: merges optimistic local messages with server-confirmed
//!   ones into the display list.
//! - [`stream`]: submits runs, consumes SSE, applies deltas, cancels and
//!   retries.

pub mod config;
pub mod logging;
pub mod reconcile;
pub mod runs;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use runwire_types::{ChatMessage, Role, ServerMessage};
