//! Authenticated HTTP channel to the chat backend.
//!
//! [`CsrfClient`] owns the CSRF token cache and the single-retry-on-rejection
//! fetch. [`SessionClient`] wraps it and resynchronizes auth state after a
//! 401 without retrying the triggering request.

pub mod cookie;
pub mod csrf;
pub mod error;
pub mod session;

use std::time::Duration;

pub use cookie::read_cookie;
pub use csrf::{CSRF_HEADER, CSRF_REJECTED_CODE, CsrfClient};
pub use error::{ApiError, TransportError};
pub use session::{AuthStatus, SessionClient};

use crate::config::Config;

/// Per-request options for [`CsrfClient::fetch_with_csrf`] and
/// [`SessionClient::fetch_with_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Re-bootstrap and retry exactly once on an E2002 rejection.
    pub retry_on_rejection: bool,
    /// Whole-request timeout. Streaming requests leave this unset.
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retry_on_rejection: true,
            timeout: None,
        }
    }
}

impl FetchOptions {
    /// Options for a bounded request/response call.
    pub fn request(config: &Config) -> Self {
        Self {
            retry_on_rejection: config.retry_on_csrf_rejection,
            timeout: config.request_timeout(),
        }
    }

    /// Options for a long-lived streaming response.
    pub fn stream(config: &Config) -> Self {
        Self {
            retry_on_rejection: config.retry_on_csrf_rejection,
            timeout: None,
        }
    }
}
