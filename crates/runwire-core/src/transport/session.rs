//! Session-aware fetch.
//!
//! A 401 means the client's view of authentication is stale. The wrapper asks
//! the metadata endpoint for the real auth flag and publishes it, then hands
//! the original 401 back. The triggering request is never retried.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::watch;

use super::csrf::CsrfClient;
use super::error::TransportError;
use super::FetchOptions;
use crate::config::Config;

const META_PATH: &str = "/v1/meta";

/// Client-side view of whether the session is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    /// No metadata call has completed yet.
    #[default]
    Unknown,
    Authenticated,
    Unauthenticated,
}

impl From<bool> for AuthStatus {
    fn from(authenticated: bool) -> Self {
        if authenticated {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Unauthenticated
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    auth: MetaAuth,
}

#[derive(Debug, Deserialize)]
struct MetaAuth {
    authenticated: bool,
}

/// Fetch wrapper that keeps shared auth state in sync.
#[derive(Clone)]
pub struct SessionClient {
    csrf: CsrfClient,
    auth: Arc<watch::Sender<AuthStatus>>,
    meta_timeout: Option<Duration>,
}

impl SessionClient {
    /// Creates a session client over a fresh [`CsrfClient`].
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Ok(Self::with_csrf(CsrfClient::new(config)?, config.request_timeout()))
    }

    pub fn with_csrf(csrf: CsrfClient, meta_timeout: Option<Duration>) -> Self {
        let (auth, _) = watch::channel(AuthStatus::Unknown);
        Self {
            csrf,
            auth: Arc::new(auth),
            meta_timeout,
        }
    }

    pub fn csrf(&self) -> &CsrfClient {
        &self.csrf
    }

    /// Current auth state.
    pub fn auth_status(&self) -> AuthStatus {
        *self.auth.borrow()
    }

    /// Subscribes to auth state changes.
    pub fn subscribe_auth(&self) -> watch::Receiver<AuthStatus> {
        self.auth.subscribe()
    }

    /// Sends a request through [`CsrfClient::fetch_with_csrf`].
    ///
    /// On 401 exactly one metadata request is issued and its auth flag is
    /// published; the original 401 response is returned unmodified.
    ///
    /// # Errors
    /// Propagates errors from the CSRF layer. Metadata failures are logged
    /// and never replace the original response.
    pub async fn fetch_with_session<F>(
        &self,
        build: F,
        options: FetchOptions,
    ) -> Result<Response, TransportError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let response = self.csrf.fetch_with_csrf(build, options).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!(url = %response.url(), "unauthorized, resynchronizing session state");
            self.resync_auth().await;
        }

        Ok(response)
    }

    async fn resync_auth(&self) {
        match self.fetch_meta().await {
            Ok(authenticated) => {
                let status = AuthStatus::from(authenticated);
                tracing::debug!(?status, "session state resynchronized");
                self.auth.send_replace(status);
            }
            Err(err) => {
                tracing::warn!("session metadata request failed: {err}");
            }
        }
    }

    async fn fetch_meta(&self) -> Result<bool, TransportError> {
        let mut builder = self.csrf.http().get(self.csrf.url(META_PATH));
        if let Some(timeout) = self.meta_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &body));
        }

        let meta: MetaResponse = response.json().await?;
        Ok(meta.auth.authenticated)
    }
}
