//! CSRF token cache, bootstrap, and the CSRF-aware fetch.
//!
//! The token is cached per [`CsrfClient`]. When no token is cached, callers
//! share a single in-flight bootstrap: N concurrent `token()` calls produce at
//! most one request to the bootstrap endpoint and all observe its outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use super::cookie::read_cookie;
use super::error::{ApiError, TransportError};
use super::FetchOptions;
use crate::config::Config;

/// Header carrying the token on state-changing requests.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Error code the backend uses for a rejected CSRF token.
pub const CSRF_REJECTED_CODE: &str = "E2002";

const BOOTSTRAP_PATH: &str = "/v1/auth/csrf/bootstrap";

type BootstrapFuture = Shared<BoxFuture<'static, Result<String, TransportError>>>;

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    csrf_token: String,
}

#[derive(Default)]
struct CsrfCache {
    token: Option<String>,
    /// Last token the backend rejected; the cookie jar may still hold it.
    rejected: Option<String>,
    inflight: Option<BootstrapFuture>,
    /// Bumped by `reset` so a bootstrap started earlier cannot repopulate.
    generation: u64,
}

struct CsrfInner {
    http: reqwest::Client,
    jar: Arc<Jar>,
    base_url: String,
    origin: Url,
    cookie_name: String,
    bootstrap_timeout: Option<Duration>,
    cache: Mutex<CsrfCache>,
}

impl CsrfInner {
    fn cache(&self) -> MutexGuard<'_, CsrfCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cookie_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        read_cookie(header, &self.cookie_name)
    }

    async fn request_token(&self) -> Result<String, TransportError> {
        let url = format!("{}{BOOTSTRAP_PATH}", self.base_url);
        tracing::debug!(%url, "bootstrapping CSRF token");

        let mut builder = self.http.get(&url);
        if let Some(timeout) = self.bootstrap_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "CSRF bootstrap failed");
            return Err(TransportError::from_status(status.as_u16(), &body));
        }

        let parsed: BootstrapResponse = response.json().await?;
        if parsed.csrf_token.is_empty() {
            return Err(TransportError::Decode(
                "bootstrap response has an empty csrf_token".to_string(),
            ));
        }
        Ok(parsed.csrf_token)
    }

    fn store_token(&self, generation: u64, token: &str) {
        let mut cache = self.cache();
        if cache.generation == generation {
            cache.token = Some(token.to_string());
            cache.rejected = None;
        }
    }

    fn finish_shared_bootstrap(&self, generation: u64, result: &Result<String, TransportError>) {
        let mut cache = self.cache();
        if cache.generation != generation {
            return;
        }
        cache.inflight = None;
        if let Ok(token) = result {
            cache.token = Some(token.clone());
            cache.rejected = None;
        }
    }
}

/// HTTP client that attaches and maintains the CSRF token.
///
/// Cloning is cheap and clones share the same cache and cookie jar.
#[derive(Clone)]
pub struct CsrfClient {
    inner: Arc<CsrfInner>,
}

impl CsrfClient {
    /// Creates a client for the configured backend.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let base_url = config.base_url().to_string();
        let origin = Url::parse(&base_url)
            .map_err(|e| TransportError::InvalidRequest(format!("base URL {base_url}: {e}")))?;

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        Ok(Self {
            inner: Arc::new(CsrfInner {
                http,
                jar,
                base_url,
                origin,
                cookie_name: config.csrf_cookie_name.clone(),
                bootstrap_timeout: config.request_timeout(),
                cache: Mutex::new(CsrfCache::default()),
            }),
        })
    }

    /// The underlying HTTP client (shares the cookie jar).
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Joins an absolute path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.base_url)
    }

    /// Reads a cookie the backend set for the base URL, by exact name.
    pub fn read_cookie(&self, name: &str) -> Option<String> {
        let header = self.inner.jar.cookies(&self.inner.origin)?;
        read_cookie(header.to_str().ok()?, name)
    }

    /// Returns the cached token without any I/O.
    pub fn cached_token(&self) -> Option<String> {
        self.inner.cache().token.clone()
    }

    /// Calls the bootstrap endpoint unconditionally and caches the token.
    ///
    /// Failures propagate and leave the cache untouched.
    ///
    /// # Errors
    /// Returns an error if the request fails or the body has no token.
    pub async fn bootstrap(&self) -> Result<String, TransportError> {
        let generation = self.inner.cache().generation;
        let token = self.inner.request_token().await?;
        self.inner.store_token(generation, &token);
        Ok(token)
    }

    /// Returns the CSRF token, bootstrapping if nothing is cached.
    ///
    /// Resolution order: cached token, then the CSRF cookie (unless it is the
    /// token the backend just rejected), then a shared bootstrap.
    ///
    /// # Errors
    /// Returns the bootstrap error; every concurrent waiter receives the same one.
    pub async fn token(&self) -> Result<String, TransportError> {
        let pending = {
            let mut cache = self.inner.cache();
            if let Some(token) = &cache.token {
                return Ok(token.clone());
            }

            if let Some(token) = self.inner.cookie_token()
                && cache.rejected.as_deref() != Some(token.as_str())
            {
                tracing::debug!("adopting CSRF token from cookie");
                cache.token = Some(token.clone());
                return Ok(token);
            }

            if let Some(inflight) = &cache.inflight {
                inflight.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let generation = cache.generation;
                let future = async move {
                    let result = inner.request_token().await;
                    inner.finish_shared_bootstrap(generation, &result);
                    result
                }
                .boxed()
                .shared();
                cache.inflight = Some(future.clone());
                future
            }
        };

        pending.await
    }

    /// Drops the cached token so the next `token()` re-acquires one.
    pub fn invalidate(&self) {
        let mut cache = self.inner.cache();
        if let Some(token) = cache.token.take() {
            cache.rejected = Some(token);
        }
    }

    /// Clears the cache, including any in-flight bootstrap guard.
    pub fn reset(&self) {
        let mut cache = self.inner.cache();
        let generation = cache.generation.wrapping_add(1);
        *cache = CsrfCache {
            generation,
            ..CsrfCache::default()
        };
    }

    fn invalidate_rejected(&self, rejected: Option<&str>) {
        let mut cache = self.inner.cache();
        // Another request may already have refreshed the token.
        if rejected.is_none() || cache.token.as_deref() == rejected {
            cache.token = None;
        }
        if let Some(rejected) = rejected {
            cache.rejected = Some(rejected.to_string());
        }
    }

    /// Sends a request with the CSRF token attached.
    ///
    /// `build` is invoked once per attempt so the request can be replayed. On
    /// a 403 with code E2002 and `retry_on_rejection` set, the token is
    /// invalidated, re-bootstrapped, and the request is retried exactly once.
    ///
    /// Every status other than 403 is returned to the caller as-is.
    ///
    /// # Errors
    /// - [`TransportError::CsrfRejected`] once the rejection budget is spent
    /// - [`TransportError::Forbidden`] for any other 403
    /// - request/bootstrap failures
    pub async fn fetch_with_csrf<F>(
        &self,
        build: F,
        options: FetchOptions,
    ) -> Result<Response, TransportError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let max_attempts: u32 = if options.retry_on_rejection { 2 } else { 1 };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let mut request = build(&self.inner.http).build()?;
            let token = if attempt > 1 || is_state_changing(request.method()) {
                Some(self.token().await?)
            } else {
                self.cached_token()
            };
            if let Some(token) = &token {
                let value = header_value(token)?;
                request.headers_mut().insert(CSRF_HEADER, value);
            }
            if let Some(timeout) = options.timeout
                && request.timeout().is_none()
            {
                *request.timeout_mut() = Some(timeout);
            }

            let response = self.inner.http.execute(request).await?;
            if response.status() != StatusCode::FORBIDDEN {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let api = ApiError::parse(&body);
            match api {
                Some(api) if api.has_code(CSRF_REJECTED_CODE) => {
                    if attempt >= max_attempts {
                        tracing::warn!(attempt, "CSRF token rejected, giving up");
                        return Err(TransportError::CsrfRejected {
                            attempts: attempt,
                            message: api.message,
                        });
                    }
                    tracing::info!(attempt, "CSRF token rejected, re-bootstrapping");
                    self.invalidate_rejected(token.as_deref());
                }
                Some(api) => {
                    return Err(TransportError::Forbidden {
                        code: api.code,
                        message: api.message,
                    });
                }
                None => {
                    return Err(TransportError::Forbidden {
                        code: None,
                        message: body,
                    });
                }
            }
        }
    }
}

fn header_value(token: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(token).map_err(|err| {
        TransportError::InvalidRequest(format!("CSRF token is not a valid header value: {err}"))
    })
}

fn is_state_changing(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}
