//! OAuth2 access-token lifecycle.
//!
//! One refresh driver, four acquisition strategies ([`TokenSource`]).
//! Refresh is single-flight: concurrent callers share the outstanding
//! request, and callbacks registered while a refresh is in flight run — in
//! registration order, on their requested worker — once it completes,
//! whatever the outcome.
//!
//! Failure degrades rather than blocks: after a refresh failure the error
//! gate holds for a while and requests go out unauthenticated, so compiles
//! keep working through local fallback or whatever the server allows.

pub mod jwt;
mod source;

pub use source::{ParsedToken, TokenRequest, TokenSource};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use lx_http::TokenProvider;
use lx_runtime::{DelayedHandle, Priority, WorkerId, WorkerPool};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential configuration: {0}")]
    Config(String),

    #[error("token endpoint returned malformed data: {0}")]
    Parse(String),

    #[error("token request rejected: {0}")]
    Rejected(String),

    #[error("JWT signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Http(#[from] lx_http::HttpError),

    #[error("token refresh did not finish before its deadline: {0}")]
    Deadline(String),
}

impl AuthError {
    fn is_transient(&self) -> bool {
        match self {
            AuthError::Http(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Tokens are considered expired this long before the server says so
    pub expiry_margin: Duration,
    /// After a failed refresh, callers fall through without auth for this long
    pub error_pending: Duration,
    /// Overall budget for one refresh (spans its internal retries)
    pub refresh_deadline: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt HTTP timeout
    pub request_timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            expiry_margin: Duration::from_secs(60),
            error_pending: Duration::from_secs(60),
            refresh_deadline: Duration::from_secs(10),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    token_type: String,
    expiry: Instant,
}

type Callback = (WorkerId, Box<dyn FnOnce() + Send + 'static>);

#[derive(Default)]
struct State {
    token: Option<AccessToken>,
    last_error: Option<Instant>,
    refreshing: bool,
    waiters: Vec<tokio::sync::oneshot::Sender<()>>,
    callbacks: Vec<Callback>,
    /// Cancel handle for the retry-backoff timer of an in-flight refresh
    backoff: Option<DelayedHandle>,
    shutdown: bool,
}

/// The credential refresher.
pub struct TokenRefresher {
    source: TokenSource,
    options: RefreshOptions,
    pool: Arc<WorkerPool>,
    state: Mutex<State>,
    /// Wakes an in-flight refresh so shutdown can abort it mid-attempt
    shutdown_notify: tokio::sync::Notify,
}

impl TokenProvider for TokenRefresher {
    fn authorization(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        let token = state.token.as_ref()?;
        if Instant::now() >= token.expiry {
            return None;
        }
        Some(format!("{} {}", token.token_type, token.value))
    }
}

impl TokenRefresher {
    pub fn new(source: TokenSource, options: RefreshOptions, pool: Arc<WorkerPool>) -> Arc<Self> {
        info!(source = source.describe(), "credential refresher configured");
        Arc::new(Self {
            source,
            options,
            pool,
            state: Mutex::new(State::default()),
            shutdown_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn source(&self) -> &TokenSource {
        &self.source
    }

    fn should_refresh(&self, state: &State, now: Instant) -> bool {
        if state.shutdown {
            return false;
        }
        if let Some(token) = &state.token {
            if now < token.expiry {
                return false;
            }
        }
        if let Some(last_error) = state.last_error {
            if now < last_error + self.options.error_pending {
                // error gate: degrade to unauthenticated for a while
                return false;
            }
        }
        true
    }

    /// Make sure a refresh has been attempted recently. Single-flight:
    /// concurrent callers share one outstanding request. Always returns —
    /// a failed refresh leaves the session unauthenticated rather than
    /// failing the compile.
    pub async fn ensure_fresh(self: &Arc<Self>) {
        enum Role {
            Fresh,
            Waiter(tokio::sync::oneshot::Receiver<()>),
            Driver,
        }

        let role = {
            let mut state = self.state.lock().unwrap();
            if !self.should_refresh(&state, Instant::now()) {
                Role::Fresh
            } else if state.refreshing {
                let (tx, rx) = tokio::sync::oneshot::channel();
                state.waiters.push(tx);
                Role::Waiter(rx)
            } else {
                state.refreshing = true;
                Role::Driver
            }
        };

        match role {
            Role::Fresh => {}
            Role::Waiter(rx) => {
                let _ = rx.await;
            }
            Role::Driver => self.clone().drive_refresh().await,
        }
    }

    /// Enqueue `callback` to run on `worker` after the current (or a newly
    /// started) refresh completes, regardless of outcome. If no refresh is
    /// needed, the callback is dispatched immediately.
    pub fn run_after_refresh(
        self: &Arc<Self>,
        worker: WorkerId,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let start_driver = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            if state.refreshing {
                state.callbacks.push((worker, Box::new(callback)));
                false
            } else if self.should_refresh(&state, now) {
                state.callbacks.push((worker, Box::new(callback)));
                state.refreshing = true;
                true
            } else {
                drop(state);
                self.pool.run_on(worker, Priority::Immediate, callback);
                return;
            }
        };

        if start_driver {
            let this = self.clone();
            self.pool.run_on(worker, Priority::Immediate, move || {
                tokio::task::spawn_local(async move {
                    this.drive_refresh().await;
                });
            });
        }
    }

    /// Cancel any outstanding refresh (including a mid-backoff retry), drop
    /// pending work, and refuse future refreshes.
    pub fn shutdown(&self) {
        let (waiters, callbacks, backoff) = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.callbacks),
                state.backoff.take(),
            )
        };
        if let Some(backoff) = backoff {
            backoff.cancel();
        }
        // wake a refresh parked in its attempt or its backoff wait
        self.shutdown_notify.notify_waiters();
        for waiter in waiters {
            let _ = waiter.send(());
        }
        for (worker, callback) in callbacks {
            self.pool.run_on(worker, Priority::Immediate, callback);
        }
    }

    async fn drive_refresh(self: Arc<Self>) {
        let deadline = Instant::now() + self.options.refresh_deadline;
        let mut backoff = self.options.min_backoff;

        let result = loop {
            if self.state.lock().unwrap().shutdown {
                break Err(AuthError::Deadline("canceled by shutdown".to_string()));
            }

            let attempt = tokio::select! {
                result = self.attempt_once() => Some(result),
                _ = self.shutdown_notify.notified() => None,
            };
            let Some(attempt) = attempt else {
                break Err(AuthError::Deadline("canceled by shutdown".to_string()));
            };

            match attempt {
                Ok(token) => break Ok(token),
                Err(error) => {
                    if !error.is_transient() || Instant::now() + backoff >= deadline {
                        break Err(error);
                    }
                    debug!(error = %error, backoff_ms = backoff.as_millis() as u64, "token refresh retry");
                    if !self.backoff_wait(backoff).await {
                        break Err(AuthError::Deadline("canceled by shutdown".to_string()));
                    }
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
            }
        };

        let (waiters, callbacks) = {
            let mut state = self.state.lock().unwrap();
            state.refreshing = false;
            match result {
                // a shutdown may have raced the refresh; its outcome no
                // longer matters and must not overwrite drained state
                _ if state.shutdown => {}
                Ok(parsed) => {
                    let lifetime = Duration::from_secs(parsed.expires_in_secs)
                        .saturating_sub(self.options.expiry_margin);
                    state.token = Some(AccessToken {
                        value: parsed.access_token,
                        token_type: parsed.token_type,
                        expiry: Instant::now() + lifetime,
                    });
                    state.last_error = None;
                    debug!("access token refreshed");
                }
                Err(error) => {
                    // callers fall through unauthenticated until the gate opens
                    state.last_error = Some(Instant::now());
                    warn!(error = %error, "token refresh failed");
                }
            }
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.callbacks),
            )
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }
        // registration order: the vec preserves it
        for (worker, callback) in callbacks {
            self.pool.run_on(worker, Priority::Immediate, callback);
        }
    }

    /// Park between retry attempts on a cancellable delayed closure, so
    /// `shutdown` can stop a mid-backoff refresh. Returns false when the
    /// wait was canceled.
    async fn backoff_wait(&self, backoff: Duration) -> bool {
        // register for the shutdown wakeup before checking the flag, so a
        // shutdown can never slip between the check and the wait
        let notified = self.shutdown_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = self
            .pool
            .run_delayed(backoff, Priority::Immediate, move || {
                let _ = tx.send(());
            });

        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                drop(state);
                handle.cancel();
                return false;
            }
            state.backoff = Some(handle);
        }

        let fired = tokio::select! {
            fired = rx => fired.is_ok(),
            _ = &mut notified => false,
        };

        self.state.lock().unwrap().backoff = None;
        fired
    }

    async fn attempt_once(&self) -> Result<ParsedToken, AuthError> {
        let request = self.source.request()?;

        let mut builder = hyper::Request::builder()
            .method(request.method.clone())
            .uri(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(hyper::header::CONTENT_TYPE, content_type);
        }
        let req = builder
            .body(Full::new(Bytes::from(request.body)))
            .map_err(|e| AuthError::Config(format!("bad token request: {e}")))?;

        let (status, body) = lx_http::fetch(req, self.options.request_timeout).await?;
        if status != 200 {
            return Err(AuthError::Http(lx_http::HttpError::Status(status)));
        }

        self.source.parse_response(&body)
    }
}
