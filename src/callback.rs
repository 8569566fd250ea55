//! Loopback receiver for the OAuth redirect. The provider sends the browser to
//! the configured redirect URL (path [`OAUTH_CALLBACK_PATH`]) with either a
//! `code` or an `error`; the first such request is handed back to the caller.

use crate::{
    error::{AuthError, Result},
    navigation::OAUTH_CALLBACK_PATH,
};
use axum::{
    body::Body,
    extract::Query,
    http::{Request, StatusCode},
    routing::get,
    Extension, Router,
};
use serde::Deserialize;
use std::{net::SocketAddr, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info, warn, Span};
use url::Url;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code(String),
    Denied {
        error: String,
        description: Option<String>,
    },
}

impl CallbackParams {
    fn outcome(self) -> Option<CallbackOutcome> {
        if let Some(error) = self.error {
            return Some(CallbackOutcome::Denied {
                error,
                description: self.error_description,
            });
        }
        self.code.map(CallbackOutcome::Code)
    }
}

type Outcomes = mpsc::UnboundedSender<CallbackOutcome>;

async fn callback(
    Extension(outcomes): Extension<Outcomes>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, &'static str) {
    match params.outcome() {
        Some(outcome) => {
            let denied = matches!(outcome, CallbackOutcome::Denied { .. });
            if outcomes.send(outcome).is_err() {
                warn!("OAuth callback arrived after the receiver went away");
            }
            if denied {
                (StatusCode::OK, "Sign-in was not completed. You can close this window.")
            } else {
                (StatusCode::OK, "Signed in. You can close this window.")
            }
        }
        None => (StatusCode::BAD_REQUEST, "Missing code"),
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    debug_span!("oauth-callback", path)
}

pub fn router(path: &str, outcomes: Outcomes) -> Router {
    Router::new()
        .route(path, get(callback))
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
        .layer(Extension(outcomes))
}

pub struct CallbackServer {
    addr: SocketAddr,
    outcomes: mpsc::UnboundedReceiver<CallbackOutcome>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl CallbackServer {
    /// Binds to the host and port of `redirect_url` and serves its path.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the address cannot be bound.
    pub async fn bind(redirect_url: &str) -> Result<Self> {
        let url = Url::parse(redirect_url)
            .map_err(|err| AuthError::Config(format!("{redirect_url}: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::Config(format!("{redirect_url}: missing host")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        if url.path() != OAUTH_CALLBACK_PATH {
            warn!(path = url.path(), "redirect URL does not use {OAUTH_CALLBACK_PATH}");
        }

        let listener = TcpListener::bind((host.trim_matches(['[', ']']), port))
            .await
            .map_err(|err| AuthError::Transport(format!("bind {host}:{port}: {err}")))?;
        let addr = listener
            .local_addr()
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let (tx, outcomes) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let app = router(url.path(), tx);

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    debug!("OAuth callback server shutting down");
                })
                .await;
            if let Err(e) = served {
                warn!("OAuth callback server failed: {}", e);
            }
        });

        info!("Waiting for OAuth callback on {}", addr);

        Ok(Self {
            addr,
            outcomes,
            shutdown,
            handle,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the first callback, then stops the server.
    ///
    /// # Errors
    /// Returns [`AuthError::Transport`] when nothing arrives within `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<CallbackOutcome> {
        let outcome = tokio::time::timeout(timeout, self.outcomes.recv()).await;

        let _ = self.shutdown.send(());
        let _ = self.handle.await;

        match outcome {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(AuthError::Transport(
                "OAuth callback server stopped".to_string(),
            )),
            Err(_) => Err(AuthError::Transport(format!(
                "no OAuth callback within {}s",
                timeout.as_secs()
            ))),
        }
    }
}
