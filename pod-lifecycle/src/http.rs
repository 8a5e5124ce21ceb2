//! HTTP probe responder
//!
//! Serves `GET /startup`, `GET /live` and `GET /ready`, answering 200 or 503.
//! State is read on every request, so pushes are no-ops. Any other method on
//! those paths is answered with 405.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer};

use crate::checks::FanOut;
use crate::config::{Binding, CheckMechanism, ProbeConfig};
use crate::error::{Error, ErrorHandler, Result};
use crate::responder::{DrainOutcome, OnStarted, Probe, Responder};
use crate::server::{self, ManagedTask};
use crate::state::LifecycleState;

/// Slack between the readiness deadline and the request timeout layer, so a
/// slow evaluation still answers with its report instead of a bare 503
const RESPONSE_GRACE: Duration = Duration::from_millis(250);

/// Router state shared by the probe handlers
#[derive(Clone)]
struct HttpProbe {
    state: Arc<LifecycleState>,
    fan_out: FanOut,
    request_timeout: Duration,
}

/// Answers probes over HTTP
pub struct HttpResponder {
    probe: HttpProbe,
    addr: SocketAddr,
    binding: Binding,
    error_handler: Option<ErrorHandler>,
    server: Mutex<Option<ManagedTask>>,
    local_addr: OnceLock<SocketAddr>,
}

impl HttpResponder {
    /// Create a responder; nothing is bound until [`Responder::start`]
    ///
    /// Fails if `config` does not pass [`ProbeConfig::validate`].
    pub fn new(
        config: &ProbeConfig,
        state: Arc<LifecycleState>,
        fan_out: FanOut,
        error_handler: Option<ErrorHandler>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            probe: HttpProbe {
                state,
                fan_out,
                request_timeout: config.request_timeout(),
            },
            addr: config.http_addr()?,
            binding: config.binding,
            error_handler,
            server: Mutex::new(None),
            local_addr: OnceLock::new(),
        })
    }

    /// Router with the three probe routes
    ///
    /// In attached mode, merge this into the application's router.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for probe in Probe::ALL {
            router = match probe {
                Probe::Startup => router.route(probe.path(), any(startup)),
                Probe::Live => router.route(probe.path(), any(live)),
                Probe::Ready => router.route(probe.path(), any(ready)),
            };
        }

        router
            .route_layer(middleware::from_fn(only_get))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::SERVICE_UNAVAILABLE,
                self.probe.request_timeout + RESPONSE_GRACE,
            ))
            .layer(CatchPanicLayer::new())
            .with_state(self.probe.clone())
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn start(&self, on_started: OnStarted) -> Result<()> {
        if self.binding == Binding::Attached {
            on_started();
            tracing::info!("HTTP probes attached to caller router");
            return Ok(());
        }

        let mut slot = self.server.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = server::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        let token = CancellationToken::new();
        let stop = token.clone();
        *slot = Some(ManagedTask::spawn(
            token,
            server::serve_connections(listener, self.router(), stop, self.error_handler.clone()),
        ));

        on_started();
        tracing::info!(port = local_addr.port(), "HTTP probe server listening on {}", local_addr);
        Ok(())
    }

    async fn push_state(&self) {}

    async fn shutdown(&self, deadline: Instant) -> DrainOutcome {
        let Some(task) = self.server.lock().await.take() else {
            return DrainOutcome::NothingToStop;
        };

        let outcome = task.drain(deadline).await;
        tracing::info!(outcome = ?outcome, "HTTP probe server stopped");
        outcome
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn mechanism(&self) -> CheckMechanism {
        CheckMechanism::Http
    }
}

async fn only_get(request: Request, next: Next) -> Response {
    if request.method() == Method::GET {
        next.run(request).await
    } else {
        (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET")]).into_response()
    }
}

fn status_for(verdict: bool) -> StatusCode {
    if verdict {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn startup(State(probe): State<HttpProbe>) -> StatusCode {
    status_for(Probe::Startup.verdict(&probe.state.snapshot(), true))
}

async fn live(State(probe): State<HttpProbe>) -> StatusCode {
    status_for(Probe::Live.verdict(&probe.state.snapshot(), true))
}

/// Readiness: checkers only run when the lifecycle flags allow traffic
async fn ready(State(probe): State<HttpProbe>) -> Response {
    if !Probe::Ready.verdict(&probe.state.snapshot(), true) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if probe.fan_out.is_empty() {
        return StatusCode::OK.into_response();
    }

    let report = probe
        .fan_out
        .evaluate(Some(Instant::now() + probe.request_timeout))
        .await;

    // Shutdown may have begun while the checkers ran.
    let verdict = Probe::Ready.verdict(&probe.state.snapshot(), report.passed());
    (status_for(verdict), Json(report)).into_response()
}
