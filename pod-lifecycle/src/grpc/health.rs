//! gRPC health responder
//!
//! Follows the standard health checking protocol:
//! https://github.com/grpc/grpc/blob/master/doc/health-checking.md

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::server::Router;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tower::Layer;

use super::logging::GrpcLoggingLayer;
use crate::checks::FanOut;
use crate::config::{Binding, CheckMechanism, ProbeConfig};
use crate::error::{Error, ErrorHandler, Result};
use crate::responder::{DrainOutcome, OnStarted, Probe, Responder};
use crate::server::{self, ManagedTask};
use crate::state::LifecycleState;

/// Pushes lifecycle verdicts into a `tonic-health` status registry
#[derive(Clone)]
struct HealthPublisher {
    state: Arc<LifecycleState>,
    fan_out: FanOut,
    reporter: Arc<Mutex<HealthReporter>>,
}

impl HealthPublisher {
    fn new(state: Arc<LifecycleState>, fan_out: FanOut, reporter: HealthReporter) -> Self {
        Self {
            state,
            fan_out,
            reporter: Arc::new(Mutex::new(reporter)),
        }
    }

    /// Recompute and publish all three statuses
    ///
    /// Checkers run outside the lock; the flags are re-read under it so
    /// concurrent publishes never apply an outdated lifecycle state.
    async fn publish(&self) {
        let before = self.state.snapshot();
        let report = if Probe::Ready.verdict(&before, true) && !self.fan_out.is_empty() {
            Some(self.fan_out.evaluate(None).await)
        } else {
            None
        };
        let checks_passed = match &report {
            Some(report) => report.passed(),
            None => self.fan_out.is_empty(),
        };

        let mut reporter = self.reporter.lock().await;
        let snapshot = self.state.snapshot();
        for probe in Probe::ALL {
            let status = if probe.verdict(&snapshot, checks_passed) {
                ServingStatus::Serving
            } else {
                ServingStatus::NotServing
            };
            HealthReporter::set_service_status(&mut reporter, probe.service_name(), status).await;
        }

        tracing::debug!(
            started = snapshot.started,
            ready = snapshot.ready,
            shutting_down = snapshot.shutting_down,
            checks_passed,
            "Published gRPC health statuses"
        );
    }
}

/// Answers probes over the gRPC health protocol
pub struct GrpcResponder {
    state: Arc<LifecycleState>,
    fan_out: FanOut,
    addr: SocketAddr,
    binding: Binding,
    refresh_interval: Option<Duration>,
    error_handler: Option<ErrorHandler>,
    publisher: StdMutex<Option<HealthPublisher>>,
    server: Mutex<Option<ManagedTask>>,
    refresher: Mutex<Option<ManagedTask>>,
    local_addr: OnceLock<SocketAddr>,
}

impl GrpcResponder {
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
            state,
            fan_out,
            addr: config.grpc_addr()?,
            binding: config.binding,
            refresh_interval: config.refresh_interval(),
            error_handler,
            publisher: StdMutex::new(None),
            server: Mutex::new(None),
            refresher: Mutex::new(None),
            local_addr: OnceLock::new(),
        })
    }

    /// Register the health service on a caller-owned tonic router
    ///
    /// Required before `start` in attached mode. The caller keeps ownership of
    /// the server; shutdown only flips the published statuses.
    pub fn attach<L>(&self, router: Router<L>) -> Router<L> {
        let (reporter, service) = tonic_health::server::health_reporter();
        self.set_publisher(HealthPublisher::new(
            self.state.clone(),
            self.fan_out.clone(),
            reporter,
        ));
        tracing::debug!("gRPC health service attached to caller router");
        router.add_service(service)
    }

    fn publisher(&self) -> Option<HealthPublisher> {
        self.publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_publisher(&self, publisher: HealthPublisher) {
        *self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(publisher);
    }

    async fn serve(&self) -> Result<HealthPublisher> {
        let mut slot = self.server.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = server::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        let (reporter, service) = tonic_health::server::health_reporter();
        let publisher = HealthPublisher::new(self.state.clone(), self.fan_out.clone(), reporter);
        publisher.publish().await;
        self.set_publisher(publisher.clone());

        let app = GrpcLoggingLayer.layer(Routes::new(service));
        let token = CancellationToken::new();
        let stop = token.clone();
        *slot = Some(ManagedTask::spawn(
            token,
            server::serve_connections(listener, app, stop, self.error_handler.clone()),
        ));

        tracing::info!(port = local_addr.port(), "gRPC health server listening on {}", local_addr);
        Ok(publisher)
    }

    /// Re-evaluate readiness periodically so checker outages surface without a push
    async fn spawn_refresher(&self, publisher: HealthPublisher) {
        let Some(period) = self.refresh_interval else {
            return;
        };

        let token = CancellationToken::new();
        let stop = token.clone();
        let task = ManagedTask::spawn(token, async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = publisher.publish() => {}
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.refresher.lock().await.replace(task) {
            previous.drain(Instant::now()).await;
        }
    }
}

#[async_trait]
impl Responder for GrpcResponder {
    async fn start(&self, on_started: OnStarted) -> Result<()> {
        let publisher = match self.binding {
            Binding::Standalone => self.serve().await?,
            Binding::Attached => self.publisher().ok_or(Error::NotAttached("gRPC"))?,
        };

        on_started();
        publisher.publish().await;
        self.spawn_refresher(publisher).await;
        Ok(())
    }

    async fn push_state(&self) {
        if let Some(publisher) = self.publisher() {
            publisher.publish().await;
        }
    }

    async fn shutdown(&self, deadline: Instant) -> DrainOutcome {
        if let Some(refresher) = self.refresher.lock().await.take() {
            refresher.drain(deadline).await;
        }
        self.push_state().await;

        let Some(task) = self.server.lock().await.take() else {
            return DrainOutcome::NothingToStop;
        };

        let outcome = task.drain(deadline).await;
        tracing::info!(outcome = ?outcome, "gRPC health server stopped");
        outcome
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn mechanism(&self) -> CheckMechanism {
        CheckMechanism::Grpc
    }
}
