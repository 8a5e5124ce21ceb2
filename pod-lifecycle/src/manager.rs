//! Lifecycle coordinator
//!
//! [`PodManager`] owns the lifecycle flags and the probe responder, and drives
//! the phase machine:
//!
//! ```text
//! NotStarted --start--> Running --shutdown--> Draining --drained--> Terminated
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use pod_lifecycle::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = PodManager::builder()
//!         .with_config(ProbeConfig::load()?)
//!         .with_checker("db", TcpChecker::new("db:5432"))
//!         .build()?;
//!
//!     manager.start().await?;
//!     // ... finish application startup ...
//!     manager.set_ready().await;
//!
//!     // Blocks until SIGTERM/SIGINT, then drains
//!     manager.run().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checks::{Checker, CheckerRegistry, FanOut};
use crate::config::{Binding, CheckMechanism, ProbeConfig};
use crate::error::{Error, ErrorHandler, Result};
use crate::responder::{DrainOutcome, ProbeResponder, Responder};
use crate::server::shutdown_signal;
use crate::state::LifecycleState;

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Built, not yet serving probes
    NotStarted = 0,
    /// Serving probes
    Running = 1,
    /// Shutdown triggered, waiting for the responder to stop
    Draining = 2,
    /// Responder stopped
    Terminated = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::NotStarted,
            1 => Phase::Running,
            2 => Phase::Draining,
            _ => Phase::Terminated,
        }
    }
}

/// Wires lifecycle state to a probe responder and runs the shutdown sequence
pub struct PodManager {
    config: ProbeConfig,
    state: Arc<LifecycleState>,
    responder: ProbeResponder,
    phase: AtomicU8,
    // Held by `start` while the responder binds, and by the drain before it stops it
    starting: Mutex<()>,
    draining: CancellationToken,
    terminated: CancellationToken,
}

impl PodManager {
    /// Start building a manager
    pub fn builder() -> PodManagerBuilder {
        PodManagerBuilder::new()
    }

    /// Manager with the given configuration and no checkers
    pub fn new(config: ProbeConfig) -> Result<Self> {
        Self::builder().with_config(config).build()
    }

    /// Bind the responder (or attach it) and mark the process started
    ///
    /// Fails with [`Error::AlreadyStarted`] on a second call or after shutdown.
    /// A bind failure returns the manager to [`Phase::NotStarted`].
    pub async fn start(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        if !self.transition(Phase::NotStarted, Phase::Running) {
            return Err(Error::AlreadyStarted);
        }

        let state = self.state.clone();
        match self
            .responder
            .start(Box::new(move || state.mark_started()))
            .await
        {
            Ok(()) => {
                tracing::info!(
                    mechanism = %self.config.mechanism,
                    binding = ?self.config.binding,
                    phase = ?Phase::Running,
                    "Pod lifecycle manager started"
                );
                Ok(())
            }
            Err(err) => {
                self.transition(Phase::Running, Phase::NotStarted);
                tracing::error!(error = %err, "Failed to start probe responder");
                Err(err)
            }
        }
    }

    /// Report the application ready for traffic
    ///
    /// Has no observable effect once shutdown has begun.
    pub async fn set_ready(&self) {
        self.update_ready(true).await;
    }

    /// Withdraw readiness, e.g. while a dependency is being reconnected
    pub async fn set_not_ready(&self) {
        self.update_ready(false).await;
    }

    async fn update_ready(&self, ready: bool) {
        self.state.set_ready(ready);
        if self.state.is_shutting_down() {
            return;
        }
        tracing::info!(ready, "Readiness updated");
        self.responder.push_state().await;
    }

    /// Run the drain sequence and wait until the responder has stopped
    ///
    /// Concurrent and repeated calls are safe: only the first drains, the
    /// others wait for it and report [`DrainOutcome::NothingToStop`].
    pub async fn shutdown(&self) -> DrainOutcome {
        self.state.begin_shutdown();
        loop {
            match self.phase() {
                Phase::Running => {
                    if self.transition(Phase::Running, Phase::Draining) {
                        return self.drain().await;
                    }
                }
                Phase::NotStarted => {
                    if self.transition(Phase::NotStarted, Phase::Terminated) {
                        self.draining.cancel();
                        self.terminated.cancel();
                        tracing::info!("Shutdown before start, nothing to drain");
                        return DrainOutcome::NothingToStop;
                    }
                }
                Phase::Draining | Phase::Terminated => {
                    self.terminated.cancelled().await;
                    return DrainOutcome::NothingToStop;
                }
            }
        }
    }

    async fn drain(&self) -> DrainOutcome {
        self.draining.cancel();
        let timeout = self.config.shutdown_timeout();
        tracing::info!(
            phase = ?Phase::Draining,
            timeout_ms = timeout.as_millis(),
            "Shutdown started"
        );

        // A concurrent `start` finishes binding before the responder is stopped
        let _starting = self.starting.lock().await;
        self.responder.push_state().await;
        let outcome = self.responder.shutdown(Instant::now() + timeout).await;
        match outcome {
            DrainOutcome::Forced => tracing::warn!(
                outcome = ?outcome,
                timeout_ms = timeout.as_millis(),
                "Drain deadline elapsed, probe server terminated"
            ),
            _ => tracing::info!(outcome = ?outcome, "Probe responder drained"),
        }

        self.phase.store(Phase::Terminated as u8, Ordering::SeqCst);
        self.terminated.cancel();
        tracing::info!(phase = ?Phase::Terminated, "Shutdown complete");
        outcome
    }

    /// Start, wait for SIGTERM/SIGINT (or another `shutdown` call), then drain
    pub async fn run(&self) -> Result<DrainOutcome> {
        self.run_until(shutdown_signal()).await
    }

    /// Start, wait for `signal` (or another `shutdown` call), then drain
    ///
    /// A manager that is already running is not started again.
    pub async fn run_until<F>(&self, signal: F) -> Result<DrainOutcome>
    where
        F: Future<Output = ()>,
    {
        if self.phase() == Phase::NotStarted {
            self.start().await?;
        }

        tokio::select! {
            _ = signal => {
                tracing::info!("Shutdown requested");
            }
            _ = self.draining.cancelled() => {}
        }

        Ok(self.shutdown().await)
    }

    /// Resolves once the drain sequence has finished
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Register the HTTP probe routes on a caller-owned router
    ///
    /// Returns `router` unchanged (with a warning) when the manager speaks gRPC.
    pub fn attach_http(&self, router: axum::Router) -> axum::Router {
        match self.http_router() {
            Some(probes) => router.merge(probes),
            None => {
                tracing::warn!(mechanism = %self.config.mechanism, "attach_http ignored");
                router
            }
        }
    }

    /// The HTTP probe routes, `None` when the manager speaks gRPC
    pub fn http_router(&self) -> Option<axum::Router> {
        self.responder.as_http().map(|http| http.router())
    }

    /// Register the gRPC health service on a caller-owned tonic router
    ///
    /// Only meaningful for the attached gRPC binding; otherwise `router` is
    /// returned unchanged with a warning.
    pub fn attach_grpc<L>(
        &self,
        router: tonic::transport::server::Router<L>,
    ) -> tonic::transport::server::Router<L> {
        match self.responder.as_grpc() {
            Some(grpc) if self.config.binding == Binding::Attached => grpc.attach(router),
            _ => {
                tracing::warn!(
                    mechanism = %self.config.mechanism,
                    binding = ?self.config.binding,
                    "attach_grpc ignored"
                );
                router
            }
        }
    }

    /// Whether the application reported ready
    pub fn ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Whether the responder has started
    pub fn started(&self) -> bool {
        self.state.is_started()
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Shared lifecycle flags
    pub fn state(&self) -> &Arc<LifecycleState> {
        &self.state
    }

    /// Validated configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Address of the standalone listener once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.responder.local_addr()
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Builder for [`PodManager`]
///
/// Call [`with_config`](Self::with_config) first if you have one; the other
/// setters override individual fields of it.
#[derive(Default)]
pub struct PodManagerBuilder {
    config: ProbeConfig,
    registry: CheckerRegistry,
    error_handler: Option<ErrorHandler>,
}

impl PodManagerBuilder {
    /// Builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    /// Probe protocol
    pub fn with_mechanism(mut self, mechanism: CheckMechanism) -> Self {
        self.config.mechanism = mechanism;
        self
    }

    /// Standalone or attached
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.config.binding = binding;
        self
    }

    /// Address the standalone listener binds to
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    /// HTTP port, validated by `build`
    pub fn with_http_port(mut self, port: u32) -> Self {
        self.config.http_port = port;
        self
    }

    /// gRPC port, validated by `build`
    pub fn with_grpc_port(mut self, port: u32) -> Self {
        self.config.grpc_port = port;
        self
    }

    /// Drain deadline
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = millis(timeout);
        self
    }

    /// Per-checker deadline
    pub fn with_checker_timeout(mut self, timeout: Duration) -> Self {
        self.config.checker_timeout_ms = millis(timeout);
        self
    }

    /// HTTP probe request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = millis(timeout);
        self
    }

    /// gRPC readiness refresh period; zero disables refreshing
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval_ms = millis(interval);
        self
    }

    /// Register a dependency checker; a repeated name replaces the earlier one
    pub fn with_checker(mut self, name: impl Into<String>, checker: impl Checker) -> Self {
        self.registry.register(name, checker);
        self
    }

    /// Callback for serve-loop errors raised after startup
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and build the manager
    ///
    /// No listener is opened until [`PodManager::start`].
    pub fn build(self) -> Result<PodManager> {
        self.config.validate()?;

        let fan_out = FanOut::new(Arc::new(self.registry), self.config.checker_timeout());
        let state = Arc::new(LifecycleState::new());
        let responder =
            ProbeResponder::new(&self.config, state.clone(), fan_out, self.error_handler)?;

        tracing::debug!(
            mechanism = %self.config.mechanism,
            port = self.config.port()?,
            "Pod lifecycle manager built"
        );

        Ok(PodManager {
            config: self.config,
            state,
            responder,
            phase: AtomicU8::new(Phase::NotStarted as u8),
            starting: Mutex::new(()),
            draining: CancellationToken::new(),
            terminated: CancellationToken::new(),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Run a default HTTP manager until SIGTERM/SIGINT
pub async fn run() -> Result<DrainOutcome> {
    PodManager::new(ProbeConfig::default())?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{checker_fn, CheckError};

    fn free_port() -> u32 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        u32::from(listener.local_addr().unwrap().port())
    }

    fn local_builder() -> PodManagerBuilder {
        PodManager::builder()
            .with_bind_address([127, 0, 0, 1].into())
            .with_http_port(free_port())
            .with_grpc_port(free_port())
    }

    #[test]
    fn test_build_rejects_invalid_ports() {
        for port in [0, 70000] {
            let result = PodManager::builder().with_http_port(port).build();
            assert!(matches!(result, Err(Error::InvalidPort { .. })));
        }
        let result = PodManager::builder()
            .with_checker_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::InvalidTimeout(_))));
    }

    #[test]
    fn test_builder_overrides_fields() {
        let manager = PodManager::builder()
            .with_mechanism(CheckMechanism::Grpc)
            .with_grpc_port(6000)
            .with_shutdown_timeout(Duration::from_millis(1500))
            .with_checker("db", checker_fn(|| async { Ok(()) }))
            .build()
            .unwrap();

        assert_eq!(manager.config().mechanism, CheckMechanism::Grpc);
        assert_eq!(manager.config().grpc_port, 6000);
        assert_eq!(manager.config().shutdown_timeout_ms, 1500);
        assert_eq!(manager.phase(), Phase::NotStarted);
        assert!(manager.http_router().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let manager = local_builder().build().unwrap();
        manager.start().await.unwrap();
        assert!(manager.started());
        assert_eq!(manager.phase(), Phase::Running);
        assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_not_started() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = u32::from(held.local_addr().unwrap().port());
        let manager = PodManager::builder()
            .with_bind_address([127, 0, 0, 1].into())
            .with_http_port(port)
            .build()
            .unwrap();

        assert!(matches!(manager.start().await, Err(Error::Bind { .. })));
        assert_eq!(manager.phase(), Phase::NotStarted);
        assert!(!manager.started());
    }

    #[tokio::test]
    async fn test_shutdown_sequence() {
        let manager = local_builder().build().unwrap();
        manager.start().await.unwrap();
        manager.set_ready().await;
        assert!(manager.ready());

        let outcome = manager.shutdown().await;
        assert_eq!(outcome, DrainOutcome::Graceful);
        assert_eq!(manager.phase(), Phase::Terminated);
        assert!(manager.is_shutting_down());
        assert!(manager.started());

        // Repeated shutdown is a no-op
        assert_eq!(manager.shutdown().await, DrainOutcome::NothingToStop);
        assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let manager = local_builder().build().unwrap();
        assert_eq!(manager.shutdown().await, DrainOutcome::NothingToStop);
        assert_eq!(manager.phase(), Phase::Terminated);
        assert!(!manager.started());
        tokio::time::timeout(Duration::from_secs(1), manager.terminated())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_returns_after_drain() {
        let manager = Arc::new(local_builder().build().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let runner = manager.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });

        while !manager.started() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, DrainOutcome::Graceful);
        assert_eq!(manager.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_external_shutdown_releases_run_until() {
        let manager = Arc::new(local_builder().build().unwrap());
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run_until(std::future::pending()).await });

        while !manager.started() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_set_ready_after_shutdown_is_not_observable() {
        let manager = local_builder()
            .with_checker("db", checker_fn(|| async { Err(CheckError::new("down")) }))
            .build()
            .unwrap();
        manager.start().await.unwrap();
        manager.shutdown().await;
        manager.set_ready().await;

        let router = manager.http_router().unwrap();
        let response = tower::ServiceExt::oneshot(
            router,
            http::Request::builder()
                .uri("/ready")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_attach_grpc_requires_matching_binding() {
        let manager = local_builder().build().unwrap();
        let router =
            tonic::transport::Server::builder().add_routes(tonic::service::Routes::default());
        // HTTP manager leaves the router untouched
        let _router = manager.attach_grpc(router);

        let grpc = local_builder()
            .with_mechanism(CheckMechanism::Grpc)
            .with_binding(Binding::Attached)
            .build()
            .unwrap();
        assert!(matches!(grpc.start().await, Err(Error::NotAttached(_))));
        assert_eq!(grpc.phase(), Phase::NotStarted);
    }

    #[tokio::test]
    async fn test_shutdown_during_start_stops_the_server() {
        let manager = local_builder()
            .with_mechanism(CheckMechanism::Grpc)
            .with_checker(
                "slow",
                checker_fn(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                }),
            )
            .build()
            .unwrap();
        // Readiness before start makes the first publish run the slow checker
        manager.set_ready().await;

        let (started, outcome) = tokio::join!(manager.start(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.shutdown().await
        });

        started.unwrap();
        assert_eq!(outcome, DrainOutcome::Graceful);
        assert_eq!(manager.phase(), Phase::Terminated);
        let addr = manager.local_addr().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
