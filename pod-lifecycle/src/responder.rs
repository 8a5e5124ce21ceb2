//! Probe responders
//!
//! A responder binds the three lifecycle questions to a wire protocol. Both
//! bindings derive their answers from the same [`Probe::verdict`] rule; they
//! differ only in when the rule is evaluated. HTTP evaluates on every request
//! (pull), gRPC evaluates when the coordinator pushes a state change or the
//! refresh loop fires (push).

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

use crate::checks::FanOut;
use crate::config::{CheckMechanism, ProbeConfig};
use crate::error::{ErrorHandler, Result};
use crate::grpc::GrpcResponder;
use crate::http::HttpResponder;
use crate::state::{LifecycleSnapshot, LifecycleState};

/// Called once the responder is accepting probes; flips `started`
pub type OnStarted = Box<dyn FnOnce() + Send>;

/// How a responder's drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// In-flight work finished before the deadline
    Graceful,
    /// The deadline elapsed and the serving task was aborted
    Forced,
    /// Nothing was serving (attached binding, or never started)
    NothingToStop,
}

/// One of the three lifecycle questions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    /// Has the process started?
    Startup,
    /// Is the process alive?
    Live,
    /// Is the process ready for traffic?
    Ready,
}

impl Probe {
    /// Every probe, in the order they are published
    pub const ALL: [Probe; 3] = [Probe::Startup, Probe::Live, Probe::Ready];

    /// HTTP path
    pub fn path(self) -> &'static str {
        match self {
            Probe::Startup => "/startup",
            Probe::Live => "/live",
            Probe::Ready => "/ready",
        }
    }

    /// gRPC health service name
    pub fn service_name(self) -> &'static str {
        match self {
            Probe::Startup => "startup",
            Probe::Live => "live",
            Probe::Ready => "ready",
        }
    }

    /// Answer for this probe given the lifecycle flags and the fan-out verdict
    ///
    /// `checks_passed` is only consulted for [`Probe::Ready`].
    pub fn verdict(self, state: &LifecycleSnapshot, checks_passed: bool) -> bool {
        match self {
            Probe::Startup => state.started,
            Probe::Live => !state.shutting_down,
            Probe::Ready => state.ready && !state.shutting_down && checks_passed,
        }
    }
}

/// A protocol binding for the lifecycle questions
#[async_trait]
pub trait Responder: Send + Sync {
    /// Begin answering probes, then call `on_started`
    ///
    /// A bind failure is returned and `on_started` is never called.
    async fn start(&self, on_started: OnStarted) -> Result<()>;

    /// Re-publish answers after a lifecycle change
    async fn push_state(&self);

    /// Publish terminal answers and stop serving by `deadline`
    async fn shutdown(&self, deadline: Instant) -> DrainOutcome;

    /// Address of the standalone listener once started
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Protocol this responder speaks
    fn mechanism(&self) -> CheckMechanism;
}

/// Responder selected by [`CheckMechanism`]
pub enum ProbeResponder {
    /// `GET /startup`, `/live`, `/ready`
    Http(HttpResponder),
    /// gRPC health v1
    Grpc(GrpcResponder),
}

impl ProbeResponder {
    /// Build the responder for `config.mechanism`
    ///
    /// Fails with the [`ProbeConfig::validate`] error for an invalid configuration.
    pub fn new(
        config: &ProbeConfig,
        state: Arc<LifecycleState>,
        fan_out: FanOut,
        error_handler: Option<ErrorHandler>,
    ) -> Result<Self> {
        Ok(match config.mechanism {
            CheckMechanism::Http => {
                ProbeResponder::Http(HttpResponder::new(config, state, fan_out, error_handler)?)
            }
            CheckMechanism::Grpc => {
                ProbeResponder::Grpc(GrpcResponder::new(config, state, fan_out, error_handler)?)
            }
        })
    }

    /// The HTTP binding, if selected
    pub fn as_http(&self) -> Option<&HttpResponder> {
        match self {
            ProbeResponder::Http(http) => Some(http),
            ProbeResponder::Grpc(_) => None,
        }
    }

    /// The gRPC binding, if selected
    pub fn as_grpc(&self) -> Option<&GrpcResponder> {
        match self {
            ProbeResponder::Grpc(grpc) => Some(grpc),
            ProbeResponder::Http(_) => None,
        }
    }
}

#[async_trait]
impl Responder for ProbeResponder {
    async fn start(&self, on_started: OnStarted) -> Result<()> {
        match self {
            ProbeResponder::Http(http) => http.start(on_started).await,
            ProbeResponder::Grpc(grpc) => grpc.start(on_started).await,
        }
    }

    async fn push_state(&self) {
        match self {
            ProbeResponder::Http(http) => http.push_state().await,
            ProbeResponder::Grpc(grpc) => grpc.push_state().await,
        }
    }

    async fn shutdown(&self, deadline: Instant) -> DrainOutcome {
        match self {
            ProbeResponder::Http(http) => http.shutdown(deadline).await,
            ProbeResponder::Grpc(grpc) => grpc.shutdown(deadline).await,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ProbeResponder::Http(http) => http.local_addr(),
            ProbeResponder::Grpc(grpc) => grpc.local_addr(),
        }
    }

    fn mechanism(&self) -> CheckMechanism {
        match self {
            ProbeResponder::Http(_) => CheckMechanism::Http,
            ProbeResponder::Grpc(_) => CheckMechanism::Grpc,
        }
    }
}
