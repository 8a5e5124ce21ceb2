//! # pod-lifecycle
//!
//! Startup, liveness and readiness probes for long-running services, coordinated
//! with a bounded graceful shutdown.
//!
//! ## Features
//!
//! - **Two protocols**: plain HTTP (`GET /startup`, `/live`, `/ready`) or the gRPC
//!   health protocol (services `startup`, `live`, `ready`)
//! - **Standalone or attached**: own a listener, or register on an existing
//!   axum router or tonic server
//! - **Dependency checkers**: run concurrently on readiness probes, each bounded
//!   by its own timeout, reported per name in the readiness body
//! - **Graceful shutdown**: SIGTERM/SIGINT fail liveness and readiness, then
//!   the probe server drains within a deadline
//! - **Configuration**: defaults, `pod-lifecycle.toml` and `POD_LIFECYCLE_*`
//!   environment variables
//!
//! ## Example
//!
//! ```rust,no_run
//! use pod_lifecycle::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ProbeConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let manager = PodManager::builder()
//!         .with_config(config)
//!         .with_checker("db", TcpChecker::new("localhost:5432"))
//!         .build()?;
//!
//!     manager.start().await?;
//!     manager.set_ready().await;
//!
//!     // Blocks until SIGTERM/SIGINT, then drains
//!     manager.run().await?;
//!     Ok(())
//! }
//! ```

pub mod checks;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod manager;
pub mod observability;
pub mod responder;
pub mod server;
pub mod state;

pub use checks::{
    checker_fn, CheckError, CheckStatus, Checker, CheckerRegistry, FanOut, FnChecker, HttpChecker,
    ReadinessReport, TcpChecker,
};
pub use config::{Binding, CheckMechanism, ProbeConfig};
pub use error::{Error, ErrorHandler, Result};
pub use manager::{run, Phase, PodManager, PodManagerBuilder};
pub use responder::{DrainOutcome, Probe, ProbeResponder, Responder};
pub use state::{LifecycleSnapshot, LifecycleState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checks::{
        checker_fn, CheckError, CheckStatus, Checker, HttpChecker, ReadinessReport, TcpChecker,
    };
    pub use crate::config::{Binding, CheckMechanism, ProbeConfig};
    pub use crate::error::{Error, Result};
    pub use crate::grpc::GrpcLoggingLayer;
    pub use crate::manager::{Phase, PodManager, PodManagerBuilder};
    pub use crate::observability::init_tracing;
    pub use crate::responder::DrainOutcome;
    pub use crate::server::shutdown_signal;

    pub use async_trait::async_trait;
}
