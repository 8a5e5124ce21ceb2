//! gRPC health probes
//!
//! The three lifecycle questions are published as services `startup`, `live`
//! and `ready` of the standard `grpc.health.v1.Health` protocol, via
//! `tonic-health`. Statuses are pushed rather than computed per request.

mod health;
pub mod logging;

pub use health::GrpcResponder;
pub use logging::{GrpcLoggingLayer, GrpcLoggingService};

/// Full path prefix of health protocol calls
pub const HEALTH_PATH_PREFIX: &str = "/grpc.health.v1.Health/";
