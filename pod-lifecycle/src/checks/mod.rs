//! Dependency checkers consulted by the readiness probe
//!
//! A [`Checker`] tests one external dependency. Checkers are registered by
//! name in a [`CheckerRegistry`], fixed once the manager is built, and run
//! concurrently by the [`FanOut`] engine on every readiness evaluation.
//! Liveness never consults them: a dependency outage must not get the
//! process restarted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

mod builtin;
mod fanout;

pub use builtin::{checker_fn, FnChecker, HttpChecker, TcpChecker};
pub use fanout::{FanOut, ReadinessReport, DEADLINE_EXCEEDED};

/// Reports the health of an external dependency
///
/// Implementations must be safe for concurrent use; the same checker may be
/// evaluated by overlapping readiness probes. `deadline` is the instant after
/// which the result is discarded and recorded as a timeout, so implementations
/// that perform I/O should bound their own work by it.
#[async_trait]
pub trait Checker: Send + Sync + 'static {
    /// Check the dependency
    async fn check(&self, deadline: Instant) -> Result<(), CheckError>;
}

#[async_trait]
impl<C: Checker + ?Sized> Checker for Arc<C> {
    async fn check(&self, deadline: Instant) -> Result<(), CheckError> {
        (**self).check(deadline).await
    }
}

/// A failed dependency check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CheckError {
    message: String,
}

impl CheckError {
    /// Create a check error with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any error, keeping its display text
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    /// The failure detail
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for CheckError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CheckError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for CheckError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<reqwest::Error> for CheckError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_error(&err)
    }
}

/// Outcome of one checker, serialized as `"ok"` or `"error: <message>"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CheckStatus {
    /// Dependency is healthy
    Ok,
    /// Dependency failed or timed out
    Error(String),
}

impl CheckStatus {
    /// Whether the dependency is healthy
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

impl From<CheckStatus> for String {
    fn from(status: CheckStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for CheckStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        if value == "ok" {
            return Ok(CheckStatus::Ok);
        }
        value
            .strip_prefix("error: ")
            .map(|message| CheckStatus::Error(message.to_string()))
            .ok_or_else(|| format!("unrecognized check status: {value}"))
    }
}

/// Named collection of dependency checkers
///
/// Registering an existing name replaces the previous checker.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checker under `name`, returning the one it replaced
    pub fn register(
        &mut self,
        name: impl Into<String>,
        checker: impl Checker,
    ) -> Option<Arc<dyn Checker>> {
        self.checkers.insert(name.into(), Arc::new(checker))
    }

    /// Look up a checker by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Checker>> {
        self.checkers.get(name)
    }

    /// Registered names, in no particular order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checkers.keys().map(String::as_str)
    }

    /// Iterate over `(name, checker)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Checker>)> {
        self.checkers.iter().map(|(name, c)| (name.as_str(), c))
    }

    /// Number of registered checkers
    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    /// Whether no checker is registered
    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }
}

impl fmt::Debug for CheckerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.checkers.keys()).finish()
    }
}
