//! Concurrent evaluation of every registered checker

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{CheckStatus, Checker, CheckerRegistry};

/// Failure detail recorded for a checker that missed its deadline
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Per-checker results of one readiness evaluation
///
/// Serializes as a flat JSON object: `{"db":"ok","cache":"error: boom"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadinessReport {
    checks: HashMap<String, CheckStatus>,
}

impl ReadinessReport {
    /// `true` iff every checker reported ok (vacuously true when empty)
    pub fn passed(&self) -> bool {
        self.checks.values().all(CheckStatus::is_ok)
    }

    /// Whether no checker was evaluated
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Number of checkers evaluated
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Status of a single checker
    pub fn get(&self, name: &str) -> Option<&CheckStatus> {
        self.checks.get(name)
    }

    /// Iterate over `(name, status)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CheckStatus)> {
        self.checks.iter().map(|(name, s)| (name.as_str(), s))
    }
}

/// Runs all registered checkers concurrently under a shared deadline
///
/// Each evaluation is spawned onto a [`JoinSet`] and bounded by
/// `min(request_deadline, now + checker_timeout)`. The engine waits for every
/// evaluation before returning, so the report always holds one entry per
/// registered checker. Dropping the returned future aborts any evaluation
/// still in flight.
#[derive(Debug, Clone)]
pub struct FanOut {
    registry: Arc<CheckerRegistry>,
    checker_timeout: Duration,
}

impl FanOut {
    /// Create an engine over a fixed registry
    pub fn new(registry: Arc<CheckerRegistry>, checker_timeout: Duration) -> Self {
        Self {
            registry,
            checker_timeout,
        }
    }

    /// The registry this engine evaluates
    pub fn registry(&self) -> &CheckerRegistry {
        &self.registry
    }

    /// Whether there is nothing to evaluate
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Deadline each checker gets when evaluation starts at `now`
    pub fn effective_deadline(&self, now: Instant, request_deadline: Option<Instant>) -> Instant {
        let own = now + self.checker_timeout;
        match request_deadline {
            Some(request) => own.min(request),
            None => own,
        }
    }

    /// Evaluate every checker and collect their results
    pub async fn evaluate(&self, request_deadline: Option<Instant>) -> ReadinessReport {
        let mut report = ReadinessReport::default();
        if self.registry.is_empty() {
            return report;
        }

        let deadline = self.effective_deadline(Instant::now(), request_deadline);
        let mut tasks = JoinSet::new();
        for (name, checker) in self.registry.iter() {
            let name = name.to_string();
            let checker = checker.clone();
            tasks.spawn(async move {
                let status = run_checker(checker, deadline).await;
                (name, status)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, status)) => {
                    if let CheckStatus::Error(ref detail) = status {
                        tracing::warn!(checker = %name, error = %detail, "Dependency check failed");
                    }
                    report.checks.insert(name, status);
                }
                Err(err) => {
                    tracing::error!(error = %err, "Dependency check task did not complete");
                }
            }
        }

        // A task can only go missing if the runtime cancelled it.
        for name in self.registry.names() {
            report
                .checks
                .entry(name.to_string())
                .or_insert_with(|| CheckStatus::Error("checker cancelled".to_string()));
        }

        tracing::debug!(
            checkers = report.len(),
            passed = report.passed(),
            "Readiness checks evaluated"
        );

        report
    }
}

async fn run_checker(checker: Arc<dyn Checker>, deadline: Instant) -> CheckStatus {
    let check = AssertUnwindSafe(checker.check(deadline)).catch_unwind();
    match tokio::time::timeout_at(deadline, check).await {
        Ok(Ok(Ok(()))) => CheckStatus::Ok,
        Ok(Ok(Err(err))) => CheckStatus::Error(err.to_string()),
        Ok(Err(_)) => CheckStatus::Error("checker panicked".to_string()),
        Err(_) => CheckStatus::Error(DEADLINE_EXCEEDED.to_string()),
    }
}
