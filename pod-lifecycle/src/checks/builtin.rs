//! Ready-made checkers

use async_trait::async_trait;
use std::future::Future;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{CheckError, Checker};

/// Checker backed by an async closure
///
/// ```rust,ignore
/// let db = checker_fn(move || {
///     let pool = pool.clone();
///     async move { pool.ping().await.map_err(|e| CheckError::from_error(&e)) }
/// });
/// ```
pub struct FnChecker<F> {
    f: F,
}

/// Build a [`FnChecker`] from a closure returning a future
pub fn checker_fn<F, Fut>(f: F) -> FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CheckError>> + Send + 'static,
{
    FnChecker { f }
}

#[async_trait]
impl<F, Fut> Checker for FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CheckError>> + Send + 'static,
{
    async fn check(&self, _deadline: Instant) -> Result<(), CheckError> {
        (self.f)().await
    }
}

/// Passes when a TCP connection to `addr` can be opened before the deadline
#[derive(Debug, Clone)]
pub struct TcpChecker {
    addr: String,
}

impl TcpChecker {
    /// Check connectivity to `addr` (`host:port`)
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Target address
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, deadline: Instant) -> Result<(), CheckError> {
        match tokio::time::timeout_at(deadline, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(CheckError::new(format!("connect {}: {}", self.addr, err))),
            Err(_) => Err(CheckError::new(format!("connect {}: timed out", self.addr))),
        }
    }
}

/// Passes when `GET url` answers with a 2xx status before the deadline
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
    url: String,
}

impl HttpChecker {
    /// Check `url` with a default client
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Check `url` with a caller-configured client
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, deadline: Instant) -> Result<(), CheckError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = self
            .client
            .get(&self.url)
            .timeout(remaining)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CheckError::new(format!("GET {} returned {}", self.url, status)))
        }
    }
}
