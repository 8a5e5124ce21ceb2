//! Serving tasks with bounded graceful shutdown

use axum::body::HttpBody;
use axum::BoxError;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use crate::error::{report_error, Error, ErrorHandler, Result};
use crate::responder::DrainOutcome;

/// A spawned background task that stops cooperatively when its token is cancelled
///
/// Used for the standalone serving loops and the gRPC readiness refresher.
#[derive(Debug)]
pub(crate) struct ManagedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ManagedTask {
    /// Spawn `task`, which must resolve soon after `token` is cancelled
    pub(crate) fn spawn<F>(token: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            token,
            handle: tokio::spawn(task),
        }
    }

    /// Cancel the task and wait for it until `deadline`, aborting it if the deadline elapses
    ///
    /// An aborted task is awaited until its future has been dropped, so
    /// everything it owns (for [`serve_connections`], every open connection)
    /// is gone when this returns.
    pub(crate) async fn drain(self, deadline: Instant) -> DrainOutcome {
        self.token.cancel();

        let mut handle = self.handle;
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => DrainOutcome::Graceful,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Serving task ended abnormally during drain");
                DrainOutcome::Graceful
            }
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                DrainOutcome::Forced
            }
        }
    }
}

/// Spawns HTTP/2 stream tasks that end once `abort` is cancelled
#[derive(Clone)]
struct ConnectionExecutor {
    abort: CancellationToken,
}

impl<F> hyper::rt::Executor<F> for ConnectionExecutor
where
    F: Future + Send + 'static,
{
    fn execute(&self, stream: F) {
        let abort = self.abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = stream => {}
            }
        });
    }
}

/// Accept loop serving `service` on every connection until `stop` is cancelled
///
/// Connection tasks live in a `JoinSet` owned by this future. After `stop`
/// fires, the listener closes and open connections are asked to finish
/// gracefully; if the future is dropped first (a forced drain), the set is
/// dropped with it and every remaining connection is aborted, HTTP/2 streams
/// included.
pub(crate) async fn serve_connections<S, B>(
    listener: TcpListener,
    service: S,
    stop: CancellationToken,
    error_handler: Option<ErrorHandler>,
) where
    S: Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let abort = CancellationToken::new();
    let _abort_streams = abort.clone().drop_guard();
    let builder = AutoBuilder::new(ConnectionExecutor { abort });
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        report_error(error_handler.as_ref(), Error::Io(err));
                        continue;
                    }
                };
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::debug!(error = %err, "Failed to set TCP_NODELAY");
                }

                let service = service.clone();
                let service = hyper::service::service_fn(move |request: http::Request<Incoming>| {
                    service.clone().oneshot(request)
                });
                let connection = builder
                    .serve_connection_with_upgrades(TokioIo::new(socket), service)
                    .into_owned();
                let connection = graceful.watch(connection);

                connections.spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::debug!(peer = %peer, error = %err, "Probe connection closed");
                    }
                });
            }
        }
    }

    drop(listener);
    graceful.shutdown().await;
    while connections.join_next().await.is_some() {}
}

/// Bind a TCP listener, mapping failures to [`Error::Bind`]
pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
///
/// A handler that cannot be installed is logged and never fires; the other
/// signal still triggers shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
