//! Request logging for tonic servers
//!
//! Health protocol calls are skipped; orchestrators poll them constantly.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

use super::HEALTH_PATH_PREFIX;

/// Logs method, gRPC status and duration of each call
///
/// ```rust,ignore
/// Server::builder()
///     .layer(GrpcLoggingLayer)
///     .add_service(my_service)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcLoggingLayer;

impl<S> Layer<S> for GrpcLoggingLayer {
    type Service = GrpcLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcLoggingService { inner }
    }
}

/// Service produced by [`GrpcLoggingLayer`]
#[derive(Debug, Clone)]
pub struct GrpcLoggingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for GrpcLoggingService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // Swap in a fresh clone; the instance polled ready handles this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = req.uri().path().to_string();
        if method.starts_with(HEALTH_PATH_PREFIX) {
            return Box::pin(inner.call(req));
        }

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed();

            match &result {
                Ok(response) => {
                    let code = grpc_status(response);
                    if code == "0" {
                        tracing::info!(
                            method = %method,
                            grpc.status_code = code,
                            duration_ms = duration.as_millis(),
                            "gRPC request completed"
                        );
                    } else {
                        tracing::warn!(
                            method = %method,
                            grpc.status_code = code,
                            duration_ms = duration.as_millis(),
                            "gRPC request failed"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        method = %method,
                        error = %err,
                        duration_ms = duration.as_millis(),
                        "gRPC request failed"
                    );
                }
            }

            result
        })
    }
}

/// Status code from a trailers-only response, `"0"` (OK) when it travels in trailers
fn grpc_status<B>(response: &http::Response<B>) -> &str {
    response
        .headers()
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_passes_requests_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = tower::service_fn(move |_req: http::Request<()>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                let response = http::Response::builder()
                    .header("grpc-status", "5")
                    .body(())
                    .unwrap();
                Ok::<_, Infallible>(response)
            }
        });
        let service = GrpcLoggingLayer.layer(inner);

        for path in ["/grpc.health.v1.Health/Check", "/orders.Orders/Get"] {
            let request = http::Request::builder().uri(path).body(()).unwrap();
            let response = service.clone().oneshot(request).await.unwrap();
            assert_eq!(grpc_status(&response), "5");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_status_header_means_ok() {
        let response = http::Response::new(());
        assert_eq!(grpc_status(&response), "0");
    }
}
