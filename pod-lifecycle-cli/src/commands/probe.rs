use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use pod_lifecycle::{CheckMechanism, Probe};
use std::time::Duration;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Host running the probes
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Probe port (defaults to 8080 for HTTP, 50051 for gRPC)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Use the gRPC health protocol instead of HTTP
    #[arg(long)]
    pub grpc: bool,

    /// Per-probe timeout in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Show response details
    #[arg(long, short)]
    pub verbose: bool,
}

/// Answer to one probe
#[derive(Debug)]
pub struct ProbeResult {
    pub probe: Probe,
    pub passed: bool,
    pub detail: String,
    pub body: Option<String>,
}

pub async fn execute(args: ProbeArgs) -> Result<()> {
    let mechanism = if args.grpc {
        CheckMechanism::Grpc
    } else {
        CheckMechanism::Http
    };
    let port = args.port.unwrap_or(match mechanism {
        CheckMechanism::Http => 8080,
        CheckMechanism::Grpc => 50051,
    });
    let timeout = Duration::from_millis(args.timeout_ms);

    println!(
        "{}",
        format!("Probing {} on {}:{}...", mechanism, args.host, port).bold()
    );
    println!();

    let results = match mechanism {
        CheckMechanism::Http => probe_http(&args.host, port, timeout).await?,
        CheckMechanism::Grpc => probe_grpc(&args.host, port, timeout).await?,
    };

    let mut failed = 0;
    for result in &results {
        print!("{:<8} ", result.probe.service_name());
        if result.passed {
            println!("{} ({})", "✓ OK".green().bold(), result.detail);
        } else {
            failed += 1;
            println!("{} ({})", "✗ FAILED".red().bold(), result.detail);
        }
        if let Some(body) = &result.body {
            if args.verbose || !result.passed {
                println!("  {}", pretty(body));
            }
        }
    }

    println!();
    if failed > 0 {
        anyhow::bail!("{} of {} probes failed", failed, results.len());
    }
    println!("{}", "All probes passed".green().bold());
    Ok(())
}

/// GET each probe path
pub async fn probe_http(host: &str, port: u16, timeout: Duration) -> Result<Vec<ProbeResult>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")?;

    let mut results = Vec::with_capacity(Probe::ALL.len());
    for probe in Probe::ALL {
        let url = format!("http://{}:{}{}", host, port, probe.path());
        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        results.push(ProbeResult {
            probe,
            passed: status.is_success(),
            detail: format!("HTTP {}", status.as_u16()),
            body: (!body.is_empty()).then_some(body),
        });
    }

    Ok(results)
}

/// Check each probe service over the gRPC health protocol
pub async fn probe_grpc(host: &str, port: u16, timeout: Duration) -> Result<Vec<ProbeResult>> {
    let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{host}:{port}"))
        .context("Invalid gRPC endpoint")?
        .connect_timeout(timeout)
        .timeout(timeout);
    let channel = endpoint
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    let mut client = HealthClient::new(channel);

    let mut results = Vec::with_capacity(Probe::ALL.len());
    for probe in Probe::ALL {
        let request = HealthCheckRequest {
            service: probe.service_name().to_string(),
        };
        let result = match client.check(request).await {
            Ok(response) => {
                let status = response.into_inner().status();
                ProbeResult {
                    probe,
                    passed: status == ServingStatus::Serving,
                    detail: status.as_str_name().to_string(),
                    body: None,
                }
            }
            Err(status) => ProbeResult {
                probe,
                passed: false,
                detail: format!("{:?}: {}", status.code(), status.message()),
                body: None,
            },
        };
        results.push(result);
    }

    Ok(results)
}

fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_lifecycle::prelude::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_probe_http_reports_each_endpoint() {
        let port = free_port();
        let manager = PodManager::builder()
            .with_bind_address([127, 0, 0, 1].into())
            .with_http_port(u32::from(port))
            .with_checker("db", checker_fn(|| async { Err(CheckError::new("down")) }))
            .build()
            .unwrap();
        manager.start().await.unwrap();
        manager.set_ready().await;

        let results = probe_http("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        let verdicts: Vec<_> = results.iter().map(|r| (r.probe, r.passed)).collect();
        assert_eq!(
            verdicts,
            vec![(Probe::Startup, true), (Probe::Live, true), (Probe::Ready, false)]
        );
        assert_eq!(results[2].body.as_deref(), Some(r#"{"db":"error: down"}"#));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_grpc_reports_each_service() {
        let port = free_port();
        let manager = PodManager::builder()
            .with_mechanism(CheckMechanism::Grpc)
            .with_bind_address([127, 0, 0, 1].into())
            .with_grpc_port(u32::from(port))
            .build()
            .unwrap();
        manager.start().await.unwrap();

        let results = probe_grpc("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        let verdicts: Vec<_> = results.iter().map(|r| (r.probe, r.passed)).collect();
        assert_eq!(
            verdicts,
            vec![(Probe::Startup, true), (Probe::Live, true), (Probe::Ready, false)]
        );
        assert_eq!(results[2].detail, "NOT_SERVING");

        manager.shutdown().await;
    }

    #[test]
    fn test_pretty_falls_back_to_raw_body() {
        assert_eq!(pretty("not json"), "not json");
        assert!(pretty(r#"{"db":"ok"}"#).contains("\n"));
    }
}
