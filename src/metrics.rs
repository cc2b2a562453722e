//! Prometheus metrics and the scrape endpoint.
//!
//! One `Metrics` handle is shared by the poller, the workers, and the
//! queue; it is cheap to clone. The scrape endpoint is a minimal HTTP
//! responder: one GET route, text exposition format.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use prometheus::{
    exponential_buckets, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram,
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::StageKind;

/// All pipeline metrics, registered on one private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub items_discovered: IntCounter,
    pub items_deduplicated: IntCounter,
    pub items_enqueued: IntCounter,
    pub items_succeeded: IntCounter,
    pub items_failed: IntCounterVec,
    pub items_cancelled: IntCounter,

    pub polls: IntCounter,
    pub poll_failures: IntCounter,

    pub stage_retries: IntCounterVec,
    pub queue_depth: IntGauge,
    pub in_flight: IntGauge,

    pub stage_duration: HistogramVec,
    pub item_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let items_discovered = register_int_counter_with_registry!(
            Opts::new("recap_items_discovered_total", "New transcripts admitted"),
            registry
        )?;
        let items_deduplicated = register_int_counter_with_registry!(
            Opts::new(
                "recap_items_deduplicated_total",
                "Catalog entries dropped as already seen"
            ),
            registry
        )?;
        let items_enqueued = register_int_counter_with_registry!(
            Opts::new("recap_items_enqueued_total", "Items placed on the work queue"),
            registry
        )?;
        let items_succeeded = register_int_counter_with_registry!(
            Opts::new(
                "recap_items_succeeded_total",
                "Items that completed all four stages"
            ),
            registry
        )?;
        let items_failed = register_int_counter_vec_with_registry!(
            Opts::new("recap_items_failed_total", "Items that ended in failure"),
            &["stage", "class"],
            registry
        )?;
        let items_cancelled = register_int_counter_with_registry!(
            Opts::new(
                "recap_items_cancelled_total",
                "Items interrupted by shutdown before completion"
            ),
            registry
        )?;

        let polls = register_int_counter_with_registry!(
            Opts::new("recap_polls_total", "Catalog polls attempted"),
            registry
        )?;
        let poll_failures = register_int_counter_with_registry!(
            Opts::new("recap_poll_failures_total", "Catalog polls that errored"),
            registry
        )?;

        let stage_retries = register_int_counter_vec_with_registry!(
            Opts::new("recap_stage_retries_total", "Retry attempts per stage"),
            &["stage"],
            registry
        )?;
        let queue_depth = register_int_gauge_with_registry!(
            Opts::new("recap_queue_depth", "Items buffered in the work queue"),
            registry
        )?;
        let in_flight = register_int_gauge_with_registry!(
            Opts::new("recap_items_in_flight", "Items currently being processed"),
            registry
        )?;

        let stage_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "recap_stage_duration_seconds",
                "Wall time per stage, successful or not"
            )
            .buckets(exponential_buckets(0.05, 2.0, 12)?),
            &["stage"],
            registry
        )?;
        let item_duration = register_histogram_with_registry!(
            HistogramOpts::new(
                "recap_item_duration_seconds",
                "Wall time from dequeue to terminal state"
            )
            .buckets(exponential_buckets(0.1, 2.0, 12)?),
            registry
        )?;

        Ok(Self {
            registry,
            items_discovered,
            items_deduplicated,
            items_enqueued,
            items_succeeded,
            items_failed,
            items_cancelled,
            polls,
            poll_failures,
            stage_retries,
            queue_depth,
            in_flight,
            stage_duration,
            item_duration,
        })
    }

    pub fn observe_stage(&self, stage: StageKind, elapsed: Duration) {
        self.stage_duration
            .with_label_values(&[stage.name()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn add_stage_retries(&self, stage: StageKind, retries: u32) {
        if retries > 0 {
            self.stage_retries
                .with_label_values(&[stage.name()])
                .inc_by(retries as u64);
        }
    }

    pub fn record_failure(&self, stage: StageKind, class: &str) {
        self.items_failed
            .with_label_values(&[stage.name(), class])
            .inc();
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .context("failed to encode metrics")
    }
}

/// Binds the scrape endpoint.
///
/// Kept separate from [`serve`] so the caller can fail startup on a bind
/// error instead of discovering it inside a spawned task.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;
    info!(%addr, "metrics endpoint listening");
    Ok(listener)
}

/// Serves `GET /metrics` until shutdown.
///
/// Each connection gets one response and is closed; anything that is not a
/// metrics GET gets a 404. Scrapers are the only expected clients.
pub async fn serve(
    listener: TcpListener,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "metrics accept failed");
                        continue;
                    }
                };
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = respond(stream, &metrics).await {
                        debug!(error = %e, "metrics connection error");
                    }
                });
            }
        }
    }

    info!("metrics endpoint stopped");
    Ok(())
}

async fn respond(mut stream: TcpStream, metrics: &Metrics) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await.context("request read failed")?;
    let head = String::from_utf8_lossy(&buf[..n]);

    let (status, body) = if head.starts_with("GET /metrics ") {
        ("200 OK", metrics.render()?)
    } else {
        ("404 Not Found", String::from("not found\n"))
    };

    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .context("response write failed")?;
    stream.shutdown().await.context("connection close failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_show_up_in_rendered_output() {
        let metrics = Metrics::new().unwrap();
        metrics.items_discovered.inc();
        metrics.items_discovered.inc();
        metrics.queue_depth.set(3);
        metrics.record_failure(StageKind::Enrich, "permanent");
        metrics.add_stage_retries(StageKind::Summarize, 2);
        metrics.observe_stage(StageKind::Notify, Duration::from_millis(120));

        let text = metrics.render().unwrap();
        assert!(text.contains("recap_items_discovered_total 2"));
        assert!(text.contains("recap_queue_depth 3"));
        assert!(text.contains("recap_items_failed_total{class=\"permanent\",stage=\"enrich\"} 1"));
        assert!(text.contains("recap_stage_retries_total{stage=\"summarize\"} 2"));
        assert!(text.contains("recap_stage_duration_seconds_bucket"));
    }

    #[test]
    fn zero_retry_outcomes_add_nothing() {
        let metrics = Metrics::new().unwrap();
        metrics.add_stage_retries(StageKind::Enrich, 0);
        let text = metrics.render().unwrap();
        assert!(!text.contains("recap_stage_retries_total{stage=\"enrich\"}"));
    }

    #[tokio::test]
    async fn scrape_endpoint_answers_get_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.items_enqueued.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, metrics, shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("recap_items_enqueued_total 1"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_paths_get_a_404() {
        let metrics = Metrics::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, metrics, shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_surfaces_as_an_error() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind metrics endpoint"));
    }
}
