//! Prometheus metrics HTTP endpoint
//!
//! Serves engine counters in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with client label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, client: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{client=\"{client}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    client: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{client=\"{client}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{client=\"{client}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{client=\"{client}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{client=\"{client}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, client: &str) -> String {
    let summary = metrics.totals();
    let mut output = String::with_capacity(4096);

    write_ranging_metrics(&mut output, client, &summary);
    write_timer_metrics(&mut output, client, &summary);
    write_delivery_metrics(&mut output, client, &summary);

    output
}

fn write_ranging_metrics(output: &mut String, client: &str, s: &MetricsSummary) {
    write_metric(output, "beacon_batches_total", "Ranging batches processed", MetricType::Counter, client, s.batches_total);
    write_metric(output, "beacon_samples_total", "Raw beacon samples received", MetricType::Counter, client, s.samples_total);
    write_metric(
        output,
        "beacon_samples_ignored_total",
        "Samples for regions that were not monitored",
        MetricType::Counter,
        client,
        s.samples_ignored,
    );
    write_histogram(
        output,
        "beacon_batch_latency_us",
        "Ranging batch processing latency in microseconds",
        client,
        &s.lat_buckets,
        s.avg_batch_latency_us,
    );
    write_metric(output, "beacon_zone_changes_total", "Committed zone changes", MetricType::Counter, client, s.zone_changes);
    write_metric(
        output,
        "beacon_monitored_regions",
        "Regions currently handed to the platform",
        MetricType::Gauge,
        client,
        s.monitored_regions,
    );
    write_metric(output, "beacon_reconfigurations_total", "Site configurations applied", MetricType::Counter, client, s.reconfigurations);
}

fn write_timer_metrics(output: &mut String, client: &str, s: &MetricsSummary) {
    write_metric(output, "beacon_timers_scheduled_total", "Delayed events scheduled", MetricType::Counter, client, s.timers_scheduled);
    write_metric(output, "beacon_timers_cancelled_total", "Delayed events cancelled", MetricType::Counter, client, s.timers_cancelled);
    write_metric(output, "beacon_timers_fired_total", "Delayed events fired", MetricType::Counter, client, s.timers_fired);
    write_metric(
        output,
        "beacon_timers_dropped_total",
        "Delayed events dropped after the background budget",
        MetricType::Counter,
        client,
        s.timers_dropped,
    );
}

fn write_delivery_metrics(output: &mut String, client: &str, s: &MetricsSummary) {
    write_metric(output, "beacon_actions_fired_total", "Actions fired", MetricType::Counter, client, s.actions_fired);
    write_metric(
        output,
        "beacon_actions_suppressed_total",
        "Actions suppressed by the refire interval",
        MetricType::Counter,
        client,
        s.actions_suppressed,
    );
    write_metric(output, "beacon_events_spooled_total", "Events queued for delivery", MetricType::Counter, client, s.events_spooled);
    write_metric(
        output,
        "beacon_events_spool_dropped_total",
        "Queued events dropped at the queue limit",
        MetricType::Counter,
        client,
        s.events_spool_dropped,
    );
    write_metric(output, "beacon_events_delivered_total", "Events acknowledged by the backend", MetricType::Counter, client, s.events_delivered);
    write_metric(output, "beacon_delivery_failures_total", "Failed delivery attempts", MetricType::Counter, client, s.delivery_failures);
    write_metric(output, "beacon_spool_len", "Events waiting for delivery", MetricType::Gauge, client, s.spool_len);
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    client: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response =
                text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &client));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok".to_string())),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found".to_string())),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    client: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let client = Arc::new(client);

    info!(port = %port, client = %client, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let client = client.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), client.clone())
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_batch(4, 150);
        metrics.record_batch(2, 250);
        metrics.record_action_fired();
        metrics.set_spool_len(3);

        let output = format_prometheus_metrics(&metrics, "store-7");

        assert!(output.contains("beacon_batches_total{client=\"store-7\"} 2"));
        assert!(output.contains("beacon_samples_total{client=\"store-7\"} 6"));
        assert!(output.contains("beacon_batch_latency_us_bucket{client=\"store-7\",le=\"+Inf\"} 2"));
        assert!(output.contains("beacon_actions_fired_total{client=\"store-7\"} 1"));
        assert!(output.contains("beacon_spool_len{client=\"store-7\"} 3"));
    }

    #[test]
    fn test_scrape_leaves_report_window_intact() {
        let metrics = Metrics::new();
        metrics.record_batch(1, 150);

        let first = format_prometheus_metrics(&metrics, "c");
        let second = format_prometheus_metrics(&metrics, "c");
        assert!(first.contains("beacon_batch_latency_us_count{client=\"c\"} 1"));
        assert_eq!(first, second);

        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 1);
        // Scrapes keep the lifetime histogram after the log window resets
        let third = format_prometheus_metrics(&metrics, "c");
        assert!(third.contains("beacon_batch_latency_us_count{client=\"c\"} 1"));
    }
}
