//! Prometheus metrics for sharded training.
//!
//! Provides collective latency, unsharded-memory, and training loop metrics.
//! Every rank running in this process shares the registry; per-rank series
//! carry a `rank` label.

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all engine metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Collective metrics
    pub collective_duration: HistogramVec,
    pub collectives_issued: CounterVec,
    pub collective_failures: CounterVec,

    // Memory metrics
    pub unsharded_groups: GaugeVec,
    pub peak_unsharded_groups: GaugeVec,
    pub unsharded_bytes: GaugeVec,
    pub backward_retained_bytes: GaugeVec,

    // Lifecycle metrics
    pub state_transitions: CounterVec,
    pub finalize_duration: Histogram,

    // Training metrics
    pub training_loss: Histogram,
    pub training_step_duration: Histogram,
    pub steps_completed: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let collective_duration = HistogramVec::new(
            HistogramOpts::new(
                "fsdp_collective_seconds",
                "Time from issue to completion of a collective",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["kind"],
        )?;
        registry.register(Box::new(collective_duration.clone()))?;

        let collectives_issued = CounterVec::new(
            Opts::new("fsdp_collectives_issued_total", "Collectives issued on the comm stream"),
            &["kind"],
        )?;
        registry.register(Box::new(collectives_issued.clone()))?;

        let collective_failures = CounterVec::new(
            Opts::new("fsdp_collective_failures_total", "Collectives that reported an error"),
            &["kind"],
        )?;
        registry.register(Box::new(collective_failures.clone()))?;

        let unsharded_groups = GaugeVec::new(
            Opts::new("fsdp_unsharded_groups", "Groups currently holding unsharded buffers"),
            &["rank"],
        )?;
        registry.register(Box::new(unsharded_groups.clone()))?;

        let peak_unsharded_groups = GaugeVec::new(
            Opts::new(
                "fsdp_peak_unsharded_groups",
                "Most non-ancestor groups unsharded at once during forward",
            ),
            &["rank"],
        )?;
        registry.register(Box::new(peak_unsharded_groups.clone()))?;

        let unsharded_bytes = GaugeVec::new(
            Opts::new("fsdp_unsharded_bytes", "Bytes held by unsharded parameter buffers"),
            &["rank"],
        )?;
        registry.register(Box::new(unsharded_bytes.clone()))?;

        let backward_retained_bytes = GaugeVec::new(
            Opts::new(
                "fsdp_backward_retained_bytes",
                "Bytes of full parameter views kept alive for backward by resharded groups",
            ),
            &["rank"],
        )?;
        registry.register(Box::new(backward_retained_bytes.clone()))?;

        let state_transitions = CounterVec::new(
            Opts::new("fsdp_state_transitions_total", "Parameter group state transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(state_transitions.clone()))?;

        let finalize_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fsdp_root_finalize_seconds",
                "Time spent draining outstanding collectives at root finalize",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0]),
        )?;
        registry.register(Box::new(finalize_duration.clone()))?;

        let training_loss = Histogram::with_opts(
            HistogramOpts::new("fsdp_training_loss", "Training loss value")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(training_loss.clone()))?;

        let training_step_duration = Histogram::with_opts(
            HistogramOpts::new("fsdp_step_duration_seconds", "Time per training step")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(training_step_duration.clone()))?;

        let steps_completed = Counter::with_opts(Opts::new(
            "fsdp_steps_completed_total",
            "Total training steps completed",
        ))?;
        registry.register(Box::new(steps_completed.clone()))?;

        Ok(Self {
            registry,
            collective_duration,
            collectives_issued,
            collective_failures,
            unsharded_groups,
            peak_unsharded_groups,
            unsharded_bytes,
            backward_retained_bytes,
            state_transitions,
            finalize_duration,
            training_loss,
            training_step_duration,
            steps_completed,
        })
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(|| {
        MetricsRegistry::new().expect("metric definitions are static and uniquely named")
    })
}

/// Record a collective issue.
pub fn record_collective_issued(kind: &str) {
    get_metrics().collectives_issued.with_label_values(&[kind]).inc();
}

/// Record a completed collective and its latency.
pub fn record_collective_completed(kind: &str, duration_secs: f64, ok: bool) {
    let m = get_metrics();
    m.collective_duration.with_label_values(&[kind]).observe(duration_secs);
    if !ok {
        m.collective_failures.with_label_values(&[kind]).inc();
    }
}

/// Record the current unsharded footprint of a rank.
pub fn record_unsharded(rank: usize, groups: usize, bytes: usize) {
    let m = get_metrics();
    let rank = rank.to_string();
    m.unsharded_groups.with_label_values(&[&rank]).set(groups as f64);
    m.unsharded_bytes.with_label_values(&[&rank]).set(bytes as f64);
}

/// Record the bytes a rank keeps alive only for its pending backward.
pub fn record_backward_retained(rank: usize, bytes: usize) {
    get_metrics()
        .backward_retained_bytes
        .with_label_values(&[&rank.to_string()])
        .set(bytes as f64);
}

/// Record the peak number of concurrently unsharded groups.
pub fn record_peak_unsharded(rank: usize, peak: usize) {
    get_metrics()
        .peak_unsharded_groups
        .with_label_values(&[&rank.to_string()])
        .set(peak as f64);
}

/// Record a parameter group state transition.
pub fn record_state_transition(from: &str, to: &str) {
    get_metrics().state_transitions.with_label_values(&[from, to]).inc();
}

/// Record root finalize time.
pub fn record_finalize_time(duration_secs: f64) {
    get_metrics().finalize_duration.observe(duration_secs);
}

/// Record a training step.
pub fn record_training_step(loss: f64, duration_secs: f64) {
    let m = get_metrics();
    m.training_loss.observe(loss);
    m.training_step_duration.observe(duration_secs);
    m.steps_completed.inc();
}

/// Start a simple HTTP server to expose metrics on the given port.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().gather().unwrap_or_default();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}
