// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Scheduler --------
pub static JOB_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("job_runs_total", "job executions (labels: job, status)"),
        &["job", "status"],
    )
    .unwrap()
});

pub static JOB_EXECUTING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("job_executing", "1 while an execution is in flight"),
        &["job"],
    )
    .unwrap()
});

pub static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("job_duration_seconds", "wall time of one execution")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["job"],
    )
    .unwrap()
});

pub static REGISTRY_JOBS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("registry_jobs", "controllers owned by the registry").unwrap());

// -------- Trade pipeline --------
pub static FILLS_AGGREGATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fills_aggregated_total", "raw fills consumed by aggregation"),
        &["exchange"],
    )
    .unwrap()
});

pub static TRADES_BOOKED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_booked_total", "canonical trades applied to the book"),
        &["exchange", "market"],
    )
    .unwrap()
});

pub static BOOK_POSITION: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("book_position_size", "position size per book entry"),
        &["exchange", "market", "ticker"],
    )
    .unwrap()
});

/// Register every collector once; repeated calls are harmless.
pub fn init() {
    let collectors: [Box<dyn prometheus::core::Collector>; 7] = [
        Box::new(JOB_RUNS.clone()),
        Box::new(JOB_EXECUTING.clone()),
        Box::new(JOB_DURATION.clone()),
        Box::new(REGISTRY_JOBS.clone()),
        Box::new(FILLS_AGGREGATED.clone()),
        Box::new(TRADES_BOOKED.clone()),
        Box::new(BOOK_POSITION.clone()),
    ];
    for c in collectors {
        // AlreadyReg on a second init
        let _ = REGISTRY.register(c);
    }
}

/// Prometheus text exposition of everything in `REGISTRY`.
pub fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

/// Request line -> (status line, body). Only `/` and `/metrics` exist.
fn route(request: &str) -> (&'static str, Vec<u8>) {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    match path.split('?').next().unwrap_or(path) {
        "/" | "/metrics" => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    }
}

async fn handle_client(mut stream: TcpStream) -> std::io::Result<()> {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).await?;
    let (status, body) = route(&String::from_utf8_lossy(&req[..n]));

    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await
}

/// Tiny HTTP/1.1 responder for scrapes. One task per connection.
pub async fn serve_metrics(port: u16) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream).await {
                        debug!(?e, %peer, "metrics client error");
                    }
                });
            }
            Err(e) => error!(?e, "metrics accept error"),
        }
    }
}
