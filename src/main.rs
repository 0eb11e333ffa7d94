// ===============================
// src/main.rs
// ===============================
/*
 # jobs + trade pipeline
curl -s localhost:9898/metrics | egrep '^job_(runs_total|executing)'
curl -s localhost:9898/metrics | grep '^trades_booked_total'
curl -s localhost:9898/metrics | grep '^book_position_size'

*/
/*
=============================================================================
Project : portfolio_sync — scheduled exchange sync + trade ledger in Rust
Module  : main.rs
Version : 0.1.0
Author  : portfolio_sync maintainers
License : MIT

Summary : Runs periodic exchange sync jobs (Hyperliquid, Kraken, mock) under
          a pausable/triggerable scheduler, aggregates fills into canonical
          trades, books them into a spot/futures position ledger, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::sync::Arc;

use tokio::{
    select,
    sync::mpsc,
    time::{interval, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portfolio_sync::config::{self, ConfigProvider, EnvConfigProvider};
use portfolio_sync::domain::Event;
use portfolio_sync::exchange::{hyperliquid::HyperliquidClient, kraken::KrakenClient};
use portfolio_sync::http::RetryClient;
use portfolio_sync::mock::MockSource;
use portfolio_sync::registry::{JobCatalog, JobRegistry};
use portfolio_sync::store::FileLastRunStore;
use portfolio_sync::sync::{ExchangeSyncJob, MemorySink, TradeSink};
use portfolio_sync::{metrics, recorder};

fn build_catalog(sink: Arc<dyn TradeSink>, http: RetryClient) -> JobCatalog {
    // Hyperliquid: one source per configured wallet
    let wallets = config::hyperliquid_wallets().unwrap_or_else(|e| {
        warn!(error = %e, "HYPERLIQUID_WALLETS ignored");
        Vec::new()
    });
    let api_url = config::hyperliquid_api_url();
    let hl_sources: Vec<Arc<HyperliquidClient>> = wallets
        .into_iter()
        .map(|w| Arc::new(HyperliquidClient::new(http.clone(), &api_url, w)))
        .collect();

    // Kraken: needs API credentials
    let kraken_sources: Vec<Arc<KrakenClient>> = config::kraken_credentials()
        .map(|(key, secret)| Arc::new(KrakenClient::new(http.clone(), key, secret)))
        .into_iter()
        .collect();

    let mock_sources = vec![Arc::new(MockSource::new(&["BTC", "ETH", "SOL"], 25))];

    JobCatalog::new()
        .with("update_hyperliquid", Arc::new(ExchangeSyncJob::new(hl_sources, sink.clone())), vec![])
        .with("update_kraken", Arc::new(ExchangeSyncJob::new(kraken_sources, sink.clone())), vec![])
        .with("mock_sync", Arc::new(ExchangeSyncJob::new(mock_sources, sink)), vec![])
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = config::load();
    let provider = Arc::new(EnvConfigProvider);
    for (name, _, _) in config::JOB_CATALOG {
        if let Some(s) = provider.job_settings(name) {
            info!(job = %name, enabled = s.enabled, interval_secs = s.interval_secs, "job config");
        }
    }
    info!(
        metrics_port = args.metrics_port,
        record_file = ?args.record_file,
        last_run_file = %args.last_run_file,
        history_limit = args.history_limit,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Recorder (optional) ----
    let recorder_tx = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(recorder::run(rx, path));
            Some(tx)
        }
        None => None,
    };

    // ---- Sink + jobs ----
    let sink: Arc<dyn TradeSink> = match &recorder_tx {
        Some(tx) => Arc::new(MemorySink::with_recorder(tx.clone())),
        None => Arc::new(MemorySink::new()),
    };
    let catalog = build_catalog(sink, RetryClient::default());

    let root = CancellationToken::new();
    let registry = JobRegistry::new(
        provider,
        Arc::new(FileLastRunStore::new(&args.last_run_file)),
        catalog,
        root.clone(),
        args.history_limit,
        recorder_tx.clone(),
    );

    let report = registry.sync_with_config().await;
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "some jobs could not be started");
    }

    // ---- Heartbeat ----
    let mut heartbeat = interval(Duration::from_secs(30));
    loop {
        select! {
            _ = heartbeat.tick() => {
                let jobs = registry.jobs();
                let executing = jobs.iter().filter(|j| j.is_executing).count();
                let failing: Vec<&str> = jobs.iter().filter(|j| j.err.is_some()).map(|j| j.name.as_str()).collect();
                info!(jobs = jobs.len(), executing, ?failing, executions = registry.executions().len(), "heartbeat");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    root.cancel();
    registry.shutdown();
    drop(registry);
    drop(recorder_tx);
    // give the recorder time to flush
    tokio::time::sleep(Duration::from_millis(200)).await;
}
