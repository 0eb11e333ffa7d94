// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction { Buy, Sell }

impl Direction {
    /// Accepts the spellings exchanges use: "buy"/"sell", "B"/"A" (bid/ask).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "bid" => Some(Direction::Buy),
            "sell" | "s" | "a" | "ask" => Some(Direction::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Direction::Buy => "Buy", Direction::Sell => "Sell" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market { Spot, Futures }

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Market::Spot => "Spot", Market::Futures => "Futures" })
    }
}

/// Canonical trade record. Produced by aggregation, completed by the ledger
/// (`order_value`, `pnl`) and upserted downstream keyed by `trade_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub exchange: String,
    pub market: Market,
    pub direction: Direction,
    pub price: f64,
    pub order_size: f64,
    pub order_value: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub fee_usd: f64,
    pub pnl: f64,
    pub trade_id: String,
    /// Epoch milliseconds of the earliest merged fill.
    pub time: i64,
    pub aggregated_trades: u32,
}

impl Trade {
    pub fn book_key(&self) -> BookKey {
        BookKey {
            exchange: self.exchange.clone(),
            market: self.market,
            ticker: self.ticker.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookKey { pub exchange: String, pub market: Market, pub ticker: String }

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.exchange, self.market, self.ticker)
    }
}

/// Running position for one (exchange, market, ticker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub exchange: String,
    pub ticker: String,
    pub market: Market,
    pub asset_type: String,
    pub position_size: f64,
    pub average_price: f64,
    pub cost_basis: f64,
}

impl BookEntry {
    pub fn empty(key: &BookKey) -> Self {
        Self {
            exchange: key.exchange.clone(),
            ticker: key.ticker.clone(),
            market: key.market,
            asset_type: "Token".to_string(),
            position_size: 0.0,
            average_price: 0.0,
            cost_basis: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance { pub exchange: String, pub account: String, pub ticker: String, pub amount: f64 }

// ---- Job execution logs / snapshots ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel { Info, Error, Success }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog { pub timestamp: DateTime<Utc>, pub message: String, pub level: LogLevel }

impl JobLog {
    pub fn now(message: impl Into<String>, level: LogLevel) -> Self {
        Self { timestamp: Utc::now(), message: message.into(), level }
    }
}

/// Point-in-time copy of one controller's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    /// whole seconds
    pub interval: u64,
    pub running: bool,
    pub last_run_unix: i64,
    pub next_run_unix: i64,
    pub err: Option<String>,
    pub is_executing: bool,
    pub current_status: String,
    pub run_count: u64,
    pub logs: Vec<JobLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus { Running, Completed, Failed }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub logs: Vec<JobLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    JobPaused(String),
    JobResumed(String),
    JobTriggered(String),
    IntervalChanged { name: String, interval_secs: u64 },
    ErrorCleared(String),
    JobStopped(String),
}

// Recorder payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Execution(JobExecution),
    Trade(Trade),
    Book(BookEntry),
    Balance(Balance),
    Registry(RegistryEvent),
    Note(String),
}
