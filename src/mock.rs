// ===============================
// src/mock.rs
// ===============================
//
// Mock exchange for dry runs: random-walk prices per ticker, a burst of fills
// per fetch spread over the last few minutes. Prices are rounded to whole
// ticks so fills in the same minute regularly share a price and merge.
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use crate::aggregation::{format_decimal, parse_decimal, AggregatedGroup, RawFill};
use crate::domain::{Balance, Direction, Market, Trade};
use crate::ledger::LedgerError;
use crate::scheduler::JobContext;
use crate::sync::{FillSource, IntoCanonical};

pub const EXCHANGE: &str = "Mock";

#[derive(Debug, Clone, PartialEq)]
pub struct MockFill {
    pub id: i64,
    pub ticker: String,
    pub side: Direction,
    pub side_text: String,
    pub price: String,
    pub qty: String,
    pub fee: String,
    pub time_ms: i64,
}

impl RawFill for MockFill {
    type Time = i64;
    type TradeId = i64;

    fn asset(&self) -> &str { &self.ticker }
    fn direction(&self) -> &str { &self.side_text }
    fn price(&self) -> &str { &self.price }
    fn size(&self) -> &str { &self.qty }
    fn fee(&self) -> &str { &self.fee }
    fn time(&self) -> i64 { self.time_ms }
    fn trade_id(&self) -> i64 { self.id }

    fn set_size(&mut self, size: String) { self.qty = size; }
    fn set_fee(&mut self, fee: String) { self.fee = fee; }
    fn set_time(&mut self, time: i64) { self.time_ms = time; }
    fn set_trade_id(&mut self, id: i64) { self.id = id; }
}

impl IntoCanonical for MockFill {
    const EXCHANGE: &'static str = EXCHANGE;

    fn into_trade(group: AggregatedGroup<Self>) -> Result<Trade, LedgerError> {
        let f = group.fill;
        let price: f64 = f.price.parse().map_err(|_| LedgerError::InvalidPrice {
            trade_id: f.id.to_string(),
            value: f.price.clone(),
        })?;
        let size = parse_decimal(&f.qty);
        let fee = parse_decimal(&f.fee);
        Ok(Trade {
            ticker: f.ticker,
            exchange: EXCHANGE.to_string(),
            market: Market::Spot,
            direction: f.side,
            price,
            order_size: size,
            order_value: price * size,
            fee,
            fee_currency: "USD".to_string(),
            fee_usd: fee,
            pnl: 0.0,
            trade_id: f.id.to_string(),
            time: f.time_ms,
            aggregated_trades: group.count,
        })
    }
}

pub struct MockSource {
    tickers: Vec<String>,
    fills_per_fetch: usize,
    // prices in whole ticks (1 tick = 1.0)
    prices: Mutex<HashMap<String, i64>>,
    next_id: AtomicI64,
}

impl MockSource {
    pub fn new(tickers: &[&str], fills_per_fetch: usize) -> Self {
        let prices = tickers.iter().map(|t| (t.to_string(), 100)).collect();
        Self {
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            fills_per_fetch,
            prices: Mutex::new(prices),
            next_id: AtomicI64::new(1),
        }
    }

    fn generate(&self, since_ms: Option<i64>) -> Vec<MockFill> {
        let now = Utc::now().timestamp_millis();
        let from = since_ms.unwrap_or(now - 300_000).max(now - 300_000);
        let mut prices = match self.prices.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        // ThreadRng must not live across an .await
        let mut rng = rand::thread_rng();

        let mut out = Vec::with_capacity(self.fills_per_fetch);
        for _ in 0..self.fills_per_fetch {
            let Some(ticker) = self.tickers.get(rng.gen_range(0..self.tickers.len().max(1))) else { break };
            let px = prices.entry(ticker.clone()).or_insert(100);
            *px = (*px + rng.gen_range(-1..=1)).max(1);

            let side = if rng.gen_bool(0.6) { Direction::Buy } else { Direction::Sell };
            let qty = rng.gen_range(1..=20) as f64 / 10.0;
            out.push(MockFill {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                ticker: ticker.clone(),
                side,
                side_text: side.to_string(),
                price: px.to_string(),
                qty: format_decimal(qty),
                fee: format_decimal(qty * *px as f64 * 0.001),
                time_ms: rng.gen_range(from..=now.max(from)),
            });
        }
        out
    }
}

#[async_trait]
impl FillSource for MockSource {
    type Fill = MockFill;

    fn label(&self) -> String { "mock".to_string() }

    async fn fetch_balances(&self, _ctx: &JobContext) -> anyhow::Result<Vec<Balance>> {
        let mut rng = rand::thread_rng();
        Ok(self
            .tickers
            .iter()
            .map(|t| Balance {
                exchange: EXCHANGE.to_string(),
                account: "mock".to_string(),
                ticker: t.clone(),
                amount: rng.gen_range(0.0..10.0),
            })
            .collect())
    }

    async fn fetch_fills(&self, ctx: &JobContext, since_ms: Option<i64>) -> anyhow::Result<Vec<MockFill>> {
        let fills = self.generate(since_ms);
        ctx.status(format!("generated {} mock fills", fills.len()));
        Ok(fills)
    }
}
