// ===============================
// src/exchange/hyperliquid.rs
// ===============================
//
// Hyperliquid: public /info endpoint, fills per wallet address.
// Times are epoch ms, trade ids are integers, no cost field.
// Perp coins book as Futures, spot tokens ("@N", U-wrapped) as Spot.
use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::aggregation::{parse_decimal, AggregatedGroup, RawFill};
use crate::config::Wallet;
use crate::domain::{Balance, Direction, Market, Trade};
use crate::http::RetryClient;
use crate::ledger::LedgerError;
use crate::scheduler::JobContext;
use crate::sync::{FillSource, IntoCanonical};
use crate::token;

pub const EXCHANGE: &str = "Hyperliquid";
/// Max fills per userFills / userFillsByTime response.
const PAGE_LIMIT: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperliquidFill {
    pub coin: String,
    #[serde(default)]
    pub closed_pnl: String,
    pub tid: i64,
    pub time: i64,
    #[serde(default)]
    pub fee: String,
    #[serde(default)]
    pub fee_token: String,
    pub sz: String,
    pub px: String,
    /// "B" bid / "A" ask
    pub side: String,
}

impl RawFill for HyperliquidFill {
    type Time = i64;
    type TradeId = i64;

    fn asset(&self) -> &str { &self.coin }
    fn direction(&self) -> &str { &self.side }
    fn price(&self) -> &str { &self.px }
    fn size(&self) -> &str { &self.sz }
    fn fee(&self) -> &str { &self.fee }
    fn time(&self) -> i64 { self.time }
    fn trade_id(&self) -> i64 { self.tid }

    fn set_size(&mut self, size: String) { self.sz = size; }
    fn set_fee(&mut self, fee: String) { self.fee = fee; }
    fn set_time(&mut self, time: i64) { self.time = time; }
    fn set_trade_id(&mut self, id: i64) { self.tid = id; }
}

pub fn is_perpetual(coin: &str) -> bool {
    if coin.starts_with('@') {
        return false;
    }
    !matches!(coin, "PURR/USDC" | "UFART" | "UPUMP" | "UBTC" | "UXPL" | "UETH" | "USOL")
}

pub fn normalize_ticker(coin: &str) -> String {
    let coin = coin.split('/').next().unwrap_or(coin);
    match coin {
        "@74" => "OMNIX",
        "@85" => "PIP",
        "@107" | "@207" => "HYPE",
        "@116" => "MUNCH",
        "@125" => "VAULT",
        "@142" | "UBTC" => "BTC",
        "@151" | "UETH" => "ETH",
        "@156" | "USOL" => "SOL",
        "@162" | "UFART" => "FARTCOIN",
        "@166" => "USDT0",
        "@188" | "UPUMP" => "PUMP",
        other => other,
    }
    .to_string()
}

impl IntoCanonical for HyperliquidFill {
    const EXCHANGE: &'static str = EXCHANGE;

    fn into_trade(group: AggregatedGroup<Self>) -> Result<Trade, LedgerError> {
        let f = group.fill;
        let trade_id = f.tid.to_string();
        let price: f64 = f.px.trim().parse().map_err(|_| LedgerError::InvalidPrice {
            trade_id: trade_id.clone(),
            value: f.px.clone(),
        })?;
        let size: f64 = f.sz.trim().parse().map_err(|_| LedgerError::InvalidSize {
            trade_id: trade_id.clone(),
            value: f.sz.clone(),
        })?;
        let direction = if f.side.eq_ignore_ascii_case("A") { Direction::Sell } else { Direction::Buy };
        let market = if is_perpetual(&f.coin) { Market::Futures } else { Market::Spot };
        let fee = parse_decimal(&f.fee);
        let fee_currency = normalize_ticker(&f.fee_token);

        Ok(Trade {
            ticker: normalize_ticker(&f.coin),
            exchange: EXCHANGE.to_string(),
            market,
            direction,
            price,
            order_size: size,
            order_value: price * size,
            fee,
            fee_usd: token::fee_usd(fee, &fee_currency, price),
            fee_currency,
            pnl: 0.0,
            trade_id,
            time: f.time,
            aggregated_trades: group.count,
        })
    }
}

// ---- REST ----

#[derive(Debug, Deserialize)]
struct SpotState {
    #[serde(default)]
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    coin: String,
    total: String,
}

/// One wallet on Hyperliquid.
pub struct HyperliquidClient {
    http: RetryClient,
    base_url: String,
    wallet: Wallet,
}

impl HyperliquidClient {
    pub fn new(http: RetryClient, base_url: &str, wallet: Wallet) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), wallet }
    }

    fn info_url(&self) -> String { format!("{}/info", self.base_url) }

    async fn user_fills(&self, start_ms: Option<i64>, ctx: &JobContext) -> anyhow::Result<Vec<HyperliquidFill>> {
        let body = match start_ms {
            None => json!({"type": "userFills", "user": self.wallet.address, "aggregateByTime": true}),
            Some(start) => json!({
                "type": "userFillsByTime",
                "user": self.wallet.address,
                "aggregateByTime": true,
                "startTime": start,
            }),
        };
        Ok(self.http.post_json(&self.info_url(), &body, ctx.token()).await?)
    }
}

#[async_trait]
impl FillSource for HyperliquidClient {
    type Fill = HyperliquidFill;

    fn label(&self) -> String { self.wallet.label.clone() }

    async fn fetch_balances(&self, ctx: &JobContext) -> anyhow::Result<Vec<Balance>> {
        let body = json!({"type": "spotClearinghouseState", "user": self.wallet.address});
        let state: SpotState = self.http.post_json(&self.info_url(), &body, ctx.token()).await?;
        Ok(state
            .balances
            .into_iter()
            .map(|b| Balance {
                exchange: EXCHANGE.to_string(),
                account: self.wallet.label.clone(),
                ticker: normalize_ticker(&b.coin),
                amount: parse_decimal(&b.total),
            })
            .filter(|b| b.amount != 0.0)
            .collect())
    }

    async fn fetch_fills(&self, ctx: &JobContext, since_ms: Option<i64>) -> anyhow::Result<Vec<HyperliquidFill>> {
        let label = &self.wallet.label;
        let mut out = Vec::new();
        let mut seed = since_ms;

        loop {
            if ctx.is_cancelled() {
                bail!("cancelled");
            }
            match seed {
                None => ctx.status(format!("[{label}] fetching all user fills")),
                Some(s) => ctx.status(format!("[{label}] fetching user fills from {s}")),
            }
            let fills = self.user_fills(seed, ctx).await?;
            let n = fills.len();
            // userFills (no start time) only ever returns the latest page
            let next = fills.iter().map(|f| f.time).max().map(|t| t + 1);
            out.extend(fills);

            if n < PAGE_LIMIT || seed.is_none() {
                break;
            }
            seed = next;
            ctx.status(format!("[{label}] more fills available, continuing"));
        }

        debug!(wallet = %label, fills = out.len(), "hyperliquid fills fetched");
        Ok(out)
    }
}
