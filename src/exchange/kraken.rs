// ===============================
// src/exchange/kraken.rs
// ===============================
//
// Kraken spot: trades come from the private TradesHistory endpoint, keyed
// by txid, with fractional-second timestamps and a `cost` field.
// Private calls are signed: API-Sign = b64(HMAC-SHA512(b64dec(secret),
// path || SHA256(nonce || postdata))).
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::Utc;
use hmac::{digest::InvalidLength, Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::aggregation::{parse_decimal, AggregatedGroup, RawFill};
use crate::domain::{Balance, Direction, Market, Trade};
use crate::http::{HttpError, RetryClient};
use crate::ledger::LedgerError;
use crate::scheduler::JobContext;
use crate::sync::{FillSource, IntoCanonical};
use crate::token;

pub const EXCHANGE: &str = "Kraken";
pub const API_URL: &str = "https://api.kraken.com";
const PAGE_SIZE: i64 = 50;
const RATE_LIMIT_WAIT: Duration = Duration::from_secs(20);
const RATE_LIMIT_RETRIES: u32 = 5;

// order matters: longest / most specific suffix first
const QUOTES: [&str; 11] = ["ZUSD", "USDT", "USDC", "USD", "ZSGD", "SGD", "ZEUR", "EUR", "XBTC", "XXBT", "XBT"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KrakenTrade {
    /// txid, taken from the TradesHistory map key
    #[serde(skip)]
    pub trade_id: String,
    pub pair: String,
    pub time: f64,
    #[serde(rename = "type")]
    pub side: String,
    #[serde(default)]
    pub ordertype: String,
    pub price: String,
    #[serde(default)]
    pub cost: String,
    #[serde(default)]
    pub fee: String,
    pub vol: String,
    #[serde(default)]
    pub maker: bool,
}

impl RawFill for KrakenTrade {
    type Time = f64;
    type TradeId = String;

    fn asset(&self) -> &str { &self.pair }
    fn direction(&self) -> &str { &self.side }
    fn price(&self) -> &str { &self.price }
    fn size(&self) -> &str { &self.vol }
    fn fee(&self) -> &str { &self.fee }
    fn cost(&self) -> Option<&str> { Some(&self.cost) }
    fn time(&self) -> f64 { self.time }
    fn trade_id(&self) -> String { self.trade_id.clone() }

    // whole seconds / 60
    fn minute_bucket(&self) -> i64 { (self.time as i64).div_euclid(60) }

    fn set_size(&mut self, size: String) { self.vol = size; }
    fn set_fee(&mut self, fee: String) { self.fee = fee; }
    fn set_cost(&mut self, cost: String) { self.cost = cost; }
    fn set_time(&mut self, time: f64) { self.time = time; }
    fn set_trade_id(&mut self, id: String) { self.trade_id = id; }
}

pub fn normalize_ticker(ticker: &str) -> String {
    match ticker {
        "XXRP" | "XZEC" | "XETH" | "ZUSD" | "ZEUR" | "XXDG" | "XLTC" | "XXMR" => ticker[1..].to_string(),
        "XBT" | "XXBT" | "XBT.F" => "BTC".to_string(),
        "TAO.F" => "TAO".to_string(),
        "SOL.F" => "SOL".to_string(),
        _ => ticker.to_string(),
    }
}

/// `XETHZUSD` -> ("ETH", "USD"). Unknown quote: (pair, "").
pub fn split_pair(pair: &str) -> (String, String) {
    QUOTES
        .iter()
        .find_map(|q| pair.strip_suffix(q).map(|base| (normalize_ticker(base), normalize_ticker(q))))
        .unwrap_or_else(|| (pair.to_string(), String::new()))
}

impl IntoCanonical for KrakenTrade {
    const EXCHANGE: &'static str = EXCHANGE;

    fn into_trade(group: AggregatedGroup<Self>) -> Result<Trade, LedgerError> {
        let t = group.fill;
        let price: f64 = t.price.trim().parse().map_err(|_| LedgerError::InvalidPrice {
            trade_id: t.trade_id.clone(),
            value: t.price.clone(),
        })?;
        let direction = Direction::parse(&t.side).ok_or_else(|| LedgerError::InvalidDirection {
            trade_id: t.trade_id.clone(),
            value: t.side.clone(),
        })?;
        let size = parse_decimal(&t.vol);
        let fee = parse_decimal(&t.fee);
        let (base, quote) = split_pair(&t.pair);

        Ok(Trade {
            ticker: base,
            exchange: EXCHANGE.to_string(),
            market: Market::Spot,
            direction,
            price,
            order_size: size,
            order_value: price * size,
            fee,
            fee_usd: token::fee_usd(fee, &quote, price),
            fee_currency: quote,
            pnl: 0.0,
            trade_id: t.trade_id,
            time: (t.time * 1000.0) as i64,
            aggregated_trades: group.count,
        })
    }
}

// ---- REST ----

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TradesHistory {
    count: i64,
    #[serde(default)]
    trades: HashMap<String, KrakenTrade>,
}

pub fn sign(secret_b64: &str, path: &str, nonce: &str, post_data: &str) -> anyhow::Result<String> {
    let secret = B64.decode(secret_b64.trim()).context("kraken secret is not base64")?;
    sign_with_key(&secret, path, nonce, post_data).map_err(|e| anyhow::anyhow!("hmac key: {e}"))
}

fn sign_with_key(secret: &[u8], path: &str, nonce: &str, post_data: &str) -> Result<String, InvalidLength> {
    let digest = Sha256::digest(format!("{nonce}{post_data}").as_bytes());
    let mut mac = Hmac::<Sha512>::new_from_slice(secret)?;
    mac.update(path.as_bytes());
    mac.update(&digest);
    Ok(B64.encode(mac.finalize().into_bytes()))
}

pub struct KrakenClient {
    http: RetryClient,
    base_url: String,
    api_key: String,
    api_secret: String,
    last_nonce: AtomicI64,
}

impl KrakenClient {
    pub fn new(http: RetryClient, api_key: String, api_secret: String) -> Self {
        Self::with_base_url(http, API_URL, api_key, api_secret)
    }

    pub fn with_base_url(http: RetryClient, base_url: &str, api_key: String, api_secret: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            last_nonce: AtomicI64::new(0),
        }
    }

    // strictly increasing even within the same microsecond
    fn nonce(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = self.last_nonce.fetch_max(now, Ordering::SeqCst);
        if prev >= now { self.last_nonce.fetch_add(1, Ordering::SeqCst) + 1 } else { now }
    }

    async fn private<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
        ctx: &JobContext,
    ) -> anyhow::Result<T> {
        let secret = B64.decode(self.api_secret.trim()).context("kraken secret is not base64")?;
        let mut attempt = 0;
        loop {
            // nonce + signature per HTTP attempt: Kraken rejects a replayed nonce
            let build = || -> Result<reqwest::Request, HttpError> {
                let nonce = self.nonce().to_string();
                let post_data = std::iter::once(("nonce", nonce.clone()))
                    .chain(params.iter().map(|(k, v)| (*k, v.clone())))
                    .map(|(k, v)| format!("{}={}", k, urlencoding::encode(&v)))
                    .collect::<Vec<_>>()
                    .join("&");
                let signature = sign_with_key(&secret, path, &nonce, &post_data)
                    .map_err(|e| HttpError::Build(format!("kraken signature: {e}")))?;

                Ok(self
                    .http
                    .inner()
                    .post(format!("{}{}", self.base_url, path))
                    .header("API-Key", &self.api_key)
                    .header("API-Sign", signature)
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(post_data)
                    .build()?)
            };

            let bytes = self.http.execute_with(build, ctx.token()).await?;
            let env: Envelope<T> = serde_json::from_slice(&bytes).context("decode kraken response")?;

            if env.error.iter().any(|e| e.contains("Rate limit")) && attempt < RATE_LIMIT_RETRIES {
                attempt += 1;
                ctx.status(format!("rate limit hit (attempt {attempt}), waiting {}s", RATE_LIMIT_WAIT.as_secs()));
                warn!(%path, attempt, "kraken rate limit");
                tokio::select! {
                    _ = sleep(RATE_LIMIT_WAIT) => continue,
                    _ = ctx.cancelled() => bail!("cancelled"),
                }
            }
            if !env.error.is_empty() {
                bail!("kraken error: {:?}", env.error);
            }
            return env.result.context("kraken response without result");
        }
    }

    async fn trades_page(&self, offset: i64, start: Option<i64>, ctx: &JobContext) -> anyhow::Result<TradesHistory> {
        let mut params = vec![("ofs", offset.to_string())];
        if let Some(start) = start {
            params.push(("start", start.to_string()));
        }
        self.private("/0/private/TradesHistory", &params, ctx).await
    }
}

#[async_trait]
impl FillSource for KrakenClient {
    type Fill = KrakenTrade;

    fn label(&self) -> String { EXCHANGE.to_string() }

    async fn fetch_balances(&self, ctx: &JobContext) -> anyhow::Result<Vec<Balance>> {
        let raw: HashMap<String, String> = self.private("/0/private/Balance", &[], ctx).await?;
        ctx.status(format!("found {} raw balance entries", raw.len()));

        let mut totals: HashMap<String, f64> = HashMap::new();
        for (ticker, amount) in &raw {
            let amount: f64 = amount
                .trim()
                .parse()
                .with_context(|| format!("kraken balance {ticker}: {amount:?}"))?;
            *totals.entry(normalize_ticker(ticker)).or_default() += amount;
        }

        let mut out: Vec<Balance> = totals
            .into_iter()
            .map(|(ticker, amount)| Balance { exchange: EXCHANGE.to_string(), account: EXCHANGE.to_string(), ticker, amount })
            .collect();
        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(out)
    }

    async fn fetch_fills(&self, ctx: &JobContext, since_ms: Option<i64>) -> anyhow::Result<Vec<KrakenTrade>> {
        let start = since_ms.map(|ms| ms.div_euclid(1000));
        let mut out = Vec::new();
        let mut offset = 0;

        loop {
            if ctx.is_cancelled() {
                bail!("cancelled");
            }
            let page = self.trades_page(offset, start, ctx).await?;
            let n = page.trades.len() as i64;
            ctx.status(format!("fetched {n} trades at offset {offset} of {}", page.count));

            out.extend(page.trades.into_iter().map(|(txid, mut t)| {
                t.trade_id = txid;
                t
            }));
            offset += n;
            if n < PAGE_SIZE || offset >= page.count {
                break;
            }
        }

        if let Some(since) = since_ms {
            out.retain(|t| (t.time * 1000.0) as i64 >= since);
        }
        debug!(fills = out.len(), "kraken fills fetched");
        Ok(out)
    }
}
