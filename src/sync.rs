// ===============================
// src/sync.rs (one exchange sync pass)
// ===============================
//
// fetch fills -> aggregate -> canonical trades -> sort (time, id) -> book
// The book is owned by the single execution that loaded it.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::AHashMap as HashMap;
use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::aggregation::{aggregate_fills, AggregatedGroup, RawFill};
use crate::domain::{Balance, BookEntry, BookKey, Event, Trade};
use crate::ledger::{Book, LedgerError};
use crate::metrics::FILLS_AGGREGATED;
use crate::scheduler::{JobContext, JobRunner};

/// Raw fill type that knows how to become a canonical trade.
pub trait IntoCanonical: RawFill + Sized {
    const EXCHANGE: &'static str;

    fn into_trade(group: AggregatedGroup<Self>) -> Result<Trade, LedgerError>;
}

/// Aggregate and convert; the result is sorted by (time, trade_id).
pub fn canonicalize<T: IntoCanonical>(fills: Vec<T>) -> Result<Vec<Trade>, LedgerError> {
    FILLS_AGGREGATED.with_label_values(&[T::EXCHANGE]).inc_by(fills.len() as u64);

    let mut trades = aggregate_fills(fills)
        .into_values()
        .map(T::into_trade)
        .collect::<Result<Vec<_>, _>>()?;
    trades.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.trade_id.cmp(&b.trade_id)));
    Ok(trades)
}

/// Canonicalize then book every trade in order. A bad price aborts the whole
/// pass before anything is booked.
pub fn sync_pass<T: IntoCanonical>(fills: Vec<T>, book: &mut Book) -> Result<Vec<Trade>, LedgerError> {
    let trades = canonicalize(fills)?;
    Ok(trades.into_iter().map(|t| book.book_trade(t)).collect())
}

#[async_trait]
pub trait FillSource: Send + Sync + 'static {
    type Fill: IntoCanonical + Send + 'static;

    /// Wallet / account label used in status lines and balances.
    fn label(&self) -> String;

    async fn fetch_balances(&self, ctx: &JobContext) -> anyhow::Result<Vec<Balance>>;

    /// Fills at or after `since_ms`; everything when `None`.
    async fn fetch_fills(&self, ctx: &JobContext, since_ms: Option<i64>) -> anyhow::Result<Vec<Self::Fill>>;
}

/// Downstream store for trades, book entries and balances (upsert semantics).
#[async_trait]
pub trait TradeSink: Send + Sync + 'static {
    async fn latest_trade_time(&self, exchange: &str) -> anyhow::Result<Option<i64>>;
    async fn load_book(&self, exchange: &str) -> anyhow::Result<Vec<BookEntry>>;
    async fn upsert_trades(&self, trades: &[Trade]) -> anyhow::Result<()>;
    async fn upsert_book(&self, entries: &[BookEntry]) -> anyhow::Result<()>;
    async fn upsert_balances(&self, balances: &[Balance]) -> anyhow::Result<()>;
}

#[derive(Default)]
struct SinkState {
    trades: HashMap<(String, String), Trade>,
    book: HashMap<BookKey, BookEntry>,
    balances: HashMap<(String, String, String), Balance>,
}

/// In-process sink. Optionally mirrors every upsert to the JSONL recorder.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
    recorder: Option<mpsc::Sender<Event>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn with_recorder(recorder: mpsc::Sender<Event>) -> Self {
        Self { state: Mutex::default(), recorder: Some(recorder) }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(ev);
        }
    }

    pub fn trades(&self) -> Vec<Trade> {
        let mut out: Vec<Trade> = self.lock().trades.values().cloned().collect();
        out.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.trade_id.cmp(&b.trade_id)));
        out
    }

    pub fn book_entry(&self, key: &BookKey) -> Option<BookEntry> { self.lock().book.get(key).cloned() }

    pub fn balances(&self) -> Vec<Balance> { self.lock().balances.values().cloned().collect() }
}

#[async_trait]
impl TradeSink for MemorySink {
    async fn latest_trade_time(&self, exchange: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.lock().trades.values().filter(|t| t.exchange == exchange).map(|t| t.time).max())
    }

    async fn load_book(&self, exchange: &str) -> anyhow::Result<Vec<BookEntry>> {
        Ok(self.lock().book.values().filter(|e| e.exchange == exchange).cloned().collect())
    }

    async fn upsert_trades(&self, trades: &[Trade]) -> anyhow::Result<()> {
        {
            let mut st = self.lock();
            for t in trades {
                st.trades.insert((t.exchange.clone(), t.trade_id.clone()), t.clone());
            }
        }
        trades.iter().for_each(|t| self.record(Event::Trade(t.clone())));
        Ok(())
    }

    async fn upsert_book(&self, entries: &[BookEntry]) -> anyhow::Result<()> {
        {
            let mut st = self.lock();
            for e in entries {
                let key = BookKey { exchange: e.exchange.clone(), market: e.market, ticker: e.ticker.clone() };
                st.book.insert(key, e.clone());
            }
        }
        entries.iter().for_each(|e| self.record(Event::Book(e.clone())));
        Ok(())
    }

    async fn upsert_balances(&self, balances: &[Balance]) -> anyhow::Result<()> {
        {
            let mut st = self.lock();
            for b in balances {
                st.balances.insert((b.exchange.clone(), b.account.clone(), b.ticker.clone()), b.clone());
            }
        }
        balances.iter().for_each(|b| self.record(Event::Balance(b.clone())));
        Ok(())
    }
}

/// Work function for one exchange: per source, balances and trades run
/// concurrently and the first error fails the execution.
pub struct ExchangeSyncJob<S: FillSource> {
    sources: Vec<Arc<S>>,
    sink: Arc<dyn TradeSink>,
}

impl<S: FillSource> ExchangeSyncJob<S> {
    pub fn new(sources: Vec<Arc<S>>, sink: Arc<dyn TradeSink>) -> Self { Self { sources, sink } }

    async fn sync_balances(&self, src: &S, ctx: &JobContext) -> anyhow::Result<usize> {
        let label = src.label();
        ctx.status(format!("[{label}] fetching balances"));
        let balances = src
            .fetch_balances(ctx)
            .await
            .with_context(|| format!("update balances for {label}"))?;
        self.sink.upsert_balances(&balances).await?;
        ctx.status(format!("[{label}] {} balances synced", balances.len()));
        Ok(balances.len())
    }

    async fn sync_trades(&self, src: &S, ctx: &JobContext) -> anyhow::Result<usize> {
        let exchange = <S::Fill as IntoCanonical>::EXCHANGE;
        let label = src.label();

        ctx.status(format!("[{label}] checking latest stored trade"));
        let since = self.sink.latest_trade_time(exchange).await?.map(|t| t + 1);

        let fills = src
            .fetch_fills(ctx, since)
            .await
            .with_context(|| format!("update trades for {label}"))?;
        if fills.is_empty() {
            ctx.status(format!("[{label}] no new fills"));
            return Ok(0);
        }
        let n_fills = fills.len();

        ctx.status(format!("[{label}] loading trade book"));
        let mut book = Book::from_entries(self.sink.load_book(exchange).await?);

        ctx.status(format!("[{label}] booking {n_fills} fills"));
        let trades = sync_pass(fills, &mut book).with_context(|| format!("generate trades for {label}"))?;

        if ctx.is_cancelled() {
            bail!("cancelled before upsert");
        }
        ctx.status(format!("[{label}] upserting {} trades", trades.len()));
        self.sink.upsert_trades(&trades).await?;
        self.sink.upsert_book(&book.into_entries()).await?;

        info!(exchange, wallet = %label, fills = n_fills, trades = trades.len(), "trades synced");
        Ok(trades.len())
    }
}

#[async_trait]
impl<S: FillSource> JobRunner for ExchangeSyncJob<S> {
    async fn run(&self, ctx: JobContext, _args: &[String]) -> anyhow::Result<()> {
        if self.sources.is_empty() {
            ctx.status("no wallets configured");
            return Ok(());
        }

        let total = self.sources.len();
        for (i, src) in self.sources.iter().enumerate() {
            if ctx.is_cancelled() {
                bail!("cancelled");
            }
            ctx.status(format!("processing {}/{}: {}", i + 1, total, src.label()));
            let (balances, trades) =
                tokio::try_join!(self.sync_balances(src, &ctx), self.sync_trades(src, &ctx))?;
            ctx.status(format!("[{}] done: {balances} balances, {trades} trades", src.label()));
        }
        ctx.status(format!("all {total} sources synced"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, Market};
    use crate::exchange::hyperliquid::HyperliquidFill;
    use crate::exchange::kraken::KrakenTrade;
    use tokio_util::sync::CancellationToken;

    fn hl(tid: i64, time: i64, coin: &str, side: &str, px: &str, sz: &str) -> HyperliquidFill {
        HyperliquidFill {
            coin: coin.into(),
            closed_pnl: "0".into(),
            tid,
            time,
            fee: "0".into(),
            fee_token: "USDC".into(),
            sz: sz.into(),
            px: px.into(),
            side: side.into(),
        }
    }

    const MIN: i64 = 60_000;

    #[test]
    fn pass_sorts_then_books() {
        // listed out of order on purpose
        let fills = vec![
            hl(3, 3 * MIN, "BTC", "A", "120", "2"),
            hl(1, MIN, "BTC", "B", "100", "2"),
            hl(2, MIN + 10, "BTC", "B", "100", "1"),
        ];
        let mut book = Book::new();
        let trades = sync_pass(fills, &mut book).unwrap();

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade_id, "1");
        assert_eq!(trades[0].aggregated_trades, 2);
        assert_eq!(trades[1].direction, Direction::Sell);
        // bought 3 @ 100, sold 2 @ 120
        assert!((trades[1].pnl - 40.0).abs() < 1e-9);

        let key = BookKey { exchange: "Hyperliquid".into(), market: Market::Futures, ticker: "BTC".into() };
        let entry = book.get(&key).unwrap();
        assert!((entry.position_size - 1.0).abs() < 1e-12);
        assert!((entry.average_price - 100.0).abs() < 1e-12);
    }

    #[test]
    fn equal_times_order_by_trade_id() {
        let fills = vec![hl(9, MIN, "ETH", "B", "10", "1"), hl(5, MIN, "ETH", "A", "11", "1")];
        let trades = canonicalize(fills).unwrap();
        assert_eq!(trades.iter().map(|t| t.trade_id.as_str()).collect::<Vec<_>>(), vec!["5", "9"]);
    }

    #[test]
    fn bad_price_aborts_before_booking() {
        let fills = vec![hl(1, MIN, "BTC", "B", "100", "1"), hl(2, 2 * MIN, "BTC", "B", "oops", "1")];
        let mut book = Book::new();
        assert!(matches!(sync_pass(fills, &mut book), Err(LedgerError::InvalidPrice { .. })));
        assert!(book.is_empty());
    }

    #[test]
    fn kraken_pass_is_spot() {
        let fills = vec![KrakenTrade {
            trade_id: "TX1".into(),
            pair: "SOLUSD".into(),
            time: 1_700_000_000.0,
            side: "buy".into(),
            price: "20".into(),
            vol: "5".into(),
            fee: "0.1".into(),
            cost: "100".into(),
            ..Default::default()
        }];
        let mut book = Book::new();
        let trades = sync_pass(fills, &mut book).unwrap();
        assert_eq!(trades[0].market, Market::Spot);
        assert!((trades[0].order_value - 100.0).abs() < 1e-9);
        assert_eq!(book.len(), 1);
    }

    // ---- ExchangeSyncJob ----

    struct FakeSource {
        label: &'static str,
        fills: Vec<HyperliquidFill>,
        fail_balances: bool,
        seen_since: Mutex<Vec<Option<i64>>>,
    }

    impl FakeSource {
        fn new(label: &'static str, fills: Vec<HyperliquidFill>) -> Self {
            Self { label, fills, fail_balances: false, seen_since: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl FillSource for FakeSource {
        type Fill = HyperliquidFill;

        fn label(&self) -> String { self.label.to_string() }

        async fn fetch_balances(&self, _ctx: &JobContext) -> anyhow::Result<Vec<Balance>> {
            if self.fail_balances {
                bail!("balances endpoint down");
            }
            Ok(vec![Balance { exchange: "Hyperliquid".into(), account: self.label.into(), ticker: "USDC".into(), amount: 10.0 }])
        }

        async fn fetch_fills(&self, _ctx: &JobContext, since_ms: Option<i64>) -> anyhow::Result<Vec<HyperliquidFill>> {
            self.seen_since.lock().unwrap().push(since_ms);
            Ok(self.fills.iter().filter(|f| since_ms.map_or(true, |s| f.time >= s)).cloned().collect())
        }
    }

    #[tokio::test]
    async fn job_upserts_trades_book_and_balances() {
        let sink = Arc::new(MemorySink::new());
        let src = Arc::new(FakeSource::new("main", vec![hl(1, MIN, "BTC", "B", "100", "2"), hl(2, 2 * MIN, "BTC", "A", "110", "1")]));
        let job = ExchangeSyncJob::new(vec![src.clone()], sink.clone());

        job.run(JobContext::detached(), &[]).await.unwrap();
        assert_eq!(sink.trades().len(), 2);
        assert_eq!(sink.balances().len(), 1);
        let key = BookKey { exchange: "Hyperliquid".into(), market: Market::Futures, ticker: "BTC".into() };
        assert!((sink.book_entry(&key).unwrap().position_size - 1.0).abs() < 1e-12);

        // second run resumes after the latest stored trade and books nothing new
        job.run(JobContext::detached(), &[]).await.unwrap();
        assert_eq!(*src.seen_since.lock().unwrap(), vec![None, Some(2 * MIN + 1)]);
        assert_eq!(sink.trades().len(), 2);
        assert!((sink.book_entry(&key).unwrap().position_size - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn book_carries_over_between_runs() {
        let sink = Arc::new(MemorySink::new());
        let first = Arc::new(FakeSource::new("main", vec![hl(1, MIN, "ETH", "B", "100", "2")]));
        ExchangeSyncJob::new(vec![first], sink.clone()).run(JobContext::detached(), &[]).await.unwrap();

        let second = Arc::new(FakeSource::new("main", vec![hl(2, 5 * MIN, "ETH", "A", "150", "1")]));
        ExchangeSyncJob::new(vec![second], sink.clone()).run(JobContext::detached(), &[]).await.unwrap();

        let sell = sink.trades().into_iter().find(|t| t.trade_id == "2").unwrap();
        assert!((sell.pnl - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn balance_failure_fails_the_run() {
        let sink = Arc::new(MemorySink::new());
        let mut src = FakeSource::new("main", vec![]);
        src.fail_balances = true;
        let err = ExchangeSyncJob::new(vec![Arc::new(src)], sink)
            .run(JobContext::detached(), &[])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("balances endpoint down"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_work() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = JobContext::new(token, crate::scheduler::StatusReporter::noop());
        let sink = Arc::new(MemorySink::new());
        let job = ExchangeSyncJob::new(vec![Arc::new(FakeSource::new("main", vec![hl(1, MIN, "BTC", "B", "1", "1")]))], sink.clone());
        assert!(job.run(ctx, &[]).await.is_err());
        assert!(sink.trades().is_empty());
    }

    #[tokio::test]
    async fn no_sources_is_a_successful_noop() {
        let job: ExchangeSyncJob<FakeSource> = ExchangeSyncJob::new(vec![], Arc::new(MemorySink::new()));
        assert!(job.run(JobContext::detached(), &[]).await.is_ok());
    }

    #[tokio::test]
    async fn sink_mirrors_to_recorder() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = MemorySink::with_recorder(tx);
        sink.upsert_balances(&[Balance { exchange: "X".into(), account: "a".into(), ticker: "BTC".into(), amount: 1.0 }])
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Event::Balance(_))));
    }
}
