// ===============================
// src/ledger.rs (position book & realized PnL)
// ===============================
use ahash::AHashMap as HashMap;
use thiserror::Error;

use crate::domain::{BookEntry, BookKey, Direction, Market, Trade};
use crate::metrics::{BOOK_POSITION, TRADES_BOOKED};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("trade {trade_id}: unparsable price {value:?}")]
    InvalidPrice { trade_id: String, value: String },
    #[error("trade {trade_id}: unparsable size {value:?}")]
    InvalidSize { trade_id: String, value: String },
    #[error("trade {trade_id}: unknown direction {value:?}")]
    InvalidDirection { trade_id: String, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Position { size: f64, avg: f64, cost: f64 }

impl Position {
    fn of(entry: &BookEntry) -> Self {
        Self { size: entry.position_size, avg: entry.average_price, cost: entry.cost_basis }
    }

    fn flat() -> Self { Self::default() }

    /// Add to the current side, averaging the entry price.
    fn averaged(size: f64, cost: f64) -> Self {
        if size != 0.0 { Self { size, avg: cost / size, cost } } else { Self::flat() }
    }

    /// Shrink toward zero at the existing average.
    fn reduced(size: f64, avg: f64) -> Self {
        if size != 0.0 { Self { size, avg, cost: avg * size } } else { Self::flat() }
    }

    /// Fresh position opened at `price` (after a flip).
    fn opened(size: f64, price: f64) -> Self {
        if size != 0.0 { Self { size, avg: price, cost: price * size } } else { Self::flat() }
    }

    fn write(self, entry: &mut BookEntry) {
        entry.position_size = self.size;
        entry.average_price = self.avg;
        entry.cost_basis = self.cost;
    }
}

/// Apply one canonical trade to its book entry. Pure: returns the trade with
/// `pnl`/`order_value` filled in and the new entry.
pub fn update_book_entry(trade: Trade, entry: BookEntry) -> (Trade, BookEntry) {
    // zero-qty: nothing moves
    if trade.order_size == 0.0 {
        let mut trade = trade;
        trade.pnl = 0.0;
        trade.order_value = 0.0;
        return (trade, entry);
    }

    match trade.market {
        Market::Spot => update_spot(trade, entry),
        Market::Futures => update_futures(trade, entry),
    }
}

fn update_spot(mut trade: Trade, mut entry: BookEntry) -> (Trade, BookEntry) {
    let price = trade.price;
    let mut qty = trade.order_size;
    let pos = Position::of(&entry);
    let mut realized = 0.0;

    let mut next = match trade.direction {
        Direction::Buy => Position::averaged(pos.size + qty, pos.cost + price * qty),
        Direction::Sell => {
            // no shorts in spot: clamp to what is held
            qty = qty.min(pos.size);
            realized = (price - pos.avg) * qty;
            Position::reduced(pos.size - qty, pos.avg)
        }
    };

    if next.size < 0.0 {
        next = Position::flat();
    }

    next.write(&mut entry);
    trade.pnl = realized;
    trade.order_value = price * qty;
    (trade, entry)
}

fn update_futures(mut trade: Trade, mut entry: BookEntry) -> (Trade, BookEntry) {
    let price = trade.price;
    let qty = trade.order_size;
    let pos = Position::of(&entry);
    let mut realized = 0.0;

    let next = match trade.direction {
        Direction::Buy if pos.size < 0.0 => {
            if qty <= -pos.size {
                realized = (pos.avg - price) * qty;
                Position::reduced(pos.size + qty, pos.avg)
            } else {
                // flip short -> long
                realized = (pos.avg - price) * -pos.size;
                Position::opened(qty + pos.size, price)
            }
        }
        Direction::Buy => Position::averaged(pos.size + qty, pos.cost + price * qty),
        Direction::Sell if pos.size > 0.0 => {
            if qty <= pos.size {
                realized = (price - pos.avg) * qty;
                Position::reduced(pos.size - qty, pos.avg)
            } else {
                // flip long -> short
                realized = (price - pos.avg) * pos.size;
                Position::opened(-(qty - pos.size), price)
            }
        }
        Direction::Sell => Position::averaged(pos.size - qty, pos.cost - price * qty),
    };

    next.write(&mut entry);
    trade.pnl = realized;
    trade.order_value = price * qty;
    (trade, entry)
}

/// In-memory book for one sync pass. Entries are created lazily on the first
/// trade for their key.
#[derive(Debug, Clone, Default)]
pub struct Book {
    entries: HashMap<BookKey, BookEntry>,
}

impl Book {
    pub fn new() -> Self { Self::default() }

    pub fn from_entries(entries: impl IntoIterator<Item = BookEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| {
                let key = BookKey { exchange: e.exchange.clone(), market: e.market, ticker: e.ticker.clone() };
                (key, e)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &BookKey) -> Option<&BookEntry> { self.entries.get(key) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn entries(&self) -> impl Iterator<Item = &BookEntry> { self.entries.values() }

    pub fn into_entries(self) -> Vec<BookEntry> { self.entries.into_values().collect() }

    pub fn book_trade(&mut self, trade: Trade) -> Trade {
        let key = trade.book_key();
        let entry = self.entries.remove(&key).unwrap_or_else(|| BookEntry::empty(&key));
        let (trade, entry) = update_book_entry(trade, entry);

        let market = trade.market.to_string();
        TRADES_BOOKED.with_label_values(&[&trade.exchange, &market]).inc();
        BOOK_POSITION
            .with_label_values(&[&key.exchange, &market, &key.ticker])
            .set(entry.position_size);

        self.entries.insert(key, entry);
        trade
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn approx(a: f64, b: f64) -> bool { (a - b).abs() < EPS }

    fn trade(market: Market, direction: Direction, price: f64, size: f64) -> Trade {
        Trade {
            ticker: "BTC".into(),
            exchange: "Test".into(),
            market,
            direction,
            price,
            order_size: size,
            order_value: 0.0,
            fee: 0.0,
            fee_currency: "USDC".into(),
            fee_usd: 0.0,
            pnl: 0.0,
            trade_id: "1".into(),
            time: 0,
            aggregated_trades: 1,
        }
    }

    fn entry(market: Market, avg: f64, pos: f64, cost: f64) -> BookEntry {
        let mut e = BookEntry::empty(&BookKey { exchange: "Test".into(), market, ticker: "BTC".into() });
        e.average_price = avg;
        e.position_size = pos;
        e.cost_basis = cost;
        e
    }

    fn assert_entry(e: &BookEntry, pos: f64, avg: f64, cost: f64) {
        assert!(approx(e.position_size, pos), "pos {} != {}", e.position_size, pos);
        assert!(approx(e.average_price, avg), "avg {} != {}", e.average_price, avg);
        assert!(approx(e.cost_basis, cost), "cost {} != {}", e.cost_basis, cost);
    }

    // ---- spot ----

    #[test]
    fn spot_buy_from_flat() {
        let (t, e) = update_book_entry(trade(Market::Spot, Direction::Buy, 100.0, 10.0), entry(Market::Spot, 0.0, 0.0, 0.0));
        assert_entry(&e, 10.0, 100.0, 1000.0);
        assert_eq!(t.pnl, 0.0);
        assert!(approx(t.order_value, 1000.0));
    }

    #[test]
    fn spot_buys_average_up() {
        let (_, e) = update_book_entry(trade(Market::Spot, Direction::Buy, 110.0, 10.0), entry(Market::Spot, 100.0, 10.0, 1000.0));
        assert_entry(&e, 20.0, 105.0, 2100.0);
    }

    #[test]
    fn spot_partial_sell_keeps_average() {
        let (t, e) = update_book_entry(trade(Market::Spot, Direction::Sell, 150.0, 4.0), entry(Market::Spot, 100.0, 10.0, 1000.0));
        assert_entry(&e, 6.0, 100.0, 600.0);
        assert!(approx(t.pnl, 200.0));
        assert!(approx(t.order_value, 600.0));
    }

    #[test]
    fn spot_oversell_is_clamped() {
        let (t, e) = update_book_entry(trade(Market::Spot, Direction::Sell, 150.0, 15.0), entry(Market::Spot, 100.0, 10.0, 1000.0));
        assert_entry(&e, 0.0, 0.0, 0.0);
        assert!(approx(t.pnl, 500.0));
        assert!(approx(t.order_value, 1500.0));
    }

    #[test]
    fn spot_sell_from_flat_does_nothing() {
        let (t, e) = update_book_entry(trade(Market::Spot, Direction::Sell, 150.0, 5.0), entry(Market::Spot, 0.0, 0.0, 0.0));
        assert_entry(&e, 0.0, 0.0, 0.0);
        assert_eq!(t.pnl, 0.0);
        assert_eq!(t.order_value, 0.0);
    }

    #[test]
    fn spot_negative_position_is_reset() {
        // corrupted entry: spot can never hold a negative size
        let (_, e) = update_book_entry(trade(Market::Spot, Direction::Buy, 100.0, 2.0), entry(Market::Spot, 100.0, -5.0, -500.0));
        assert_entry(&e, 0.0, 0.0, 0.0);
    }

    #[test]
    fn spot_loss_is_negative_pnl() {
        let (t, _) = update_book_entry(trade(Market::Spot, Direction::Sell, 80.0, 10.0), entry(Market::Spot, 100.0, 10.0, 1000.0));
        assert!(approx(t.pnl, -200.0));
    }

    #[test]
    fn spot_round_trip_sequence() {
        let mut e = entry(Market::Spot, 0.0, 0.0, 0.0);
        let mut pnl = 0.0;
        for (dir, px, qty) in [
            (Direction::Buy, 100.0, 10.0),
            (Direction::Buy, 120.0, 10.0),
            (Direction::Sell, 130.0, 5.0),
            (Direction::Sell, 90.0, 15.0),
        ] {
            let (t, next) = update_book_entry(trade(Market::Spot, dir, px, qty), e);
            pnl += t.pnl;
            e = next;
        }
        assert_entry(&e, 0.0, 0.0, 0.0);
        // avg 110: +20*5 then -20*15
        assert!(approx(pnl, 100.0 - 300.0));
    }

    // ---- futures ----

    #[test]
    fn futures_open_short_from_flat() {
        let (_, e) = update_book_entry(trade(Market::Futures, Direction::Sell, 100.0, 10.0), entry(Market::Futures, 0.0, 0.0, 0.0));
        assert_entry(&e, -10.0, 100.0, -1000.0);
    }

    #[test]
    fn futures_add_to_short_averages() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Sell, 110.0, 10.0), entry(Market::Futures, 100.0, -10.0, -1000.0));
        assert_entry(&e, -20.0, 105.0, -2100.0);
        assert_eq!(t.pnl, 0.0);
    }

    #[test]
    fn futures_partial_long_close() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Sell, 150.0, 4.0), entry(Market::Futures, 100.0, 10.0, 1000.0));
        assert_entry(&e, 6.0, 100.0, 600.0);
        assert!(approx(t.pnl, 200.0));
    }

    #[test]
    fn futures_long_flips_to_short() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Sell, 150.0, 15.0), entry(Market::Futures, 100.0, 10.0, 1000.0));
        assert_entry(&e, -5.0, 150.0, -750.0);
        assert!(approx(t.pnl, 500.0));
        assert!(approx(t.order_value, 2250.0));
    }

    #[test]
    fn futures_short_flips_to_long() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Buy, 80.0, 15.0), entry(Market::Futures, 100.0, -10.0, -1000.0));
        assert_entry(&e, 5.0, 80.0, 400.0);
        assert!(approx(t.pnl, 200.0));
        assert!(approx(t.order_value, 1200.0));
    }

    #[test]
    fn futures_partial_short_cover() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Buy, 90.0, 4.0), entry(Market::Futures, 100.0, -10.0, -1000.0));
        assert_entry(&e, -6.0, 100.0, -600.0);
        assert!(approx(t.pnl, 40.0));
    }

    #[test]
    fn futures_exact_close_zeroes_average() {
        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Sell, 120.0, 5.0), entry(Market::Futures, 100.0, 5.0, 500.0));
        assert_entry(&e, 0.0, 0.0, 0.0);
        assert!(approx(t.pnl, 100.0));

        let (t, e) = update_book_entry(trade(Market::Futures, Direction::Buy, 120.0, 5.0), entry(Market::Futures, 100.0, -5.0, -500.0));
        assert_entry(&e, 0.0, 0.0, 0.0);
        assert!(approx(t.pnl, -100.0));
    }

    #[test]
    fn futures_stale_average_on_flat_entry() {
        let (_, e) = update_book_entry(trade(Market::Futures, Direction::Buy, 150.0, 5.0), entry(Market::Futures, 100.0, 0.0, 0.0));
        assert_entry(&e, 5.0, 150.0, 750.0);
    }

    #[test]
    fn futures_multiple_flips() {
        let mut e = entry(Market::Futures, 0.0, 0.0, 0.0);
        let mut pnl = 0.0;
        for (dir, px, qty) in [
            (Direction::Buy, 100.0, 10.0),
            (Direction::Sell, 110.0, 15.0),
            (Direction::Buy, 105.0, 10.0),
        ] {
            let (t, next) = update_book_entry(trade(Market::Futures, dir, px, qty), e);
            pnl += t.pnl;
            e = next;
        }
        assert_entry(&e, 5.0, 105.0, 525.0);
        // +10*10 on the long, +5*5 on the short
        assert!(approx(pnl, 125.0));
    }

    #[test]
    fn zero_quantity_is_a_no_op() {
        for market in [Market::Spot, Market::Futures] {
            for dir in [Direction::Buy, Direction::Sell] {
                for (avg, pos, cost) in [(100.0, 10.0, 1000.0), (100.0, -10.0, -1000.0), (0.0, 0.0, 0.0), (33.3, 3.0, 99.9)] {
                    let before = entry(market, avg, pos, cost);
                    let (t, after) = update_book_entry(trade(market, dir, 123.0, 0.0), before.clone());
                    assert_eq!(after, before);
                    assert_eq!(t.order_value, 0.0);
                    assert_eq!(t.pnl, 0.0);
                }
            }
        }
    }

    #[test]
    fn futures_cost_basis_tracks_average() {
        let mut e = entry(Market::Futures, 0.0, 0.0, 0.0);
        for (dir, px, qty) in [
            (Direction::Buy, 100.0, 3.0),
            (Direction::Buy, 103.0, 2.0),
            (Direction::Sell, 99.0, 7.0),
            (Direction::Sell, 97.0, 1.5),
            (Direction::Buy, 101.0, 0.5),
        ] {
            e = update_book_entry(trade(Market::Futures, dir, px, qty), e).1;
            assert!((e.cost_basis - e.average_price * e.position_size).abs() < 1e-6);
        }
    }

    #[test]
    fn book_creates_entries_lazily_per_key() {
        let mut book = Book::new();
        assert!(book.is_empty());

        book.book_trade(trade(Market::Spot, Direction::Buy, 100.0, 1.0));
        book.book_trade(trade(Market::Futures, Direction::Sell, 100.0, 2.0));
        let t = book.book_trade(trade(Market::Spot, Direction::Sell, 120.0, 1.0));

        assert_eq!(book.len(), 2);
        assert!(approx(t.pnl, 20.0));
        let spot = book.get(&BookKey { exchange: "Test".into(), market: Market::Spot, ticker: "BTC".into() }).unwrap();
        assert_entry(spot, 0.0, 0.0, 0.0);
        let fut = book.get(&BookKey { exchange: "Test".into(), market: Market::Futures, ticker: "BTC".into() }).unwrap();
        assert_entry(fut, -2.0, 100.0, -200.0);
    }

    #[test]
    fn book_resumes_from_loaded_entries() {
        let mut book = Book::from_entries(vec![entry(Market::Spot, 100.0, 10.0, 1000.0)]);
        let t = book.book_trade(trade(Market::Spot, Direction::Sell, 150.0, 15.0));
        assert!(approx(t.pnl, 500.0));
        assert_eq!(book.len(), 1);
    }
}
