// ===============================
// src/aggregation.rs
// ===============================
//
// Fill aggregation: fills that share (asset, minute, direction, price) are
// economically the same trade at minute granularity, so they are merged into
// one record. Size/fee/cost are summed; the earliest fill keeps its identity
// (trade id + time) and becomes the canonical record.
//
// Each exchange record type plugs in by implementing `RawFill`.
use ahash::AHashMap as HashMap;

/// Number of significant digits kept when totals are written back as text.
const SIG_DIGITS: usize = 12;

/// A fill timestamp in whatever resolution the exchange reports.
pub trait FillTime: Copy {
    /// Common comparable: epoch milliseconds.
    fn epoch_millis(&self) -> i64;
}

/// Fractional epoch seconds (Kraken style).
impl FillTime for f64 {
    fn epoch_millis(&self) -> i64 { (*self * 1000.0) as i64 }
}

/// Epoch milliseconds (Hyperliquid style).
impl FillTime for i64 {
    fn epoch_millis(&self) -> i64 { *self }
}

/// Read/write access to one raw exchange fill. Numeric fields stay as the
/// exchange's decimal strings; aggregation parses them leniently.
pub trait RawFill {
    type Time: FillTime;
    type TradeId: Clone;

    fn asset(&self) -> &str;
    fn direction(&self) -> &str;
    fn price(&self) -> &str;
    fn size(&self) -> &str;
    fn fee(&self) -> &str;
    /// `None` for fee models without a cost concept.
    fn cost(&self) -> Option<&str> { None }
    fn time(&self) -> Self::Time;
    fn trade_id(&self) -> Self::TradeId;

    fn minute_bucket(&self) -> i64 { self.time().epoch_millis().div_euclid(60_000) }

    fn set_size(&mut self, size: String);
    fn set_fee(&mut self, fee: String);
    fn set_cost(&mut self, _cost: String) {}
    fn set_time(&mut self, time: Self::Time);
    fn set_trade_id(&mut self, id: Self::TradeId);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub asset: String,
    pub minute: i64,
    pub direction: String,
    pub price: String,
}

impl AggregationKey {
    fn of<T: RawFill>(fill: &T) -> Self {
        Self {
            asset: fill.asset().to_string(),
            minute: fill.minute_bucket(),
            direction: fill.direction().to_string(),
            price: fill.price().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatedGroup<T: RawFill> {
    /// Canonical record: the earliest fill, carrying the merged totals after
    /// `aggregate_fills` returns.
    pub fill: T,
    pub count: u32,
    pub size: f64,
    pub fee: f64,
    pub cost: f64,
    pub earliest_time: T::Time,
    pub earliest_trade_id: T::TradeId,
}

pub fn aggregate_fills<T, I>(fills: I) -> HashMap<AggregationKey, AggregatedGroup<T>>
where
    T: RawFill,
    I: IntoIterator<Item = T>,
{
    let mut groups: HashMap<AggregationKey, AggregatedGroup<T>> = HashMap::new();

    for fill in fills {
        let key = AggregationKey::of(&fill);
        let size = parse_decimal(fill.size());
        let fee = parse_decimal(fill.fee());
        let cost = fill.cost().map(parse_decimal).unwrap_or(0.0);

        match groups.get_mut(&key) {
            None => {
                let earliest_time = fill.time();
                let earliest_trade_id = fill.trade_id();
                groups.insert(
                    key,
                    AggregatedGroup { fill, count: 1, size, fee, cost, earliest_time, earliest_trade_id },
                );
            }
            Some(group) => {
                group.size += size;
                group.fee += fee;
                group.cost += cost;
                group.count += 1;

                let time = fill.time();
                if time.epoch_millis() < group.earliest_time.epoch_millis() {
                    group.earliest_time = time;
                    group.earliest_trade_id = fill.trade_id();
                    group.fill = fill;
                }
            }
        }
    }

    for group in groups.values_mut() {
        group.fill.set_size(format_decimal(group.size));
        group.fill.set_fee(format_decimal(group.fee));
        group.fill.set_cost(format_decimal(group.cost));
        group.fill.set_time(group.earliest_time);
        group.fill.set_trade_id(group.earliest_trade_id.clone());
    }

    groups
}

/// Lenient decimal parse: anything unparsable (or non-finite) counts as zero.
pub fn parse_decimal(s: &str) -> f64 {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Plain positional rendering with 12 significant digits, trailing zeros
/// trimmed. Never scientific notation.
pub fn format_decimal(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return "0".to_string();
    }

    let sci = format!("{:.*e}", SIG_DIGITS - 1, v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i64 = exp.parse().unwrap_or(0);
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.trim_end_matches('0');
    if digits.is_empty() {
        return "0".to_string();
    }

    // position of the decimal point, counted from the first digit
    let point = exp + 1;
    let mut out = String::with_capacity(digits.len() + 8);
    if negative {
        out.push('-');
    }
    if point <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take((-point) as usize));
        out.push_str(digits);
    } else if point as usize >= digits.len() {
        out.push_str(digits);
        out.extend(std::iter::repeat('0').take(point as usize - digits.len()));
    } else {
        let (int_part, frac_part) = digits.split_at(point as usize);
        out.push_str(int_part);
        out.push('.');
        out.push_str(frac_part);
    }
    out
}
