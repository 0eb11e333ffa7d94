// ===============================
// src/token.rs
// ===============================

/// Stablecoin / fiat check used for fee-in-USD.
pub fn is_stablecoin(ticker: &str) -> bool {
    let t = ticker.trim().to_ascii_uppercase();
    matches!(t.as_str(), "DAI" | "EUR" | "USX" | "ZEUR" | "ZUSD") || t.contains("USD")
}

/// Fee converted to USD: as-is for stable fee currencies, else at trade price.
pub fn fee_usd(fee: f64, fee_currency: &str, price: f64) -> f64 {
    if is_stablecoin(fee_currency) { fee } else { fee * price }
}
