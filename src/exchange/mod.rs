// ===============================
// src/exchange/mod.rs
// ===============================
//
// Exchange adapters: raw fill record types (`RawFill` + `IntoCanonical`)
// and their REST clients (`FillSource`).
pub mod hyperliquid;
pub mod kraken;
