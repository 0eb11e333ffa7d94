// ===============================
// src/lib.rs
// ===============================
//
// Library surface: scheduler + registry control API, fill aggregation,
// position ledger, exchange adapters. `main.rs` only wires these together.
pub mod aggregation;
pub mod config;
pub mod domain;
pub mod exchange;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod mock;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod token;
