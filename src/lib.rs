//! Order reconciliation and batch synchronization engine for a parts desk:
//! mirrors open orders from the remote shop into SQLite, merges them with the
//! locally-owned pick/order/dispatch progress ledger and the stock extract,
//! and verifies sync completeness by count reconciliation.

pub mod audit;
pub mod config;
pub mod db;
pub mod merge;
pub mod model;
pub mod shopify;
pub mod stock;
pub mod sync;
pub mod verify;
