//! Warehouse stock ledger
//!
//! Per-warehouse stock counters, an append-only movement journal and the
//! transactional mutator that keeps both consistent under concurrent access.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod dto;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

pub use errors::{ErrorKind, LedgerResult, ServiceError};
pub use services::{
    LedgerSettings, ProductCatalog, SeaOrmProductCatalog, StockKey, StockService,
    WarehouseService,
};
