// Product catalog seam consumed by the ledger
pub mod catalog;

// Stock ledger: mutations and reporting queries
pub mod stock;

// Warehouse directory
pub mod warehouses;

pub use catalog::{ProductCatalog, SeaOrmProductCatalog};
pub use stock::{lock_order, LedgerSettings, StockKey, StockService};
pub use warehouses::WarehouseService;
