#![allow(dead_code)]

use std::sync::Arc;

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use warehouse_ledger::{
    db::{self, DbConfig, DbPool},
    dto::{AdjustStockRequest, CreateWarehouseRequest, RegisterProductRequest},
    entities::{
        stock_movement, Product, ProductModel, StockMovement, StockMovementModel,
        StockRecordModel, WarehouseModel,
    },
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::{SeaOrmProductCatalog, StockService, WarehouseService},
};

/// Postgres database used by the row-locking tests when set.
pub const PG_URL_VAR: &str = "LEDGER_TEST_PG_URL";

static PG_MIGRATED: Mutex<bool> = Mutex::const_new(false);

/// Ledger services wired to a test database.
///
/// The default is a private in-memory SQLite database whose pool holds a
/// single connection, so transactions run one at a time and concurrent
/// callers queue on connection acquisition. [`TestLedger::postgres`]
/// connects to a shared Postgres database with a real pool instead.
pub struct TestLedger {
    pub db: Arc<DbPool>,
    pub stock: StockService,
    pub warehouses: WarehouseService,
    pub catalog: SeaOrmProductCatalog,
    pub actor: Uuid,
    events: Option<mpsc::Receiver<Event>>,
}

impl TestLedger {
    /// Events are drained by a background logger.
    pub async fn new() -> Self {
        let (sender, rx) = EventSender::channel(1024);
        tokio::spawn(events::process_events(rx));
        Self::build(sender, None).await
    }

    /// Events are kept for inspection with [`TestLedger::take_events`].
    pub async fn with_event_capture() -> Self {
        let (sender, rx) = EventSender::channel(256);
        Self::build(sender, Some(rx)).await
    }

    /// Connects to the database named by `LEDGER_TEST_PG_URL`, or returns
    /// `None` when it is unset. The database is shared between tests and
    /// runs, so callers must use unique codes and SKUs (see [`unique`]).
    pub async fn postgres() -> Option<Self> {
        let url = std::env::var(PG_URL_VAR).ok()?;
        let config = DbConfig {
            url,
            max_connections: 16,
            min_connections: 1,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to connect to test postgres");

        let mut migrated = PG_MIGRATED.lock().await;
        if !*migrated {
            db::run_migrations(&pool)
                .await
                .expect("failed to run migrations in tests");
            *migrated = true;
        }
        drop(migrated);

        let (sender, rx) = EventSender::channel(1024);
        tokio::spawn(events::process_events(rx));
        Some(Self::with_pool(pool, sender, None))
    }

    async fn build(sender: EventSender, events: Option<mpsc::Receiver<Event>>) -> Self {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        Self::with_pool(pool, sender, events)
    }

    fn with_pool(
        pool: DbPool,
        sender: EventSender,
        events: Option<mpsc::Receiver<Event>>,
    ) -> Self {
        let db = Arc::new(pool);
        let catalog = SeaOrmProductCatalog::new(db.clone());
        let stock = StockService::new(db.clone(), Arc::new(catalog.clone()))
            .with_event_sender(sender.clone());
        let warehouses = WarehouseService::new(db.clone()).with_event_sender(sender);

        Self {
            db,
            stock,
            warehouses,
            catalog,
            actor: Uuid::new_v4(),
            events,
        }
    }

    pub async fn warehouse(&self, code: &str) -> WarehouseModel {
        self.warehouses
            .create(warehouse_request(code))
            .await
            .expect("create warehouse")
    }

    pub async fn product(&self, sku: &str) -> ProductModel {
        self.catalog
            .register(RegisterProductRequest {
                sku: sku.to_string(),
                name: format!("Product {sku}"),
                slug: None,
            })
            .await
            .expect("register product")
    }

    pub async fn adjust(
        &self,
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<StockRecordModel, ServiceError> {
        self.stock
            .adjust_stock(
                AdjustStockRequest {
                    warehouse_id,
                    product_id,
                    quantity,
                    reason: "Cycle count".to_string(),
                    notes: None,
                },
                self.actor,
            )
            .await
    }

    /// Seeds a record at `quantity` through a regular adjustment.
    pub async fn seed(&self, warehouse_id: Uuid, product_id: Uuid, quantity: i32) {
        self.adjust(warehouse_id, product_id, quantity)
            .await
            .expect("seed stock");
    }

    pub async fn movements_for(&self, warehouse_id: Uuid, product_id: Uuid) -> Vec<StockMovementModel> {
        StockMovement::find()
            .filter(stock_movement::Column::WarehouseId.eq(warehouse_id))
            .filter(stock_movement::Column::ProductId.eq(product_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(self.db.as_ref())
            .await
            .expect("load movements")
    }

    pub async fn all_movements(&self) -> Vec<StockMovementModel> {
        StockMovement::find()
            .all(self.db.as_ref())
            .await
            .expect("load movements")
    }

    pub async fn quantity(&self, warehouse_id: Uuid, product_id: Uuid) -> i32 {
        self.stock
            .get_product_stock(warehouse_id, product_id)
            .await
            .map(|level| level.record.quantity)
            .unwrap_or(0)
    }

    /// Cached total written back to the products table.
    pub async fn product_total(&self, product_id: Uuid) -> i64 {
        Product::find_by_id(product_id)
            .one(self.db.as_ref())
            .await
            .expect("load product")
            .expect("product exists")
            .stock_quantity
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        let mut taken = Vec::new();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                taken.push(event);
            }
        }
        taken
    }
}

/// `prefix` plus a random suffix, short enough for warehouse codes.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..12])
}

pub fn warehouse_request(code: &str) -> CreateWarehouseRequest {
    CreateWarehouseRequest {
        name: format!("Warehouse {code}"),
        code: code.to_string(),
        country: "US".to_string(),
        city: "Austin".to_string(),
        address: None,
        phone: None,
        email: None,
        is_active: None,
        is_default: None,
    }
}
