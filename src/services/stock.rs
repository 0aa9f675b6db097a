use chrono::Utc;
use metrics::{counter, histogram};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{catalog::ProductCatalog, warehouses::WarehouseService};
use crate::{
    config::AppConfig,
    db::{begin_transaction, DbPool},
    dto::{
        AdjustStockRequest, DeductForSaleRequest, MovementEntry, MovementQuery, Paginated,
        ProductSummary, ReceiveStockRequest, RestoreForCancellationRequest, StockAlerts,
        StockLevel, StockLevelQuery, TransferLeg, TransferResult, TransferStockRequest,
        WarehouseSummary,
    },
    entities::{
        stock_movement, stock_record, warehouse, MovementDirection, MovementType, ReferenceType,
        StockMovement, StockRecord, StockRecordModel, Warehouse,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

const RECEIVE_REASON: &str = "Purchase order received";
const SALE_REASON: &str = "Order sale";
const RESTORE_REASON: &str = "Order cancellation - stock restored";

/// Identity of a stock record. Ordering defines the lock acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StockKey {
    pub warehouse_id: Uuid,
    pub product_id: Uuid,
}

impl StockKey {
    pub fn new(warehouse_id: Uuid, product_id: Uuid) -> Self {
        Self {
            warehouse_id,
            product_id,
        }
    }
}

/// Orders two keys ascending so concurrent transfers between the same pair
/// of warehouses always lock in the same sequence.
pub fn lock_order(a: StockKey, b: StockKey) -> [StockKey; 2] {
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Threshold given to records the ledger creates on demand.
    pub low_stock_threshold: i32,
    pub statement_timeout: Option<Duration>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            low_stock_threshold: 10,
            statement_timeout: None,
        }
    }
}

impl From<&AppConfig> for LedgerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            low_stock_threshold: cfg.default_low_stock_threshold,
            statement_timeout: cfg.statement_timeout(),
        }
    }
}

/// One journal line waiting to be written.
struct MovementDraft {
    key: StockKey,
    movement_type: MovementType,
    direction: MovementDirection,
    quantity: i32,
    reference_type: ReferenceType,
    reference_id: Option<Uuid>,
    reason: String,
    notes: Option<String>,
    performed_by: Uuid,
}

/// The warehouse stock ledger.
///
/// Every mutation runs in one transaction: existence checks, the locked read
/// of each touched record, the counter write, the movement journal entries
/// and the product total write-back either all commit or none do.
#[derive(Clone)]
pub struct StockService {
    db_pool: Arc<DbPool>,
    catalog: Arc<dyn ProductCatalog>,
    event_sender: Option<EventSender>,
    settings: LedgerSettings,
}

impl StockService {
    pub fn new(db_pool: Arc<DbPool>, catalog: Arc<dyn ProductCatalog>) -> Self {
        Self {
            db_pool,
            catalog,
            event_sender: None,
            settings: LedgerSettings::default(),
        }
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_settings(mut self, settings: LedgerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Applies a signed manual correction to one stock record.
    #[instrument(skip(self, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id, delta = request.quantity))]
    pub async fn adjust_stock(
        &self,
        request: AdjustStockRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("adjust", &request)?;

        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let outcome = self.apply_adjustment(&txn, &request, performed_by).await;
        let (record, old_quantity) = finish("adjust", started, txn, outcome).await?;

        info!(old_quantity, new_quantity = record.quantity, "stock adjusted");
        self.publish(Event::StockAdjusted {
            warehouse_id: record.warehouse_id,
            product_id: record.product_id,
            old_quantity,
            new_quantity: record.quantity,
            reason: request.reason.trim().to_string(),
            performed_by,
        });
        self.publish_alerts(&record);
        Ok(record)
    }

    /// Moves stock between two warehouses as one paired out/in movement.
    /// The product total is conserved, so it is not rewritten.
    #[instrument(skip(self, request), fields(source = %request.source_warehouse_id, destination = %request.destination_warehouse_id, product_id = %request.product_id, quantity = request.quantity))]
    pub async fn transfer_stock(
        &self,
        request: TransferStockRequest,
        performed_by: Uuid,
    ) -> Result<TransferResult, ServiceError> {
        let started = Instant::now();
        validated("transfer", &request)?;

        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let outcome = self.apply_transfer(&txn, &request, performed_by).await;
        let (result, source, destination) = finish("transfer", started, txn, outcome).await?;

        info!(transfer_id = %result.transfer_id, "stock transferred");
        self.publish(Event::StockTransferred {
            transfer_id: result.transfer_id,
            source_warehouse_id: request.source_warehouse_id,
            destination_warehouse_id: request.destination_warehouse_id,
            product_id: request.product_id,
            quantity: request.quantity,
            performed_by,
        });
        self.publish_alerts(&source);
        self.publish_alerts(&destination);
        Ok(result)
    }

    /// Books a purchase order receipt.
    #[instrument(skip(self, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id, quantity = request.quantity))]
    pub async fn receive_stock(
        &self,
        request: ReceiveStockRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("receive", &request)?;

        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let outcome = self.apply_receipt(&txn, &request, performed_by).await;
        let record = finish("receive", started, txn, outcome).await?;

        info!(new_quantity = record.quantity, "purchase order received");
        self.publish(Event::StockReceived {
            warehouse_id: request.warehouse_id,
            product_id: request.product_id,
            quantity: request.quantity,
            purchase_order_id: request.purchase_order_id,
        });
        self.publish_alerts(&record);
        Ok(record)
    }

    /// Same as [`receive_stock`](Self::receive_stock) inside a caller-owned
    /// transaction. Nothing is published; the caller owns the commit.
    #[instrument(skip(self, txn, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id))]
    pub async fn receive_stock_in(
        &self,
        txn: &DatabaseTransaction,
        request: ReceiveStockRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("receive", &request)?;
        let outcome = self.apply_receipt(txn, &request, performed_by).await;
        record_outcome("receive", started, &outcome);
        outcome
    }

    /// Removes sold units. Fails when the record is missing or short.
    #[instrument(skip(self, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id, quantity = request.quantity))]
    pub async fn deduct_for_sale(
        &self,
        request: DeductForSaleRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("deduct", &request)?;

        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let outcome = self.apply_sale(&txn, &request, performed_by).await;
        let record = finish("deduct", started, txn, outcome).await?;

        info!(new_quantity = record.quantity, "stock deducted for sale");
        self.publish(Event::StockDeducted {
            warehouse_id: request.warehouse_id,
            product_id: request.product_id,
            quantity: request.quantity,
            order_id: request.order_id,
        });
        self.publish_alerts(&record);
        Ok(record)
    }

    #[instrument(skip(self, txn, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id))]
    pub async fn deduct_for_sale_in(
        &self,
        txn: &DatabaseTransaction,
        request: DeductForSaleRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("deduct", &request)?;
        let outcome = self.apply_sale(txn, &request, performed_by).await;
        record_outcome("deduct", started, &outcome);
        outcome
    }

    /// Puts back units from a cancelled order. Does not count as a restock.
    #[instrument(skip(self, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id, quantity = request.quantity))]
    pub async fn restore_for_cancellation(
        &self,
        request: RestoreForCancellationRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("restore", &request)?;

        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let outcome = self.apply_restore(&txn, &request, performed_by).await;
        let record = finish("restore", started, txn, outcome).await?;

        info!(new_quantity = record.quantity, "stock restored after cancellation");
        self.publish(Event::StockRestored {
            warehouse_id: request.warehouse_id,
            product_id: request.product_id,
            quantity: request.quantity,
            order_id: request.order_id,
        });
        self.publish_alerts(&record);
        Ok(record)
    }

    #[instrument(skip(self, txn, request), fields(warehouse_id = %request.warehouse_id, product_id = %request.product_id))]
    pub async fn restore_for_cancellation_in(
        &self,
        txn: &DatabaseTransaction,
        request: RestoreForCancellationRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let started = Instant::now();
        validated("restore", &request)?;
        let outcome = self.apply_restore(txn, &request, performed_by).await;
        record_outcome("restore", started, &outcome);
        outcome
    }

    /// Pages through stock records, most recently updated first.
    #[instrument(skip(self))]
    pub async fn get_stock_levels(
        &self,
        query: StockLevelQuery,
    ) -> Result<Paginated<StockLevel>, ServiceError> {
        query.validate()?;
        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;

        let mut select = StockRecord::find();
        if let Some(warehouse_id) = query.warehouse_id {
            select = select.filter(stock_record::Column::WarehouseId.eq(warehouse_id));
        }
        if let Some(product_id) = query.product_id {
            select = select.filter(stock_record::Column::ProductId.eq(product_id));
        }
        if query.out_of_stock {
            select = select.filter(stock_record::Column::Quantity.eq(0));
        } else if query.low_stock {
            select = low_stock_filter(select);
        }

        let paginator = select
            .order_by_desc(stock_record::Column::UpdatedAt)
            .order_by_asc(stock_record::Column::Id)
            .paginate(&txn, u64::from(query.limit));
        let total = paginator.num_items().await?;
        let records = paginator.fetch_page(u64::from(query.page - 1)).await?;
        let data = self.join_levels(&txn, records).await?;
        txn.commit().await?;

        Ok(Paginated::new(data, total, query.page, query.limit))
    }

    #[instrument(skip(self))]
    pub async fn get_product_stock(
        &self,
        warehouse_id: Uuid,
        product_id: Uuid,
    ) -> Result<StockLevel, ServiceError> {
        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;
        let record = find_record(&txn, StockKey::new(warehouse_id, product_id))
            .await?
            .ok_or_else(|| {
                ServiceError::not_found(
                    "Stock record not found for this warehouse/product combination",
                )
            })?;
        let mut levels = self.join_levels(&txn, vec![record]).await?;
        txn.commit().await?;

        levels
            .pop()
            .ok_or_else(|| ServiceError::InternalError("stock level join lost a record".into()))
    }

    /// Pages through the movement journal, newest first.
    #[instrument(skip(self))]
    pub async fn get_movements(
        &self,
        query: MovementQuery,
    ) -> Result<Paginated<MovementEntry>, ServiceError> {
        query.validate()?;
        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;

        let mut select = StockMovement::find();
        if let Some(warehouse_id) = query.warehouse_id {
            select = select.filter(stock_movement::Column::WarehouseId.eq(warehouse_id));
        }
        if let Some(product_id) = query.product_id {
            select = select.filter(stock_movement::Column::ProductId.eq(product_id));
        }
        if let Some(movement_type) = query.movement_type {
            select = select.filter(stock_movement::Column::MovementType.eq(movement_type));
        }
        if let Some(reference_type) = query.reference_type {
            select = select.filter(stock_movement::Column::ReferenceType.eq(reference_type));
        }
        if let Some(start) = query.start_date {
            select = select.filter(stock_movement::Column::CreatedAt.gte(start));
        }
        if let Some(end) = query.end_date {
            select = select.filter(stock_movement::Column::CreatedAt.lte(end));
        }

        let paginator = select
            .order_by_desc(stock_movement::Column::CreatedAt)
            .order_by_asc(stock_movement::Column::Id)
            .paginate(&txn, u64::from(query.limit));
        let total = paginator.num_items().await?;
        let movements = paginator.fetch_page(u64::from(query.page - 1)).await?;

        let warehouse_ids: Vec<Uuid> = movements.iter().map(|m| m.warehouse_id).collect();
        let product_ids: Vec<Uuid> = movements.iter().map(|m| m.product_id).collect();
        let warehouses = warehouse_summaries(&txn, &warehouse_ids).await?;
        let products = self.product_summaries(&txn, &product_ids).await?;
        txn.commit().await?;

        let data = movements
            .into_iter()
            .map(|movement| MovementEntry {
                warehouse: warehouses.get(&movement.warehouse_id).cloned(),
                product: products.get(&movement.product_id).cloned(),
                movement,
            })
            .collect();
        Ok(Paginated::new(data, total, query.page, query.limit))
    }

    /// Low-stock records ascending by quantity plus every depleted record.
    #[instrument(skip(self))]
    pub async fn get_alerts(&self) -> Result<StockAlerts, ServiceError> {
        let txn = begin_transaction(&self.db_pool, self.settings.statement_timeout).await?;

        let low = low_stock_filter(StockRecord::find())
            .order_by_asc(stock_record::Column::Quantity)
            .order_by_asc(stock_record::Column::Id)
            .all(&txn)
            .await?;
        let depleted = StockRecord::find()
            .filter(stock_record::Column::Quantity.eq(0))
            .order_by_desc(stock_record::Column::UpdatedAt)
            .order_by_asc(stock_record::Column::Id)
            .all(&txn)
            .await?;

        let low_stock = self.join_levels(&txn, low).await?;
        let out_of_stock = self.join_levels(&txn, depleted).await?;
        txn.commit().await?;

        Ok(StockAlerts {
            low_stock,
            out_of_stock,
        })
    }

    async fn apply_adjustment(
        &self,
        txn: &DatabaseTransaction,
        request: &AdjustStockRequest,
        performed_by: Uuid,
    ) -> Result<(StockRecordModel, i32), ServiceError> {
        let key = StockKey::new(request.warehouse_id, request.product_id);
        self.ensure_targets(txn, key).await?;

        let delta = request.quantity;
        let record = match find_record_for_update(txn, key).await? {
            Some(record) => record,
            None if delta < 0 => {
                return Err(ServiceError::InvalidAdjustment(
                    "Cannot adjust stock below zero for a new stock record".to_string(),
                ))
            }
            None => self.create_record(txn, key).await?,
        };

        let old_quantity = record.quantity;
        let new_quantity = checked_quantity(old_quantity, delta)?;
        if new_quantity < 0 {
            return Err(insufficient(key, old_quantity, delta.unsigned_abs()));
        }

        let updated = write_quantity(txn, record, new_quantity, delta > 0).await?;
        append_movement(
            txn,
            MovementDraft {
                key,
                movement_type: MovementType::Adjustment,
                direction: if delta > 0 {
                    MovementDirection::In
                } else {
                    MovementDirection::Out
                },
                quantity: magnitude(delta)?,
                reference_type: ReferenceType::Adjustment,
                reference_id: None,
                reason: request.reason.trim().to_string(),
                notes: request.notes.clone(),
                performed_by,
            },
        )
        .await?;
        self.sync_product_total(txn, key.product_id).await?;

        Ok((updated, old_quantity))
    }

    async fn apply_transfer(
        &self,
        txn: &DatabaseTransaction,
        request: &TransferStockRequest,
        performed_by: Uuid,
    ) -> Result<(TransferResult, StockRecordModel, StockRecordModel), ServiceError> {
        if request.source_warehouse_id == request.destination_warehouse_id {
            return Err(ServiceError::InvalidTransfer(
                "Source and destination warehouses must be different".to_string(),
            ));
        }
        if !WarehouseService::exists(txn, request.source_warehouse_id).await? {
            return Err(ServiceError::not_found("Source warehouse not found"));
        }
        if !WarehouseService::exists(txn, request.destination_warehouse_id).await? {
            return Err(ServiceError::not_found("Destination warehouse not found"));
        }
        if !self.catalog.product_exists(txn, request.product_id).await? {
            return Err(ServiceError::not_found("Product not found"));
        }

        let source_key = StockKey::new(request.source_warehouse_id, request.product_id);
        let destination_key = StockKey::new(request.destination_warehouse_id, request.product_id);
        let quantity = request.quantity;

        let mut source = None;
        let mut destination = None;
        for key in lock_order(source_key, destination_key) {
            if key == source_key {
                let record = find_record_for_update(txn, key).await?;
                let available = record.as_ref().map_or(0, |r| r.quantity);
                if available < quantity {
                    return Err(insufficient(key, available, quantity.unsigned_abs()));
                }
                source = record;
            } else {
                destination = Some(self.create_record(txn, key).await?);
            }
        }
        let (source, destination) = match (source, destination) {
            (Some(source), Some(destination)) => (source, destination),
            _ => {
                return Err(ServiceError::InternalError(
                    "transfer did not lock both stock records".into(),
                ))
            }
        };

        let source_quantity = checked_quantity(source.quantity, -quantity)?;
        let destination_quantity = checked_quantity(destination.quantity, quantity)?;
        let source = write_quantity(txn, source, source_quantity, false).await?;
        let destination = write_quantity(txn, destination, destination_quantity, true).await?;

        let transfer_id = Uuid::new_v4();
        let reason = request.reason.trim().to_string();
        for (key, movement_type, direction) in [
            (source_key, MovementType::TransferOut, MovementDirection::Out),
            (destination_key, MovementType::TransferIn, MovementDirection::In),
        ] {
            append_movement(
                txn,
                MovementDraft {
                    key,
                    movement_type,
                    direction,
                    quantity,
                    reference_type: ReferenceType::Transfer,
                    reference_id: Some(transfer_id),
                    reason: reason.clone(),
                    notes: request.notes.clone(),
                    performed_by,
                },
            )
            .await?;
        }

        let result = TransferResult {
            transfer_id,
            source: TransferLeg {
                warehouse_id: source.warehouse_id,
                new_quantity: source.quantity,
            },
            destination: TransferLeg {
                warehouse_id: destination.warehouse_id,
                new_quantity: destination.quantity,
            },
        };
        Ok((result, source, destination))
    }

    async fn apply_receipt(
        &self,
        txn: &DatabaseTransaction,
        request: &ReceiveStockRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let key = StockKey::new(request.warehouse_id, request.product_id);
        self.ensure_targets(txn, key).await?;

        let record = self.create_record(txn, key).await?;
        let new_quantity = checked_quantity(record.quantity, request.quantity)?;
        let updated = write_quantity(txn, record, new_quantity, true).await?;
        append_movement(
            txn,
            MovementDraft {
                key,
                movement_type: MovementType::PurchaseOrderReceived,
                direction: MovementDirection::In,
                quantity: request.quantity,
                reference_type: ReferenceType::PurchaseOrder,
                reference_id: Some(request.purchase_order_id),
                reason: RECEIVE_REASON.to_string(),
                notes: None,
                performed_by,
            },
        )
        .await?;
        self.sync_product_total(txn, key.product_id).await?;
        Ok(updated)
    }

    async fn apply_sale(
        &self,
        txn: &DatabaseTransaction,
        request: &DeductForSaleRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let key = StockKey::new(request.warehouse_id, request.product_id);
        self.ensure_targets(txn, key).await?;

        let record = find_record_for_update(txn, key).await?;
        let available = record.as_ref().map_or(0, |r| r.quantity);
        let record = match record {
            Some(record) if available >= request.quantity => record,
            _ => return Err(insufficient(key, available, request.quantity.unsigned_abs())),
        };

        let new_quantity = checked_quantity(available, -request.quantity)?;
        let updated = write_quantity(txn, record, new_quantity, false).await?;
        append_movement(
            txn,
            MovementDraft {
                key,
                movement_type: MovementType::Sale,
                direction: MovementDirection::Out,
                quantity: request.quantity,
                reference_type: ReferenceType::Order,
                reference_id: Some(request.order_id),
                reason: SALE_REASON.to_string(),
                notes: None,
                performed_by,
            },
        )
        .await?;
        self.sync_product_total(txn, key.product_id).await?;
        Ok(updated)
    }

    async fn apply_restore(
        &self,
        txn: &DatabaseTransaction,
        request: &RestoreForCancellationRequest,
        performed_by: Uuid,
    ) -> Result<StockRecordModel, ServiceError> {
        let key = StockKey::new(request.warehouse_id, request.product_id);
        self.ensure_targets(txn, key).await?;

        let record = self.create_record(txn, key).await?;
        let new_quantity = checked_quantity(record.quantity, request.quantity)?;
        let updated = write_quantity(txn, record, new_quantity, false).await?;
        append_movement(
            txn,
            MovementDraft {
                key,
                movement_type: MovementType::Return,
                direction: MovementDirection::In,
                quantity: request.quantity,
                reference_type: ReferenceType::Return,
                reference_id: Some(request.order_id),
                reason: RESTORE_REASON.to_string(),
                notes: None,
                performed_by,
            },
        )
        .await?;
        self.sync_product_total(txn, key.product_id).await?;
        Ok(updated)
    }

    async fn ensure_targets(
        &self,
        txn: &DatabaseTransaction,
        key: StockKey,
    ) -> Result<(), ServiceError> {
        if !WarehouseService::exists(txn, key.warehouse_id).await? {
            return Err(ServiceError::not_found("Warehouse not found"));
        }
        if !self.catalog.product_exists(txn, key.product_id).await? {
            return Err(ServiceError::not_found("Product not found"));
        }
        Ok(())
    }

    /// Inserts a zero-quantity record unless one exists, then returns it locked.
    async fn create_record(
        &self,
        txn: &DatabaseTransaction,
        key: StockKey,
    ) -> Result<StockRecordModel, ServiceError> {
        let now = Utc::now();
        let seed = stock_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            warehouse_id: Set(key.warehouse_id),
            product_id: Set(key.product_id),
            quantity: Set(0),
            low_stock_threshold: Set(self.settings.low_stock_threshold),
            last_restocked_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        StockRecord::insert(seed)
            .on_conflict(
                OnConflict::columns([
                    stock_record::Column::WarehouseId,
                    stock_record::Column::ProductId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(txn)
            .await?;

        find_record_for_update(txn, key).await?.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "stock record for warehouse {} product {} vanished after insert",
                key.warehouse_id, key.product_id
            ))
        })
    }

    /// Recomputes the product's total from its records and writes it back
    /// through the catalog, inside the same transaction.
    async fn sync_product_total(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<i64, ServiceError> {
        // The SUM must run after the product lock is granted, so it sees
        // every record committed by the previous holder.
        self.catalog.lock_product(txn, product_id).await?;

        let total = StockRecord::find()
            .select_only()
            .column_as(stock_record::Column::Quantity.sum(), "total")
            .filter(stock_record::Column::ProductId.eq(product_id))
            .into_tuple::<Option<i64>>()
            .one(txn)
            .await?
            .flatten()
            .unwrap_or(0);

        self.catalog
            .update_total_stock(txn, product_id, total)
            .await?;
        Ok(total)
    }

    async fn join_levels(
        &self,
        txn: &DatabaseTransaction,
        records: Vec<StockRecordModel>,
    ) -> Result<Vec<StockLevel>, ServiceError> {
        let warehouse_ids: Vec<Uuid> = records.iter().map(|r| r.warehouse_id).collect();
        let product_ids: Vec<Uuid> = records.iter().map(|r| r.product_id).collect();
        let warehouses = warehouse_summaries(txn, &warehouse_ids).await?;
        let products = self.product_summaries(txn, &product_ids).await?;

        Ok(records
            .into_iter()
            .map(|record| StockLevel {
                warehouse: warehouses.get(&record.warehouse_id).cloned(),
                product: products.get(&record.product_id).cloned(),
                record,
            })
            .collect())
    }

    async fn product_summaries(
        &self,
        txn: &DatabaseTransaction,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProductSummary>, ServiceError> {
        let ids = distinct(ids);
        let summaries = self.catalog.summaries(txn, &ids).await?;
        Ok(summaries.into_iter().map(|p| (p.id, p)).collect())
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }

    fn publish_alerts(&self, record: &StockRecordModel) {
        if record.is_out_of_stock() {
            self.publish(Event::OutOfStock {
                warehouse_id: record.warehouse_id,
                product_id: record.product_id,
            });
        } else if record.is_low_stock() {
            self.publish(Event::LowStock {
                warehouse_id: record.warehouse_id,
                product_id: record.product_id,
                quantity: record.quantity,
                threshold: record.low_stock_threshold,
            });
        }
    }
}

fn low_stock_filter(select: sea_orm::Select<StockRecord>) -> sea_orm::Select<StockRecord> {
    select
        .filter(stock_record::Column::Quantity.gt(0))
        .filter(
            Expr::col(stock_record::Column::Quantity)
                .lte(Expr::col(stock_record::Column::LowStockThreshold)),
        )
}

async fn find_record(
    txn: &DatabaseTransaction,
    key: StockKey,
) -> Result<Option<StockRecordModel>, ServiceError> {
    Ok(StockRecord::find()
        .filter(stock_record::Column::WarehouseId.eq(key.warehouse_id))
        .filter(stock_record::Column::ProductId.eq(key.product_id))
        .one(txn)
        .await?)
}

/// `SELECT ... FOR UPDATE` on one record; the lock lives until the transaction ends.
async fn find_record_for_update(
    txn: &DatabaseTransaction,
    key: StockKey,
) -> Result<Option<StockRecordModel>, ServiceError> {
    Ok(StockRecord::find()
        .filter(stock_record::Column::WarehouseId.eq(key.warehouse_id))
        .filter(stock_record::Column::ProductId.eq(key.product_id))
        .lock_exclusive()
        .one(txn)
        .await?)
}

async fn write_quantity(
    txn: &DatabaseTransaction,
    record: StockRecordModel,
    quantity: i32,
    restocked: bool,
) -> Result<StockRecordModel, ServiceError> {
    let now = Utc::now();
    let mut model: stock_record::ActiveModel = record.into();
    model.quantity = Set(quantity);
    if restocked {
        model.last_restocked_at = Set(Some(now));
    }
    model.updated_at = Set(now);
    Ok(model.update(txn).await?)
}

async fn append_movement(
    txn: &DatabaseTransaction,
    draft: MovementDraft,
) -> Result<stock_movement::Model, ServiceError> {
    debug_assert!(draft
        .movement_type
        .implied_direction()
        .map_or(true, |direction| direction == draft.direction));
    let movement = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        warehouse_id: Set(draft.key.warehouse_id),
        product_id: Set(draft.key.product_id),
        movement_type: Set(draft.movement_type),
        quantity: Set(draft.quantity),
        direction: Set(draft.direction),
        reference_type: Set(Some(draft.reference_type)),
        reference_id: Set(draft.reference_id),
        reason: Set(Some(draft.reason)),
        notes: Set(draft.notes),
        performed_by: Set(draft.performed_by),
        created_at: Set(Utc::now()),
    };
    Ok(movement.insert(txn).await?)
}

async fn warehouse_summaries(
    txn: &DatabaseTransaction,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, WarehouseSummary>, ServiceError> {
    let ids = distinct(ids);
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let warehouses = Warehouse::find()
        .filter(warehouse::Column::Id.is_in(ids))
        .all(txn)
        .await?;
    Ok(warehouses
        .iter()
        .map(|w| (w.id, WarehouseSummary::from(w)))
        .collect())
}

fn distinct(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn checked_quantity(current: i32, delta: i32) -> Result<i32, ServiceError> {
    current.checked_add(delta).ok_or_else(|| {
        ServiceError::InvalidOperation(format!(
            "Stock quantity overflow: {} {:+} is out of range",
            current, delta
        ))
    })
}

fn magnitude(delta: i32) -> Result<i32, ServiceError> {
    delta.checked_abs().ok_or_else(|| {
        ServiceError::InvalidOperation(format!("Adjustment of {} is out of range", delta))
    })
}

fn insufficient(key: StockKey, available: i32, requested: u32) -> ServiceError {
    ServiceError::InsufficientStock {
        warehouse_id: key.warehouse_id,
        product_id: key.product_id,
        available: i64::from(available),
        requested: i64::from(requested),
    }
}

fn validated<R: Validate>(operation: &'static str, request: &R) -> Result<(), ServiceError> {
    request.validate().map_err(|e| {
        let err = ServiceError::from(e);
        record_rejection(operation, &err);
        err
    })
}

/// Commits on success, rolls back otherwise, and records the outcome.
async fn finish<T>(
    operation: &'static str,
    started: Instant,
    txn: DatabaseTransaction,
    outcome: Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    let outcome = match outcome {
        Ok(value) => txn
            .commit()
            .await
            .map(|_| value)
            .map_err(ServiceError::db_error),
        Err(err) => {
            if let Err(rollback) = txn.rollback().await {
                warn!(operation, error = %rollback, "rollback failed");
            }
            Err(err)
        }
    };
    record_outcome(operation, started, &outcome);
    outcome
}

fn record_outcome<T>(operation: &'static str, started: Instant, outcome: &Result<T, ServiceError>) {
    histogram!(
        "ledger.stock.mutation.duration",
        started.elapsed().as_secs_f64(),
        "operation" => operation
    );
    match outcome {
        Ok(_) => counter!("ledger.stock.mutation", 1, "operation" => operation),
        Err(err) => record_rejection(operation, err),
    }
}

fn record_rejection(operation: &'static str, err: &ServiceError) {
    counter!(
        "ledger.stock.rejected",
        1,
        "operation" => operation,
        "kind" => err.kind().code()
    );
    warn!(operation, kind = err.kind().code(), error = %err, "stock mutation rejected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::services::catalog::{MockProductCatalog, ProductCatalog, SeaOrmProductCatalog};
    use assert_matches::assert_matches;

    fn key(w: u128, p: u128) -> StockKey {
        StockKey::new(Uuid::from_u128(w), Uuid::from_u128(p))
    }

    #[test]
    fn lock_order_ignores_transfer_direction() {
        let a = key(1, 9);
        let b = key(2, 9);
        assert_eq!(lock_order(a, b), [a, b]);
        assert_eq!(lock_order(b, a), [a, b]);
    }

    #[test]
    fn overflow_is_an_invalid_operation() {
        assert_matches!(
            checked_quantity(i32::MAX, 1),
            Err(ServiceError::InvalidOperation(_))
        );
        assert_eq!(checked_quantity(5, -5).unwrap(), 0);
        assert_matches!(magnitude(i32::MIN), Err(ServiceError::InvalidOperation(_)));
    }

    async fn pool_with_warehouse() -> (Arc<DbPool>, Uuid) {
        let pool = Arc::new(
            establish_connection_with_config(&DbConfig {
                url: "sqlite::memory:".into(),
                max_connections: 1,
                min_connections: 1,
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        run_migrations(&pool).await.unwrap();

        let warehouse = crate::services::WarehouseService::new(pool.clone())
            .create(crate::dto::CreateWarehouseRequest {
                name: "Main".into(),
                code: "MAIN".into(),
                country: "US".into(),
                city: "Austin".into(),
                address: None,
                phone: None,
                email: None,
                is_active: None,
                is_default: None,
            })
            .await
            .unwrap();
        (pool, warehouse.id)
    }

    fn seed_request(warehouse_id: Uuid, product_id: Uuid) -> AdjustStockRequest {
        AdjustStockRequest {
            warehouse_id,
            product_id,
            quantity: 25,
            reason: "Initial stock".into(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn product_is_locked_before_total_is_recomputed() {
        let (pool, warehouse_id) = pool_with_warehouse().await;
        let product_id = Uuid::new_v4();

        let mut seq = mockall::Sequence::new();
        let mut catalog = MockProductCatalog::new();
        catalog.expect_product_exists().returning(|_, _| Ok(true));
        catalog
            .expect_lock_product()
            .withf(move |_, id| *id == product_id)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        catalog
            .expect_update_total_stock()
            .withf(move |_, id, total| *id == product_id && *total == 25)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let service = StockService::new(pool.clone(), Arc::new(catalog));
        let record = service
            .adjust_stock(seed_request(warehouse_id, product_id), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(record.quantity, 25);
    }

    #[tokio::test]
    async fn missing_product_lock_aborts_the_mutation() {
        let (pool, warehouse_id) = pool_with_warehouse().await;
        let product_id = Uuid::new_v4();

        let mut catalog = MockProductCatalog::new();
        catalog.expect_product_exists().returning(|_, _| Ok(true));
        catalog
            .expect_lock_product()
            .times(1)
            .returning(|_, _| Err(ServiceError::not_found("Product not found")));
        catalog.expect_update_total_stock().never();

        let service = StockService::new(pool.clone(), Arc::new(catalog));
        let err = service
            .adjust_stock(seed_request(warehouse_id, product_id), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::NotFound(_));
        assert!(StockRecord::find().all(pool.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn catalog_write_back_failure_rolls_back_the_mutation() {
        let (pool, warehouse_id) = pool_with_warehouse().await;
        let product_id = Uuid::new_v4();

        let mut catalog = MockProductCatalog::new();
        catalog.expect_product_exists().returning(|_, _| Ok(true));
        catalog.expect_lock_product().returning(|_, _| Ok(()));
        catalog
            .expect_update_total_stock()
            .times(1)
            .returning(|_, _, _| Err(ServiceError::InternalError("catalog offline".into())));

        let service = StockService::new(pool.clone(), Arc::new(catalog));
        let err = service
            .adjust_stock(seed_request(warehouse_id, product_id), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InternalError(_));

        let records = StockRecord::find().all(pool.as_ref()).await.unwrap();
        let movements = StockMovement::find().all(pool.as_ref()).await.unwrap();
        assert!(records.is_empty());
        assert!(movements.is_empty());

        // The real catalog still reports the product as unknown.
        let txn = begin_transaction(&pool, None).await.unwrap();
        let known = SeaOrmProductCatalog::new(pool.clone())
            .product_exists(&txn, product_id)
            .await
            .unwrap();
        assert!(!known);
    }
}
