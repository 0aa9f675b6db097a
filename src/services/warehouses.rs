use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{begin_transaction, DbPool},
    dto::{
        CreateWarehouseRequest, Paginated, StockSummary, UpdateWarehouseRequest,
        WarehouseDetails, WarehouseQuery,
    },
    entities::{stock_record, warehouse, StockRecord, Warehouse, WarehouseModel},
    errors::ServiceError,
    events::{Event, EventSender},
};

const WAREHOUSE_NOT_FOUND: &str = "Warehouse not found";

/// Warehouse directory: CRUD plus the existence check used by the stock ledger.
#[derive(Clone)]
pub struct WarehouseService {
    db_pool: Arc<DbPool>,
    event_sender: Option<EventSender>,
    statement_timeout: Option<Duration>,
}

impl WarehouseService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self {
            db_pool,
            event_sender: None,
            statement_timeout: None,
        }
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Checks that a warehouse exists, holding a shared lock on its row until
    /// the transaction ends so it cannot be deleted underneath a mutation.
    pub async fn exists(txn: &DatabaseTransaction, id: Uuid) -> Result<bool, ServiceError> {
        let found = Warehouse::find_by_id(id).lock_shared().one(txn).await?;
        Ok(found.is_some())
    }

    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create(
        &self,
        request: CreateWarehouseRequest,
    ) -> Result<WarehouseModel, ServiceError> {
        request.validate()?;
        let code = request.code.trim().to_string();

        let txn = begin_transaction(&self.db_pool, self.statement_timeout).await?;
        ensure_code_available(&txn, &code, None).await?;

        let created = warehouse::ActiveModel {
            name: Set(request.name.trim().to_string()),
            code: Set(code.clone()),
            country: Set(request.country.trim().to_string()),
            city: Set(request.city.trim().to_string()),
            address: Set(request.address),
            phone: Set(request.phone),
            email: Set(request.email),
            is_active: Set(request.is_active.unwrap_or(true)),
            is_default: Set(request.is_default.unwrap_or(false)),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| map_code_conflict(e, &code))?;

        txn.commit().await?;
        info!(warehouse_id = %created.id, "warehouse created");
        self.publish(Event::WarehouseCreated(created.id));
        Ok(created)
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        id: Uuid,
        request: UpdateWarehouseRequest,
    ) -> Result<WarehouseModel, ServiceError> {
        request.validate()?;

        let txn = begin_transaction(&self.db_pool, self.statement_timeout).await?;
        let existing = Warehouse::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found(WAREHOUSE_NOT_FOUND))?;

        let new_code = request.code.as_deref().map(str::trim);
        if let Some(code) = new_code {
            if code != existing.code {
                ensure_code_available(&txn, code, Some(id)).await?;
            }
        }
        let conflict_code = new_code.unwrap_or(existing.code.as_str()).to_string();

        let mut model: warehouse::ActiveModel = existing.into();
        if let Some(code) = new_code {
            model.code = Set(code.to_string());
        }
        if let Some(name) = request.name {
            model.name = Set(name.trim().to_string());
        }
        if let Some(country) = request.country {
            model.country = Set(country.trim().to_string());
        }
        if let Some(city) = request.city {
            model.city = Set(city.trim().to_string());
        }
        if let Some(address) = request.address {
            model.address = Set(Some(address));
        }
        if let Some(phone) = request.phone {
            model.phone = Set(Some(phone));
        }
        if let Some(email) = request.email {
            model.email = Set(Some(email));
        }
        if let Some(is_active) = request.is_active {
            model.is_active = Set(is_active);
        }
        if let Some(is_default) = request.is_default {
            model.is_default = Set(is_default);
        }

        let updated = model
            .update(&txn)
            .await
            .map_err(|e| map_code_conflict(e, &conflict_code))?;
        txn.commit().await?;

        info!(warehouse_id = %id, "warehouse updated");
        self.publish(Event::WarehouseUpdated(id));
        Ok(updated)
    }

    /// Returns the warehouse with a count of its stock records and their total quantity.
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<WarehouseDetails, ServiceError> {
        let db = self.db_pool.as_ref();
        let warehouse = Warehouse::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::not_found(WAREHOUSE_NOT_FOUND))?;

        let (product_count, total_items) = StockRecord::find()
            .select_only()
            .column_as(stock_record::Column::Id.count(), "product_count")
            .column_as(stock_record::Column::Quantity.sum(), "total_items")
            .filter(stock_record::Column::WarehouseId.eq(id))
            .into_tuple::<(i64, Option<i64>)>()
            .one(db)
            .await?
            .unwrap_or((0, None));

        Ok(WarehouseDetails {
            warehouse,
            stock_summary: StockSummary {
                product_count: u64::try_from(product_count).unwrap_or(0),
                total_items: total_items.unwrap_or(0),
            },
        })
    }

    /// Lists warehouses newest first.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        query: WarehouseQuery,
    ) -> Result<Paginated<WarehouseModel>, ServiceError> {
        query.validate()?;

        let mut select = Warehouse::find();
        if let Some(country) = &query.country {
            select = select.filter(warehouse::Column::Country.eq(country.as_str()));
        }
        if let Some(is_active) = query.is_active {
            select = select.filter(warehouse::Column::IsActive.eq(is_active));
        }

        let paginator = select
            .order_by_desc(warehouse::Column::CreatedAt)
            .order_by_asc(warehouse::Column::Code)
            .paginate(self.db_pool.as_ref(), u64::from(query.limit));
        let total = paginator.num_items().await?;
        let data = paginator.fetch_page(u64::from(query.page - 1)).await?;

        Ok(Paginated::new(data, total, query.page, query.limit))
    }

    /// Deletes a warehouse whose records all hold zero stock.
    /// The zero-quantity records go with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let txn = begin_transaction(&self.db_pool, self.statement_timeout).await?;
        let warehouse = Warehouse::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found(WAREHOUSE_NOT_FOUND))?;

        let stocked = StockRecord::find()
            .filter(stock_record::Column::WarehouseId.eq(id))
            .filter(stock_record::Column::Quantity.gt(0))
            .count(&txn)
            .await?;
        if stocked > 0 {
            warn!(warehouse_id = %id, stocked, "refusing to delete stocked warehouse");
            return Err(ServiceError::InvalidOperation(
                "Cannot delete warehouse with existing stock. Transfer or adjust stock to zero first."
                    .to_string(),
            ));
        }

        // Explicit so backends without enforced foreign keys end up in the same state.
        StockRecord::delete_many()
            .filter(stock_record::Column::WarehouseId.eq(id))
            .exec(&txn)
            .await?;
        warehouse.delete(&txn).await?;
        txn.commit().await?;

        info!(warehouse_id = %id, "warehouse deleted");
        self.publish(Event::WarehouseDeleted(id));
        Ok(())
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }
}

async fn ensure_code_available(
    txn: &DatabaseTransaction,
    code: &str,
    exclude: Option<Uuid>,
) -> Result<(), ServiceError> {
    let mut select = Warehouse::find().filter(warehouse::Column::Code.eq(code));
    if let Some(id) = exclude {
        select = select.filter(warehouse::Column::Id.ne(id));
    }
    if select.one(txn).await?.is_some() {
        return Err(code_conflict(code));
    }
    Ok(())
}

fn code_conflict(code: &str) -> ServiceError {
    ServiceError::Conflict(format!("Warehouse with code '{}' already exists", code))
}

/// Concurrent creates can both pass the lookup; the unique index decides.
fn map_code_conflict(err: sea_orm::DbErr, code: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => code_conflict(code),
        _ => ServiceError::db_error(err),
    }
}
