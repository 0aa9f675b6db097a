use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, DbErr, EntityTrait, QueryFilter,
    QuerySelect, Set, SqlErr,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    dto::{ProductSummary, RegisterProductRequest},
    entities::{product, Product, ProductModel},
    errors::ServiceError,
};

/// The slice of the product catalog the ledger depends on.
///
/// Every call runs inside the caller's transaction so a failed write-back
/// rolls the whole ledger mutation back with it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn product_exists(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<bool, ServiceError>;

    async fn summaries(
        &self,
        txn: &DatabaseTransaction,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductSummary>, ServiceError>;

    /// Takes the product row lock. Held until the transaction ends, so
    /// concurrent total recomputations for one product run one at a time.
    async fn lock_product(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<(), ServiceError>;

    /// Overwrites the cached total stock for a product.
    async fn update_total_stock(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        total: i64,
    ) -> Result<(), ServiceError>;
}

/// Catalog backed by the local `products` table.
#[derive(Clone)]
pub struct SeaOrmProductCatalog {
    db_pool: Arc<DbPool>,
}

impl SeaOrmProductCatalog {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Adds a product to the catalog with a zero stock total.
    #[instrument(skip(self, request), fields(sku = %request.sku))]
    pub async fn register(
        &self,
        request: RegisterProductRequest,
    ) -> Result<ProductModel, ServiceError> {
        request.validate()?;
        let now = Utc::now();
        let sku = request.sku.trim().to_string();

        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.clone()),
            name: Set(request.name.trim().to_string()),
            slug: Set(request.resolved_slug()),
            stock_quantity: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db_pool.as_ref())
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                ServiceError::Conflict(format!("Product with SKU '{}' already exists", sku))
            }
            _ => ServiceError::db_error(e),
        })?;

        info!(product_id = %model.id, "product registered");
        Ok(model)
    }

    pub async fn find(&self, product_id: Uuid) -> Result<ProductModel, ServiceError> {
        Product::find_by_id(product_id)
            .one(self.db_pool.as_ref())
            .await?
            .ok_or_else(|| ServiceError::not_found("Product not found"))
    }
}

#[async_trait]
impl ProductCatalog for SeaOrmProductCatalog {
    async fn product_exists(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let found = Product::find_by_id(product_id).one(txn).await?;
        Ok(found.is_some())
    }

    async fn summaries(
        &self,
        txn: &DatabaseTransaction,
        product_ids: &[Uuid],
    ) -> Result<Vec<ProductSummary>, ServiceError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .all(txn)
            .await?;
        Ok(products.iter().map(ProductSummary::from).collect())
    }

    async fn lock_product(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<(), ServiceError> {
        Product::find_by_id(product_id)
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product not found"))?;
        Ok(())
    }

    async fn update_total_stock(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        total: i64,
    ) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(product::Column::StockQuantity, Expr::value(total))
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::db_error(DbErr::RecordNotUpdated));
        }
        Ok(())
    }
}
