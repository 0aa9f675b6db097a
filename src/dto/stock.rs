use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{default_limit, default_page, validate_reason};
use crate::entities::{
    MovementType, ProductModel, ReferenceType, StockMovementModel, StockRecordModel,
    WarehouseModel,
};

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AdjustStockRequest {
    pub warehouse_id: Uuid,
    pub product_id: Uuid,
    /// Signed delta; positive adds stock, negative removes it.
    #[validate(custom = "validate_nonzero_delta")]
    pub quantity: i32,
    #[validate(custom = "validate_reason")]
    pub reason: String,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TransferStockRequest {
    pub source_warehouse_id: Uuid,
    pub destination_warehouse_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(custom = "validate_reason")]
    pub reason: String,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ReceiveStockRequest {
    pub warehouse_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub purchase_order_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DeductForSaleRequest {
    pub warehouse_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RestoreForCancellationRequest {
    pub warehouse_id: Uuid,
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub order_id: Uuid,
}

/// Filters for stock level listings. `out_of_stock` wins over `low_stock`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct StockLevelQuery {
    pub warehouse_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub low_stock: bool,
    #[serde(default)]
    pub out_of_stock: bool,
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct MovementQuery {
    pub warehouse_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub movement_type: Option<MovementType>,
    pub reference_type: Option<ReferenceType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

impl StockLevelQuery {
    pub fn new() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            ..Default::default()
        }
    }
}

impl MovementQuery {
    pub fn new() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseSummary {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub country: String,
    pub city: String,
}

impl From<&WarehouseModel> for WarehouseSummary {
    fn from(w: &WarehouseModel) -> Self {
        Self {
            id: w.id,
            name: w.name.clone(),
            code: w.code.clone(),
            country: w.country.clone(),
            city: w.city.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub slug: String,
}

impl From<&ProductModel> for ProductSummary {
    fn from(p: &ProductModel) -> Self {
        Self {
            id: p.id,
            sku: p.sku.clone(),
            name: p.name.clone(),
            slug: p.slug.clone(),
        }
    }
}

/// A stock record joined with the warehouse and product it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    #[serde(flatten)]
    pub record: StockRecordModel,
    pub warehouse: Option<WarehouseSummary>,
    pub product: Option<ProductSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementEntry {
    #[serde(flatten)]
    pub movement: StockMovementModel,
    pub warehouse: Option<WarehouseSummary>,
    pub product: Option<ProductSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockAlerts {
    pub low_stock: Vec<StockLevel>,
    pub out_of_stock: Vec<StockLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub warehouse_id: Uuid,
    pub new_quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub source: TransferLeg,
    pub destination: TransferLeg,
}

fn validate_nonzero_delta(quantity: i32) -> Result<(), ValidationError> {
    if quantity == 0 {
        let mut err = ValidationError::new("quantity");
        err.message = Some("adjustment quantity must not be zero".into());
        return Err(err);
    }
    Ok(())
}
