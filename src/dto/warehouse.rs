use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{default_limit, default_page, validate_not_blank};
use crate::entities::WarehouseModel;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateWarehouseRequest {
    #[validate(length(min = 1, max = 200), custom = "validate_not_blank")]
    pub name: String,
    #[validate(length(min = 1, max = 50), custom = "validate_not_blank")]
    pub code: String,
    #[validate(length(min = 1, max = 100), custom = "validate_not_blank")]
    pub country: String,
    #[validate(length(min = 1, max = 100), custom = "validate_not_blank")]
    pub city: String,
    pub address: Option<String>,
    #[validate(length(max = 50))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateWarehouseRequest {
    #[validate(length(min = 1, max = 200), custom = "validate_not_blank")]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 50), custom = "validate_not_blank")]
    pub code: Option<String>,
    #[validate(length(min = 1, max = 100), custom = "validate_not_blank")]
    pub country: Option<String>,
    #[validate(length(min = 1, max = 100), custom = "validate_not_blank")]
    pub city: Option<String>,
    pub address: Option<String>,
    #[validate(length(max = 50))]
    pub phone: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct WarehouseQuery {
    pub country: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

impl WarehouseQuery {
    pub fn new() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSummary {
    pub product_count: u64,
    pub total_items: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseDetails {
    #[serde(flatten)]
    pub warehouse: WarehouseModel,
    pub stock_summary: StockSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(code: &str, email: Option<&str>) -> CreateWarehouseRequest {
        CreateWarehouseRequest {
            name: "Main".into(),
            code: code.into(),
            country: "DE".into(),
            city: "Berlin".into(),
            address: None,
            phone: None,
            email: email.map(Into::into),
            is_active: None,
            is_default: None,
        }
    }

    #[test]
    fn create_rejects_blank_code_and_bad_email() {
        assert!(create("WH-1", Some("ops@example.com")).validate().is_ok());
        let errors = create("   ", None).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("code"));
        let errors = create("WH-1", Some("not-an-email")).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("email"));
    }

    #[test]
    fn empty_update_is_valid() {
        assert!(UpdateWarehouseRequest::default().validate().is_ok());
    }
}
