pub mod product;
pub mod stock;
pub mod warehouse;

use serde::{Deserialize, Serialize};
use validator::ValidationError;

pub use product::*;
pub use stock::*;
pub use warehouse::*;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 100;

pub(crate) fn default_page() -> u32 {
    DEFAULT_PAGE
}

pub(crate) fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

/// One page of a listing plus the totals needed to page through the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit))
        };
        Self {
            data,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// Rejects strings that are shorter than three characters once trimmed.
pub(crate) fn validate_reason(reason: &str) -> Result<(), ValidationError> {
    if reason.trim().chars().count() < 3 {
        let mut err = ValidationError::new("reason");
        err.message = Some("reason must be at least 3 characters".into());
        return Err(err);
    }
    Ok(())
}

pub(crate) fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("must not be blank".into());
        return Err(err);
    }
    Ok(())
}
