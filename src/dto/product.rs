use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_not_blank;

/// Registers a product in the local catalog projection.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RegisterProductRequest {
    #[validate(length(min = 1, max = 100), custom = "validate_not_blank")]
    pub sku: String,
    #[validate(length(min = 1, max = 255), custom = "validate_not_blank")]
    pub name: String,
    /// Derived from the name when absent.
    #[validate(length(min = 1, max = 255))]
    pub slug: Option<String>,
}

impl RegisterProductRequest {
    pub fn resolved_slug(&self) -> String {
        match &self.slug {
            Some(slug) => slug.trim().to_string(),
            None => slugify(&self.name),
        }
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
