//! Products.

use chrono::{DateTime, Utc};
use common::{Money, ProductId, StoreId};
use serde::{Deserialize, Serialize};

/// A product listed by a store.
///
/// `stock` is only ever changed through the repository's atomic stock
/// operations once the product is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub store_id: StoreId,
    pub name: String,
    pub category: String,
    pub price: Money,
    pub stock: u32,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(
        store_id: StoreId,
        name: impl Into<String>,
        category: impl Into<String>,
        price: Money,
        stock: u32,
    ) -> Self {
        Self {
            id: ProductId::new(),
            store_id,
            name: name.into(),
            category: category.into(),
            price,
            stock,
            deleted_at: None,
        }
    }

    /// Returns false once the product has been soft-deleted.
    pub fn is_available(&self) -> bool {
        self.deleted_at.is_none()
    }
}
