//! Freezes a mutable cart into order lines.

use std::sync::Arc;

use common::{Money, ProductId, StoreId, UserId};
use domain::DomainError;
use repository::Repository;

use crate::error::{FulfillmentError, Result};

/// One line of a cart snapshot with the price read at checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItemDraft {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderItemDraft {
    pub fn line_total(&self) -> std::result::Result<Money, DomainError> {
        self.unit_price
            .checked_multiply(self.quantity)
            .ok_or(DomainError::AmountOverflow)
    }
}

/// Immutable copy of one store's cart lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartSnapshot {
    pub user_id: UserId,
    pub store_id: StoreId,
    /// Ordered by product id.
    pub items: Vec<OrderItemDraft>,
    pub total: Money,
}

impl CartSnapshot {
    pub fn product_ids(&self) -> Vec<ProductId> {
        self.items.iter().map(|item| item.product_id).collect()
    }
}

pub struct CartSnapshotter<R> {
    repository: Arc<R>,
}

impl<R: Repository> CartSnapshotter<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Builds a snapshot of the user's cart lines for `store_id`.
    ///
    /// Lines of other stores are ignored. Lines whose product no longer
    /// exists cannot be attributed to a store and are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn snapshot(&self, user_id: UserId, store_id: StoreId) -> Result<CartSnapshot> {
        let mut lines = Vec::new();
        for item in self.repository.cart_items(user_id).await? {
            match self.repository.get_product(item.product_id).await? {
                Some(product) if product.store_id == store_id => lines.push((item, product)),
                Some(_) => {}
                None => {
                    tracing::debug!(product_id = %item.product_id, "cart line references unknown product");
                }
            }
        }

        if lines.is_empty() {
            return Err(FulfillmentError::EmptyCart { store_id });
        }

        let mut items = Vec::with_capacity(lines.len());
        for (item, product) in lines {
            if !product.is_available() {
                return Err(FulfillmentError::ProductUnavailable(product.id));
            }
            // Early check only; the binding one is the conditional decrement.
            if item.quantity > product.stock {
                return Err(FulfillmentError::InsufficientStock {
                    product_id: product.id,
                    requested: item.quantity,
                });
            }
            items.push(OrderItemDraft {
                product_id: product.id,
                product_name: product.name,
                quantity: item.quantity,
                unit_price: product.price,
            });
        }

        let line_totals = items
            .iter()
            .map(OrderItemDraft::line_total)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let total = Money::checked_sum(line_totals).ok_or(DomainError::AmountOverflow)?;
        Ok(CartSnapshot {
            user_id,
            store_id,
            items,
            total,
        })
    }
}
