//! Stock reservation on top of the repository's atomic counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ProductId, ReservationId};
use domain::{DomainError, OrderItem, Reservation};
use repository::Repository;

use crate::error::{FulfillmentError, Result};
use crate::snapshot::OrderItemDraft;

/// Handle for a stock decrement that can still be committed or released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationToken {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
}

impl ReservationToken {
    /// Token backing an order line.
    pub fn for_item(item: &OrderItem) -> Self {
        Self {
            reservation_id: item.reservation_id,
            product_id: item.product_id,
            quantity: item.quantity,
        }
    }
}

/// Reserves, releases and commits stock.
///
/// Every stock change is a single atomic repository operation; nothing here
/// holds an in-process lock.
pub struct InventoryReservations<R> {
    repository: Arc<R>,
}

impl<R> Clone for InventoryReservations<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R: Repository> InventoryReservations<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Decrements stock by `quantity` and records a HELD reservation.
    #[tracing::instrument(skip(self, now))]
    pub async fn reserve(
        &self,
        product_id: ProductId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<ReservationToken> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity { quantity }.into());
        }
        let reservation = Reservation::held(product_id, quantity, now);
        if !self.repository.reserve_stock(&reservation).await? {
            return Err(FulfillmentError::InsufficientStock {
                product_id,
                requested: quantity,
            });
        }

        tracing::debug!(%product_id, quantity, reservation_id = %reservation.id, "stock reserved");
        Ok(ReservationToken {
            reservation_id: reservation.id,
            product_id,
            quantity,
        })
    }

    /// Gives the token's units back to the product. Idempotent.
    ///
    /// Returns `false` when the token was already released, committed or is
    /// unknown; that case changes nothing.
    pub async fn release(&self, token: &ReservationToken) -> Result<bool> {
        match self
            .repository
            .release_reservation(token.reservation_id)
            .await?
        {
            Some(_) => {
                metrics::counter!("stock_released_total").increment(u64::from(token.quantity));
                tracing::debug!(
                    reservation_id = %token.reservation_id,
                    product_id = %token.product_id,
                    quantity = token.quantity,
                    "reservation released"
                );
                Ok(true)
            }
            None => {
                tracing::warn!(
                    reservation_id = %token.reservation_id,
                    "release ignored: reservation is not held"
                );
                Ok(false)
            }
        }
    }

    /// Makes the decrement permanent. Stock is not touched.
    pub async fn commit(&self, token: &ReservationToken) -> Result<bool> {
        match self
            .repository
            .commit_reservation(token.reservation_id)
            .await?
        {
            Some(_) => Ok(true),
            None => {
                tracing::warn!(
                    reservation_id = %token.reservation_id,
                    "commit ignored: reservation is not held"
                );
                Ok(false)
            }
        }
    }

    /// Reserves every draft, all or nothing.
    ///
    /// Products are reserved in ascending id order. On the first failure the
    /// reservations made so far are released and the failure is returned.
    /// Tokens come back in the order of `drafts`.
    pub async fn reserve_all(
        &self,
        drafts: &[OrderItemDraft],
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationToken>> {
        let mut order: Vec<usize> = (0..drafts.len()).collect();
        order.sort_by_key(|&i| drafts[i].product_id);

        let mut held: Vec<(usize, ReservationToken)> = Vec::with_capacity(drafts.len());
        for index in order {
            let draft = &drafts[index];
            match self.reserve(draft.product_id, draft.quantity, now).await {
                Ok(token) => held.push((index, token)),
                Err(e) => {
                    let tokens: Vec<ReservationToken> = held.into_iter().map(|(_, t)| t).collect();
                    // Anything left HELD here is not yet referenced by an order.
                    if let Err(undo) = self.release_all(&tokens).await {
                        tracing::error!(error = %undo, "failed to roll back reservations");
                    }
                    return Err(e);
                }
            }
        }

        held.sort_by_key(|(index, _)| *index);
        Ok(held.into_iter().map(|(_, token)| token).collect())
    }

    /// Releases every token.
    ///
    /// Keeps going past failures so one bad row does not strand the rest,
    /// then returns the first error.
    pub async fn release_all(&self, tokens: &[ReservationToken]) -> Result<()> {
        let mut first_error = None;
        for token in tokens {
            if let Err(e) = self.release(token).await {
                tracing::error!(
                    reservation_id = %token.reservation_id,
                    error = %e,
                    "failed to release reservation"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Commits every token, with the same error handling as
    /// [`release_all`](Self::release_all).
    pub async fn commit_all(&self, tokens: &[ReservationToken]) -> Result<()> {
        let mut first_error = None;
        for token in tokens {
            if let Err(e) = self.commit(token).await {
                tracing::error!(
                    reservation_id = %token.reservation_id,
                    error = %e,
                    "failed to commit reservation"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use common::{Money, StoreId};
    use domain::{Product, ReservationState};
    use repository::InMemoryRepository;

    use super::*;

    async fn setup(stocks: &[u32]) -> (Arc<InMemoryRepository>, Vec<Product>) {
        let repo = Arc::new(InMemoryRepository::new());
        let store_id = StoreId::new();
        let mut products = Vec::new();
        for (i, stock) in stocks.iter().enumerate() {
            let product = Product::new(
                store_id,
                format!("item-{i}"),
                "grocery",
                Money::from_cents(100),
                *stock,
            );
            repo.save_product(&product).await.unwrap();
            products.push(product);
        }
        (repo, products)
    }

    fn draft(product: &Product, quantity: u32) -> OrderItemDraft {
        OrderItemDraft {
            product_id: product.id,
            product_name: product.name.clone(),
            quantity,
            unit_price: product.price,
        }
    }

    #[tokio::test]
    async fn test_reserve_decrements_and_holds() {
        let (repo, products) = setup(&[5]).await;
        let inventory = InventoryReservations::new(repo.clone());

        let token = inventory
            .reserve(products[0].id, 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(token.quantity, 3);
        assert_eq!(repo.stock_of(products[0].id).await, Some(2));
        let stored = repo.get_reservation(token.reservation_id).await.unwrap();
        assert_eq!(stored.unwrap().state, ReservationState::Held);
    }

    #[tokio::test]
    async fn test_reserve_more_than_stock_fails_cleanly() {
        let (repo, products) = setup(&[1]).await;
        let inventory = InventoryReservations::new(repo.clone());

        let err = inventory
            .reserve(products[0].id, 2, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::InsufficientStock { requested: 2, .. }
        ));
        assert_eq!(repo.stock_of(products[0].id).await, Some(1));
        assert_eq!(repo.reservation_count(ReservationState::Held).await, 0);
    }

    #[tokio::test]
    async fn test_release_twice_restores_once() {
        let (repo, products) = setup(&[4]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let token = inventory
            .reserve(products[0].id, 4, Utc::now())
            .await
            .unwrap();

        assert!(inventory.release(&token).await.unwrap());
        assert!(!inventory.release(&token).await.unwrap());
        assert_eq!(repo.stock_of(products[0].id).await, Some(4));
    }

    #[tokio::test]
    async fn test_commit_keeps_stock_and_blocks_release() {
        let (repo, products) = setup(&[4]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let token = inventory
            .reserve(products[0].id, 1, Utc::now())
            .await
            .unwrap();

        assert!(inventory.commit(&token).await.unwrap());
        assert!(!inventory.release(&token).await.unwrap());
        assert_eq!(repo.stock_of(products[0].id).await, Some(3));
        assert_eq!(repo.reservation_count(ReservationState::Committed).await, 1);
    }

    #[tokio::test]
    async fn test_reserve_all_rolls_back_on_failure() {
        let (repo, products) = setup(&[5, 5, 1]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let drafts: Vec<_> = vec![
            draft(&products[0], 2),
            draft(&products[1], 2),
            draft(&products[2], 2),
        ];

        let err = inventory.reserve_all(&drafts, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::InsufficientStock { product_id, .. } if product_id == products[2].id
        ));
        for product in &products {
            assert_eq!(repo.stock_of(product.id).await, Some(product.stock));
        }
        assert_eq!(repo.reservation_count(ReservationState::Held).await, 0);
    }

    #[tokio::test]
    async fn test_reserve_all_returns_tokens_in_draft_order() {
        let (repo, products) = setup(&[5, 5, 5]).await;
        let inventory = InventoryReservations::new(repo);
        let drafts = vec![
            draft(&products[2], 1),
            draft(&products[0], 2),
            draft(&products[1], 3),
        ];

        let tokens = inventory.reserve_all(&drafts, Utc::now()).await.unwrap();
        let got: Vec<_> = tokens.iter().map(|t| (t.product_id, t.quantity)).collect();
        let want: Vec<_> = drafts.iter().map(|d| (d.product_id, d.quantity)).collect();
        assert_eq!(got, want);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_oversell() {
        let (repo, products) = setup(&[10]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let product_id = products[0].id;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let inventory = inventory.clone();
            handles.push(tokio::spawn(async move {
                inventory.reserve(product_id, 1, Utc::now()).await
            }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            if let Ok(token) = handle.await.unwrap() {
                tokens.push(token);
            }
        }
        assert_eq!(tokens.len(), 10);
        assert_eq!(repo.stock_of(product_id).await, Some(0));

        inventory.release_all(&tokens[..4]).await.unwrap();
        assert_eq!(repo.stock_of(product_id).await, Some(4));
    }

    #[tokio::test]
    async fn test_release_unknown_token_changes_nothing() {
        let (repo, products) = setup(&[3]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let stranger = ReservationToken {
            reservation_id: ReservationId::new(),
            product_id: products[0].id,
            quantity: 2,
        };

        assert!(!inventory.release(&stranger).await.unwrap());
        assert!(!inventory.commit(&stranger).await.unwrap());
        assert_eq!(repo.stock_of(products[0].id).await, Some(3));
    }

    #[tokio::test]
    async fn test_release_all_reports_failure_after_trying_every_token() {
        let (repo, products) = setup(&[4, 4]).await;
        let inventory = InventoryReservations::new(repo.clone());
        let tokens = vec![
            inventory.reserve(products[0].id, 1, Utc::now()).await.unwrap(),
            inventory.reserve(products[1].id, 1, Utc::now()).await.unwrap(),
        ];

        repo.set_fail_on_release(true).await;
        let err = inventory.release_all(&tokens).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Repository(_)));
        assert_eq!(repo.reservation_count(ReservationState::Held).await, 2);

        repo.set_fail_on_release(false).await;
        inventory.release_all(&tokens).await.unwrap();
        assert_eq!(repo.stock_of(products[0].id).await, Some(4));
        assert_eq!(repo.stock_of(products[1].id).await, Some(4));
    }
}
