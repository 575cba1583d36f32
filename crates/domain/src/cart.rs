//! Cart lines.

use common::{ProductId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// One (user, product) line of a cart.
///
/// Carts are a non-binding quantity ledger; nothing is reserved until checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: u32,
}

impl CartItem {
    pub fn new(user_id: UserId, product_id: ProductId, quantity: u32) -> Result<Self, DomainError> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity { quantity });
        }
        Ok(Self {
            user_id,
            product_id,
            quantity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_quantity_is_rejected() {
        let err = CartItem::new(UserId::new(), ProductId::new(), 0).unwrap_err();
        assert_eq!(err, DomainError::InvalidQuantity { quantity: 0 });
        assert!(CartItem::new(UserId::new(), ProductId::new(), 1).is_ok());
    }
}
