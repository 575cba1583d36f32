//! Platform users.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The role a user signed up with.
///
/// Roles are not exclusive capabilities: a customer may also own a store or
/// hold a delivery profile. Operations check capabilities instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Customer,
    StoreOwner,
    DeliveryPartner,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Customer => "CUSTOMER",
            UserRole::StoreOwner => "STORE_OWNER",
            UserRole::DeliveryPartner => "DELIVERY_PARTNER",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUSTOMER" => Ok(UserRole::Customer),
            "STORE_OWNER" => Ok(UserRole::StoreOwner),
            "DELIVERY_PARTNER" => Ok(UserRole::DeliveryPartner),
            other => Err(DomainError::UnrecognizedStatus {
                field: "user role",
                value: other.to_string(),
            }),
        }
    }
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: UserRole,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Creates an active user with no contact details.
    pub fn new(role: UserRole) -> Self {
        Self {
            id: UserId::new(),
            email: None,
            phone: None,
            role,
            deleted_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Returns false once the user has been soft-deleted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        for role in [UserRole::Customer, UserRole::StoreOwner, UserRole::DeliveryPartner] {
            assert_eq!(role.as_str().parse::<UserRole>().unwrap(), role);
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
        assert!("ADMIN".parse::<UserRole>().is_err());
    }

    #[test]
    fn test_soft_deleted_user_is_inactive() {
        let mut user = User::new(UserRole::Customer).with_email("a@example.com");
        assert!(user.is_active());
        user.deleted_at = Some(Utc::now());
        assert!(!user.is_active());
    }
}
