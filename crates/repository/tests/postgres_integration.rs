//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container. Every test works on freshly
//! generated ids, so they do not need to clear tables between runs.
//! Run with:
//!
//! ```bash
//! cargo test -p repository --test postgres_integration
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use domain::{
    CartItem, DeliveryProfile, DispatchLease, GeoPoint, Money, Order, OrderItem, OrderStatus,
    PartnerStatus, Product, ProductId, Reservation, ReservationState, Store, StoreStatus, User,
    UserId, UserRole,
};
use repository::{ClaimOutcome, PostgresRepository, Repository, RepositoryError};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_fulfillment_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_repository() -> PostgresRepository {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    PostgresRepository::new(pool)
}

async fn seed_product(repo: &PostgresRepository, stock: u32) -> Product {
    let owner = User::new(UserRole::StoreOwner).with_email("owner@example.com");
    let store = Store::new(owner.id, "12 Market Rd").with_location(GeoPoint::new(51.5, -0.12));
    let product = Product::new(store.id, "Sourdough", "bakery", Money::from_cents(650), stock);
    repo.save_user(&owner).await.unwrap();
    repo.save_store(&store).await.unwrap();
    repo.save_product(&product).await.unwrap();
    product
}

async fn seed_order(repo: &PostgresRepository, product: &Product, status: OrderStatus) -> Order {
    let mut order = Order::place(
        UserId::new(),
        product.store_id,
        vec![
            OrderItem {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: 2,
                unit_price: product.price,
                reservation_id: domain::ReservationId::new(),
            },
            OrderItem {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: 1,
                unit_price: product.price,
                reservation_id: domain::ReservationId::new(),
            },
        ],
        Utc::now(),
    )
    .unwrap();
    order.status = status;
    repo.insert_order(&order).await.unwrap();
    order
}

#[tokio::test]
async fn round_trips_catalog_entities() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 7).await;

    let stored = repo.get_product(product.id).await.unwrap().unwrap();
    assert_eq!(stored, product);

    let store = repo.get_store(product.store_id).await.unwrap().unwrap();
    assert_eq!(store.status, StoreStatus::Open);
    assert_eq!(store.location, Some(GeoPoint::new(51.5, -0.12)));

    let owner = repo.get_user(store.owner_id).await.unwrap().unwrap();
    assert_eq!(owner.role, UserRole::StoreOwner);
    assert_eq!(owner.email.as_deref(), Some("owner@example.com"));

    assert!(repo.get_product(ProductId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn order_round_trip_keeps_line_order_and_total() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 7).await;
    let order = seed_order(&repo, &product, OrderStatus::Pending).await;

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.items, order.items);
    assert_eq!(stored.total_price.cents(), 1950);
    assert_eq!(stored.status, OrderStatus::Pending);
}

#[tokio::test]
async fn conditional_decrement_stops_at_zero() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 3).await;

    let product_id = product.id;
    let mut handles = Vec::new();
    for _ in 0..6 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.decrement_stock_if_available(product_id, 1).await.unwrap()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 3);
    let stored = repo.get_product(product.id).await.unwrap().unwrap();
    assert_eq!(stored.stock, 0);
}

#[tokio::test]
async fn reservation_release_is_idempotent() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 4).await;
    let reservation = Reservation::held(product.id, 4, Utc::now());
    assert!(repo.reserve_stock(&reservation).await.unwrap());

    let first = repo.release_reservation(reservation.id).await.unwrap();
    assert_eq!(first.unwrap().state, ReservationState::Released);
    assert!(repo.release_reservation(reservation.id).await.unwrap().is_none());
    assert!(repo.commit_reservation(reservation.id).await.unwrap().is_none());

    let stored = repo.get_product(product.id).await.unwrap().unwrap();
    assert_eq!(stored.stock, 4);
}

#[tokio::test]
async fn concurrent_reserves_never_oversell() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 2).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let repo = repo.clone();
        let reservation = Reservation::held(product.id, 1, Utc::now());
        handles.push(tokio::spawn(async move {
            let reserved = repo.reserve_stock(&reservation).await.unwrap();
            (reservation.id, reserved)
        }));
    }

    let mut reserved = 0;
    for handle in handles {
        let (id, ok) = handle.await.unwrap();
        let stored = repo.get_reservation(id).await.unwrap();
        if ok {
            reserved += 1;
            assert_eq!(stored.unwrap().state, ReservationState::Held);
        } else {
            assert!(stored.is_none());
        }
    }
    assert_eq!(reserved, 2);
    assert_eq!(repo.get_product(product.id).await.unwrap().unwrap().stock, 0);
}

#[tokio::test]
async fn stranded_reservations_follow_terminal_orders() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 5).await;
    let reservation = Reservation::held(product.id, 1, Utc::now());
    repo.reserve_stock(&reservation).await.unwrap();

    let mut order = Order::place(
        UserId::new(),
        product.store_id,
        vec![OrderItem {
            product_id: product.id,
            product_name: product.name.clone(),
            quantity: 1,
            unit_price: product.price,
            reservation_id: reservation.id,
        }],
        Utc::now(),
    )
    .unwrap();
    order.status = OrderStatus::Cancelled;
    repo.insert_order(&order).await.unwrap();

    let stranded = repo.stranded_reservations().await.unwrap();
    assert!(stranded.contains(&(reservation.id, OrderStatus::Cancelled)));

    repo.release_reservation(reservation.id).await.unwrap();
    let stranded = repo.stranded_reservations().await.unwrap();
    assert!(!stranded.iter().any(|(id, _)| *id == reservation.id));
    assert_eq!(repo.get_product(product.id).await.unwrap().unwrap().stock, 5);
}

#[tokio::test]
async fn dispatch_lease_is_exclusive_until_expiry() {
    let repo = get_test_repository().await;
    let now = Utc::now();
    let order_id = domain::OrderId::new();
    let first = DispatchLease::new(order_id, now + Duration::seconds(30));
    let second = DispatchLease::new(order_id, now + Duration::seconds(90));

    assert!(repo.acquire_dispatch_lease(&first, now).await.unwrap());
    assert!(!repo.acquire_dispatch_lease(&second, now).await.unwrap());

    let partner = UserId::new();
    let offering = first.offering_to(Some(partner), now + Duration::seconds(60));
    assert!(repo.renew_dispatch_lease(&offering).await.unwrap());
    assert!(!repo.renew_dispatch_lease(&second).await.unwrap());
    let stored = repo.get_dispatch_lease(order_id).await.unwrap().unwrap();
    assert_eq!(stored.partner_id, Some(partner));
    assert_eq!(stored.dispatch_id, first.dispatch_id);

    let later = now + Duration::seconds(61);
    assert!(repo.acquire_dispatch_lease(&second, later).await.unwrap());
    assert!(
        !repo
            .release_dispatch_lease(order_id, first.dispatch_id)
            .await
            .unwrap()
    );
    assert!(
        repo.release_dispatch_lease(order_id, second.dispatch_id)
            .await
            .unwrap()
    );
    assert!(repo.get_dispatch_lease(order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn withdraw_cancels_only_under_a_live_lease() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 1).await;
    let order = seed_order(&repo, &product, OrderStatus::ReadyForPickup).await;
    let now = Utc::now();
    let change = order.withdraw_from_dispatch(now).unwrap();

    assert!(matches!(
        repo.transition_order(&change).await,
        Err(RepositoryError::UnsupportedTransition(OrderStatus::Cancelled))
    ));
    assert!(repo.withdraw_dispatch(&change).await.unwrap().is_none());

    let lease = DispatchLease::new(order.id, now + Duration::seconds(30));
    repo.acquire_dispatch_lease(&lease, now).await.unwrap();
    let (cancelled, removed) = repo.withdraw_dispatch(&change).await.unwrap().unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(removed.dispatch_id, lease.dispatch_id);
    assert!(repo.get_dispatch_lease(order.id).await.unwrap().is_none());

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert!(stored.cancelled_at.is_some());
}

#[tokio::test]
async fn cart_lines_are_replaced_and_removed() {
    let repo = get_test_repository().await;
    let user = UserId::new();
    let first = ProductId::new();
    let second = ProductId::new();

    repo.save_cart_item(&CartItem::new(user, first, 1).unwrap())
        .await
        .unwrap();
    repo.save_cart_item(&CartItem::new(user, first, 4).unwrap())
        .await
        .unwrap();
    repo.save_cart_item(&CartItem::new(user, second, 2).unwrap())
        .await
        .unwrap();

    let items = repo.cart_items(user).await.unwrap();
    assert_eq!(items.len(), 2);
    let line = items.iter().find(|i| i.product_id == first).unwrap();
    assert_eq!(line.quantity, 4);

    repo.remove_cart_items(user, &[first, second]).await.unwrap();
    assert!(repo.cart_items(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn transition_is_compare_and_set() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 1).await;
    let order = seed_order(&repo, &product, OrderStatus::Pending).await;

    let cancel = order.cancel(Utc::now()).unwrap();
    let accept = order.accept(Utc::now()).unwrap();

    assert!(repo.transition_order(&cancel).await.unwrap().is_some());
    assert!(repo.transition_order(&accept).await.unwrap().is_none());

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert!(stored.cancelled_at.is_some());
    assert!(stored.accepted_at.is_none());

    let assign = Order {
        status: OrderStatus::ReadyForPickup,
        ..order
    }
    .assign_partner(UserId::new(), Utc::now())
    .unwrap();
    assert!(matches!(
        repo.transition_order(&assign).await,
        Err(RepositoryError::UnsupportedTransition(OrderStatus::OutForDelivery))
    ));
}

#[tokio::test]
async fn concurrent_claims_assign_one_partner() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 1).await;
    let order = seed_order(&repo, &product, OrderStatus::ReadyForPickup).await;

    let mut partners = Vec::new();
    for _ in 0..4 {
        let profile = DeliveryProfile::new(UserId::new()).with_location(GeoPoint::new(51.5, -0.1));
        repo.save_delivery_profile(&profile).await.unwrap();
        partners.push(profile.user_id);
    }

    let mut handles = Vec::new();
    for partner in &partners {
        let repo = repo.clone();
        let change = order.assign_partner(*partner, Utc::now()).unwrap();
        handles.push(tokio::spawn(async move {
            repo.claim_partner_if_available(&change).await.unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::Claimed(_) => claimed += 1,
            ClaimOutcome::OrderNotReady(status) => {
                assert_eq!(status, OrderStatus::OutForDelivery)
            }
            ClaimOutcome::PartnerUnavailable => panic!("partners were all available"),
        }
    }
    assert_eq!(claimed, 1);

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    let winner = stored.delivery_partner_id.unwrap();
    for partner in partners {
        let profile = repo.get_delivery_profile(partner).await.unwrap().unwrap();
        if partner == winner {
            assert_eq!(profile.status, PartnerStatus::Busy);
            assert!(profile.is_carrying(order.id));
        } else {
            assert_eq!(profile.status, PartnerStatus::Available);
            assert!(profile.assigned_orders.is_empty());
        }
    }
}

#[tokio::test]
async fn finish_delivery_releases_partner() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 1).await;
    let order = seed_order(&repo, &product, OrderStatus::ReadyForPickup).await;
    let partner = DeliveryProfile::new(UserId::new());
    repo.save_delivery_profile(&partner).await.unwrap();

    let change = order.assign_partner(partner.user_id, Utc::now()).unwrap();
    let ClaimOutcome::Claimed(out) = repo.claim_partner_if_available(&change).await.unwrap() else {
        panic!("claim should succeed");
    };
    assert!(
        !repo
            .set_idle_partner_status(partner.user_id, PartnerStatus::Offline)
            .await
            .unwrap()
    );

    let done = out.mark_delivered(Utc::now()).unwrap();
    let delivered = repo
        .finish_delivery(&done, partner.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert!(delivered.delivered_at.is_some());

    let profile = repo
        .get_delivery_profile(partner.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.status, PartnerStatus::Available);
    assert!(profile.assigned_orders.is_empty());

    assert!(repo.finish_delivery(&done, partner.user_id).await.unwrap().is_none());
}

#[tokio::test]
async fn awaiting_courier_lists_oldest_first() {
    let repo = get_test_repository().await;
    let product = seed_product(&repo, 1).await;
    let older = seed_order(&repo, &product, OrderStatus::ReadyForPickup).await;
    let newer = seed_order(&repo, &product, OrderStatus::ReadyForPickup).await;

    let waiting: Vec<_> = repo
        .orders_awaiting_courier()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.id)
        .filter(|id| *id == older.id || *id == newer.id)
        .collect();
    assert_eq!(waiting, vec![older.id, newer.id]);
}

#[tokio::test]
async fn partner_location_updates() {
    let repo = get_test_repository().await;
    let partner = DeliveryProfile::new(UserId::new());
    repo.save_delivery_profile(&partner).await.unwrap();

    let here = GeoPoint::new(40.0, -73.9);
    assert!(repo.update_partner_location(partner.user_id, here).await.unwrap());
    assert!(!repo.update_partner_location(UserId::new(), here).await.unwrap());

    let stored = repo
        .get_delivery_profile(partner.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.location, Some(here));
}
