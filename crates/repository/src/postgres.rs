use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DispatchId, Money, OrderId, ProductId, ReservationId, StoreId, UserId};
use domain::{
    CartItem, DeliveryProfile, DispatchLease, GeoPoint, Order, OrderItem, OrderStatus,
    PartnerStatus, Product, Reservation, ReservationState, StatusChange, Store, User,
};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    RepositoryError, Result,
    store::{ClaimOutcome, Repository, ensure_plain_transition},
};

const ORDER_COLUMNS: &str = "id, user_id, store_id, delivery_partner_id, total_price_cents, status, \
     created_at, accepted_at, delivered_at, cancelled_at";

/// PostgreSQL-backed repository.
///
/// Conditional updates are single guarded statements or short transactions
/// that lock the order row first and the partner row second.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Creates a new PostgreSQL repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a fresh pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_user(row: PgRow) -> Result<User> {
        Ok(User {
            id: UserId::from_uuid(row.try_get::<Uuid, _>("id")?),
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            role: row.try_get::<String, _>("role")?.parse()?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_store(row: PgRow) -> Result<Store> {
        Ok(Store {
            id: StoreId::from_uuid(row.try_get::<Uuid, _>("id")?),
            owner_id: UserId::from_uuid(row.try_get::<Uuid, _>("owner_id")?),
            address: row.try_get("address")?,
            location: location_from_row(&row)?,
            status: row.try_get::<String, _>("status")?.parse()?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get::<Uuid, _>("id")?),
            store_id: StoreId::from_uuid(row.try_get::<Uuid, _>("store_id")?),
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            stock: to_u32("stock", row.try_get("stock")?)?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_cart_item(row: PgRow) -> Result<CartItem> {
        Ok(CartItem {
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            quantity: to_u32("cart quantity", row.try_get("quantity")?)?,
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            quantity: to_u32("reservation quantity", row.try_get("quantity")?)?,
            state: row.try_get::<String, _>("state")?.parse()?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_lease(row: PgRow) -> Result<DispatchLease> {
        Ok(DispatchLease {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            dispatch_id: DispatchId::from_uuid(row.try_get::<Uuid, _>("dispatch_id")?),
            partner_id: row
                .try_get::<Option<Uuid>, _>("partner_id")?
                .map(UserId::from_uuid),
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_order_header(row: &PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            store_id: StoreId::from_uuid(row.try_get::<Uuid, _>("store_id")?),
            delivery_partner_id: row
                .try_get::<Option<Uuid>, _>("delivery_partner_id")?
                .map(UserId::from_uuid),
            items: Vec::new(),
            total_price: Money::from_cents(row.try_get("total_price_cents")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            accepted_at: row.try_get("accepted_at")?,
            delivered_at: row.try_get("delivered_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
        })
    }

    fn row_to_order_item(row: &PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            product_name: row.try_get("product_name")?,
            quantity: to_u32("order item quantity", row.try_get("quantity")?)?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            reservation_id: ReservationId::from_uuid(row.try_get::<Uuid, _>("reservation_id")?),
        })
    }

    fn row_to_profile(row: &PgRow) -> Result<DeliveryProfile> {
        Ok(DeliveryProfile {
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            location: location_from_row(row)?,
            status: row.try_get::<String, _>("status")?.parse()?,
            assigned_orders: BTreeSet::new(),
        })
    }

    /// Attaches items to order headers, preserving line order.
    async fn load_items(conn: &mut PgConnection, orders: &mut [Order]) -> Result<()> {
        if orders.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, product_name, quantity, unit_price_cents, reservation_id
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await?;

        let mut by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in &rows {
            let order_id: Uuid = row.try_get("order_id")?;
            by_order
                .entry(order_id)
                .or_default()
                .push(Self::row_to_order_item(row)?);
        }
        for order in orders.iter_mut() {
            order.items = by_order.remove(&order.id.as_uuid()).unwrap_or_default();
        }
        Ok(())
    }

    async fn fetch_order(conn: &mut PgConnection, id: OrderId, lock: bool) -> Result<Option<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut orders = [Self::row_to_order_header(&row)?];
        Self::load_items(conn, &mut orders).await?;
        let [order] = orders;
        Ok(Some(order))
    }

    async fn write_order_header(conn: &mut PgConnection, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, delivery_partner_id = $3, accepted_at = $4,
                delivered_at = $5, cancelled_at = $6
            WHERE id = $1
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.delivery_partner_id.map(|p| p.as_uuid()))
        .bind(order.accepted_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn attach_assignments(
        conn: &mut PgConnection,
        profiles: &mut [DeliveryProfile],
    ) -> Result<()> {
        if profiles.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = profiles.iter().map(|p| p.user_id.as_uuid()).collect();
        let rows = sqlx::query(
            "SELECT partner_id, order_id FROM delivery_assignments WHERE partner_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await?;

        let mut by_partner: HashMap<Uuid, BTreeSet<OrderId>> = HashMap::new();
        for row in rows {
            let partner: Uuid = row.try_get("partner_id")?;
            let order: Uuid = row.try_get("order_id")?;
            by_partner
                .entry(partner)
                .or_default()
                .insert(OrderId::from_uuid(order));
        }
        for profile in profiles.iter_mut() {
            profile.assigned_orders = by_partner
                .remove(&profile.user_id.as_uuid())
                .unwrap_or_default();
        }
        Ok(())
    }
}

fn to_u32(field: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| RepositoryError::OutOfRange { field, value })
}

fn location_from_row(row: &PgRow) -> Result<Option<GeoPoint>> {
    let lat: Option<f64> = row.try_get("latitude")?;
    let lon: Option<f64> = row.try_get("longitude")?;
    Ok(lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon)))
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, phone, role, deleted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                role = EXCLUDED.role,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query("SELECT id, email, phone, role, deleted_at FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_user)
            .transpose()
    }

    async fn save_store(&self, store: &Store) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stores (id, owner_id, address, latitude, longitude, status, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                address = EXCLUDED.address,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                status = EXCLUDED.status,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(store.id.as_uuid())
        .bind(store.owner_id.as_uuid())
        .bind(&store.address)
        .bind(store.location.map(|p| p.lat))
        .bind(store.location.map(|p| p.lon))
        .bind(store.status.as_str())
        .bind(store.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_store(&self, id: StoreId) -> Result<Option<Store>> {
        sqlx::query(
            r#"
            SELECT id, owner_id, address, latitude, longitude, status, deleted_at
            FROM stores
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_store)
        .transpose()
    }

    async fn save_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, store_id, name, category, price_cents, stock, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                store_id = EXCLUDED.store_id,
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                price_cents = EXCLUDED.price_cents,
                stock = EXCLUDED.stock,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(product.store_id.as_uuid())
        .bind(&product.name)
        .bind(&product.category)
        .bind(product.price.cents())
        .bind(i64::from(product.stock))
        .bind(product.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        sqlx::query(
            r#"
            SELECT id, store_id, name, category, price_cents, stock, deleted_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_product)
        .transpose()
    }

    async fn save_cart_item(&self, item: &CartItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cart_items (user_id, product_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, product_id) DO UPDATE SET quantity = EXCLUDED.quantity
            "#,
        )
        .bind(item.user_id.as_uuid())
        .bind(item.product_id.as_uuid())
        .bind(i64::from(item.quantity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cart_items(&self, user_id: UserId) -> Result<Vec<CartItem>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, product_id, quantity
            FROM cart_items
            WHERE user_id = $1
            ORDER BY product_id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_cart_item).collect()
    }

    async fn remove_cart_items(&self, user_id: UserId, product_ids: &[ProductId]) -> Result<()> {
        let ids: Vec<Uuid> = product_ids.iter().map(|p| p.as_uuid()).collect();
        sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND product_id = ANY($2)")
            .bind(user_id.as_uuid())
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn decrement_stock_if_available(
        &self,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE products SET stock = stock - $2 WHERE id = $1 AND stock >= $2",
        )
        .bind(product_id.as_uuid())
        .bind(i64::from(quantity))
        .execute(&self.pool)
        .await?;

        let decremented = result.rows_affected() == 1;
        if !decremented {
            metrics::counter!("stock_decrement_rejected_total").increment(1);
        }
        Ok(decremented)
    }

    async fn reserve_stock(&self, reservation: &Reservation) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE products SET stock = stock - $2 WHERE id = $1 AND stock >= $2",
        )
        .bind(reservation.product_id.as_uuid())
        .bind(i64::from(reservation.quantity))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            metrics::counter!("stock_decrement_rejected_total").increment(1);
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO reservations (id, product_id, quantity, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.product_id.as_uuid())
        .bind(i64::from(reservation.quantity))
        .bind(reservation.state.as_str())
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        sqlx::query(
            "SELECT id, product_id, quantity, state, created_at FROM reservations WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_reservation)
        .transpose()
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE reservations SET state = $2
            WHERE id = $1 AND state = $3
            RETURNING id, product_id, quantity, state, created_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(ReservationState::Released.as_str())
        .bind(ReservationState::Held.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let released = Self::row_to_reservation(row)?;

        let restocked: Option<i64> = sqlx::query_scalar(
            "UPDATE products SET stock = stock + $2 WHERE id = $1 RETURNING stock",
        )
        .bind(released.product_id.as_uuid())
        .bind(i64::from(released.quantity))
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(stock) = restocked {
            // Dropping the transaction rolls the release back.
            to_u32("stock", stock)?;
        }

        tx.commit().await?;
        Ok(Some(released))
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        sqlx::query(
            r#"
            UPDATE reservations SET state = $2
            WHERE id = $1 AND state = $3
            RETURNING id, product_id, quantity, state, created_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(ReservationState::Committed.as_str())
        .bind(ReservationState::Held.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_reservation)
        .transpose()
    }

    async fn stranded_reservations(&self) -> Result<Vec<(ReservationId, OrderStatus)>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, o.status
            FROM reservations r
            JOIN order_items i ON i.reservation_id = r.id
            JOIN orders o ON o.id = i.order_id
            WHERE r.state = $1 AND o.status = ANY($2)
            ORDER BY o.created_at ASC, r.id ASC
            "#,
        )
        .bind(ReservationState::Held.as_str())
        .bind(vec![
            OrderStatus::Cancelled.as_str(),
            OrderStatus::Delivered.as_str(),
        ])
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(ReservationId, OrderStatus)> {
                let id = ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?);
                let status: OrderStatus = row.try_get::<String, _>("status")?.parse()?;
                Ok((id, status))
            })
            .collect()
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, store_id, delivery_partner_id, total_price_cents,
                                status, created_at, accepted_at, delivered_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.store_id.as_uuid())
        .bind(order.delivery_partner_id.map(|p| p.as_uuid()))
        .bind(order.total_price.cents())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.accepted_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .execute(&mut *tx)
        .await?;

        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, product_id, product_name, quantity,
                                         unit_price_cents, reservation_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(position as i32)
            .bind(item.product_id.as_uuid())
            .bind(&item.product_name)
            .bind(i64::from(item.quantity))
            .bind(item.unit_price.cents())
            .bind(item.reservation_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_order(&mut conn, id, false).await
    }

    async fn orders_awaiting_courier(&self) -> Result<Vec<Order>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = $1 AND delivery_partner_id IS NULL \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(OrderStatus::ReadyForPickup.as_str())
            .fetch_all(&mut *conn)
            .await?;

        let mut orders = rows
            .iter()
            .map(Self::row_to_order_header)
            .collect::<Result<Vec<_>>>()?;
        Self::load_items(&mut conn, &mut orders).await?;
        Ok(orders)
    }

    async fn transition_order(&self, change: &StatusChange) -> Result<Option<Order>> {
        ensure_plain_transition(change)?;

        let mut tx = self.pool.begin().await?;
        let Some(mut order) = Self::fetch_order(&mut tx, change.order_id, true).await? else {
            return Ok(None);
        };
        if order.status != change.from {
            return Ok(None);
        }

        change.apply_to(&mut order);
        Self::write_order_header(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(Some(order))
    }

    async fn acquire_dispatch_lease(
        &self,
        lease: &DispatchLease,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_leases (order_id, dispatch_id, partner_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO UPDATE SET
                dispatch_id = EXCLUDED.dispatch_id,
                partner_id = EXCLUDED.partner_id,
                expires_at = EXCLUDED.expires_at
            WHERE dispatch_leases.expires_at <= $5
            "#,
        )
        .bind(lease.order_id.as_uuid())
        .bind(lease.dispatch_id.as_uuid())
        .bind(lease.partner_id.map(|p| p.as_uuid()))
        .bind(lease.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_dispatch_lease(&self, lease: &DispatchLease) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_leases SET partner_id = $3, expires_at = $4
            WHERE order_id = $1 AND dispatch_id = $2
            "#,
        )
        .bind(lease.order_id.as_uuid())
        .bind(lease.dispatch_id.as_uuid())
        .bind(lease.partner_id.map(|p| p.as_uuid()))
        .bind(lease.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_dispatch_lease(&self, order_id: OrderId) -> Result<Option<DispatchLease>> {
        sqlx::query(
            r#"
            SELECT order_id, dispatch_id, partner_id, expires_at
            FROM dispatch_leases
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_lease)
        .transpose()
    }

    async fn release_dispatch_lease(
        &self,
        order_id: OrderId,
        dispatch_id: DispatchId,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM dispatch_leases WHERE order_id = $1 AND dispatch_id = $2")
                .bind(order_id.as_uuid())
                .bind(dispatch_id.as_uuid())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn withdraw_dispatch(
        &self,
        change: &StatusChange,
    ) -> Result<Option<(Order, DispatchLease)>> {
        if (change.from, change.to) != (OrderStatus::ReadyForPickup, OrderStatus::Cancelled) {
            return Err(RepositoryError::UnsupportedTransition(change.to));
        }

        let mut tx = self.pool.begin().await?;
        let Some(mut order) = Self::fetch_order(&mut tx, change.order_id, true).await? else {
            return Ok(None);
        };
        if !order.is_awaiting_courier() {
            return Ok(None);
        }

        let lease = sqlx::query(
            r#"
            DELETE FROM dispatch_leases
            WHERE order_id = $1 AND expires_at > $2
            RETURNING order_id, dispatch_id, partner_id, expires_at
            "#,
        )
        .bind(change.order_id.as_uuid())
        .bind(change.at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(lease) = lease else {
            return Ok(None);
        };
        let lease = Self::row_to_lease(lease)?;

        change.apply_to(&mut order);
        Self::write_order_header(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(Some((order, lease)))
    }

    async fn save_delivery_profile(&self, profile: &DeliveryProfile) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO deliveries (user_id, latitude, longitude, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                status = EXCLUDED.status
            "#,
        )
        .bind(profile.user_id.as_uuid())
        .bind(profile.location.map(|p| p.lat))
        .bind(profile.location.map(|p| p.lon))
        .bind(profile.status.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM delivery_assignments WHERE partner_id = $1")
            .bind(profile.user_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        for order_id in &profile.assigned_orders {
            sqlx::query(
                r#"
                INSERT INTO delivery_assignments (order_id, partner_id, assigned_at)
                VALUES ($1, $2, NOW())
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(profile.user_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_delivery_profile(&self, user_id: UserId) -> Result<Option<DeliveryProfile>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT user_id, latitude, longitude, status FROM deliveries WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut profiles = [Self::row_to_profile(&row)?];
        Self::attach_assignments(&mut conn, &mut profiles).await?;
        let [profile] = profiles;
        Ok(Some(profile))
    }

    async fn available_partners(&self) -> Result<Vec<DeliveryProfile>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT user_id, latitude, longitude, status FROM deliveries WHERE status = $1",
        )
        .bind(PartnerStatus::Available.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut profiles = rows
            .iter()
            .map(Self::row_to_profile)
            .collect::<Result<Vec<_>>>()?;
        Self::attach_assignments(&mut conn, &mut profiles).await?;
        Ok(profiles)
    }

    async fn set_idle_partner_status(
        &self,
        user_id: UserId,
        status: PartnerStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries SET status = $2
            WHERE user_id = $1
              AND NOT EXISTS (SELECT 1 FROM delivery_assignments WHERE partner_id = $1)
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_partner_location(&self, user_id: UserId, location: GeoPoint) -> Result<bool> {
        let result =
            sqlx::query("UPDATE deliveries SET latitude = $2, longitude = $3 WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .bind(location.lat)
                .bind(location.lon)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_partner_if_available(&self, change: &StatusChange) -> Result<ClaimOutcome> {
        let Some(partner_id) = change.delivery_partner_id else {
            return Err(RepositoryError::UnsupportedTransition(change.to));
        };

        let mut tx = self.pool.begin().await?;
        let mut order = Self::fetch_order(&mut tx, change.order_id, true)
            .await?
            .ok_or(RepositoryError::OrderNotFound(change.order_id))?;
        if order.status != OrderStatus::ReadyForPickup {
            return Ok(ClaimOutcome::OrderNotReady(order.status));
        }

        let flipped = sqlx::query(
            "UPDATE deliveries SET status = $2 WHERE user_id = $1 AND status = $3",
        )
        .bind(partner_id.as_uuid())
        .bind(PartnerStatus::Busy.as_str())
        .bind(PartnerStatus::Available.as_str())
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            return Ok(ClaimOutcome::PartnerUnavailable);
        }

        sqlx::query(
            r#"
            INSERT INTO delivery_assignments (order_id, partner_id, assigned_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(change.order_id.as_uuid())
        .bind(partner_id.as_uuid())
        .bind(change.at)
        .execute(&mut *tx)
        .await?;

        change.apply_to(&mut order);
        Self::write_order_header(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(order))
    }

    async fn finish_delivery(
        &self,
        change: &StatusChange,
        partner_id: UserId,
    ) -> Result<Option<Order>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut order) = Self::fetch_order(&mut tx, change.order_id, true).await? else {
            return Ok(None);
        };
        if order.status != change.from
            || order.status != OrderStatus::OutForDelivery
            || order.delivery_partner_id != Some(partner_id)
        {
            return Ok(None);
        }

        change.apply_to(&mut order);
        Self::write_order_header(&mut tx, &order).await?;

        sqlx::query("DELETE FROM delivery_assignments WHERE order_id = $1")
            .bind(change.order_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE deliveries SET status = $2
            WHERE user_id = $1 AND status = $3
              AND NOT EXISTS (SELECT 1 FROM delivery_assignments WHERE partner_id = $1)
            "#,
        )
        .bind(partner_id.as_uuid())
        .bind(PartnerStatus::Available.as_str())
        .bind(PartnerStatus::Busy.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(order))
    }
}
