use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, OrderStatus},
        order_address::{self, AddressKind},
        order_item, product, product_variant,
    },
    errors::ServiceError,
    events::{Event, EventSender, OrderSnapshot},
    services::{
        inventory_validator::{PricedLine, ProductStock, StockLookup, StockSnapshot, ValidatedCart, VariantStock},
        order_status::admin_transition,
    },
};

const ORDER_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Postal address as supplied by the shopper or the payment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct AddressInput {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 200))]
    pub line1: String,
    #[validate(length(max = 200))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(max = 100))]
    pub region: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    /// ISO 3166-1 alpha-2
    #[validate(length(equal = 2))]
    pub country: String,
    #[validate(length(max = 40))]
    pub phone: Option<String>,
}

/// Everything needed to persist a validated checkout.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: Option<Uuid>,
    pub customer_email: String,
    pub currency: String,
    pub shipping_method: String,
    pub cart: ValidatedCart,
    pub shipping_address: AddressInput,
    pub billing_address: Option<AddressInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub addresses: Vec<order_address::Model>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    RolledBack,
    /// Nothing to undo; an earlier attempt already removed the order
    AlreadyAbsent,
}

/// `ORD-YYYYMMDD-XXXXXXXX`
pub fn generate_order_number() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ORDER_NUMBER_ALPHABET[rng.gen_range(0..ORDER_NUMBER_ALPHABET.len())] as char)
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Writes the address of `kind` for an order, replacing any existing one.
pub(crate) async fn upsert_address<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    kind: AddressKind,
    input: &AddressInput,
) -> Result<order_address::Model, ServiceError> {
    let now = Utc::now();
    let existing = order_address::Entity::find()
        .filter(order_address::Column::OrderId.eq(order_id))
        .filter(order_address::Column::Kind.eq(kind))
        .one(conn)
        .await?;

    let mut active: order_address::ActiveModel = match existing {
        Some(model) => model.into(),
        None => order_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            kind: Set(kind),
            created_at: Set(now),
            ..Default::default()
        },
    };

    active.name = Set(input.name.clone());
    active.line1 = Set(input.line1.clone());
    active.line2 = Set(input.line2.clone());
    active.city = Set(input.city.clone());
    active.region = Set(input.region.clone());
    active.postal_code = Set(input.postal_code.clone());
    active.country = Set(input.country.clone());
    active.phone = Set(input.phone.clone());
    active.updated_at = Set(now);

    let saved = if active.id.is_unchanged() {
        active.update(conn).await?
    } else {
        active.insert(conn).await?
    };
    Ok(saved)
}

/// Sets the reconciliation flag on an order.
pub(crate) async fn flag_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    note: &str,
) -> Result<(), ServiceError> {
    order::Entity::update_many()
        .col_expr(order::Column::NeedsReconciliation, Expr::value(true))
        .col_expr(order::Column::ReconciliationNote, Expr::value(note.to_string()))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Moves `order` to `status` if nobody changed it since it was read.
///
/// Also records `payment_reference` when given. Bumps `version`.
pub(crate) async fn guarded_update<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    status: OrderStatus,
    payment_reference: Option<&str>,
) -> Result<order::Model, ServiceError> {
    let mut update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(status))
        .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));

    if let Some(reference) = payment_reference {
        update = update.col_expr(
            order::Column::PaymentReference,
            Expr::value(reference.to_string()),
        );
    }

    let result = update
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(order.status))
        .filter(order::Column::Version.eq(order.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(order_id = %order.id, "order changed underneath a status update");
        return Err(ServiceError::ConcurrentModification(order.id));
    }

    order::Entity::find_by_id(order.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))
}

/// Persistence for orders and the stock they consume.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Reserves stock and writes a PENDING order, its items and addresses in
    /// one transaction. Any line that cannot be reserved aborts the lot.
    #[instrument(skip(self, new_order), fields(lines = new_order.cart.lines.len()))]
    pub async fn create_pending_order(
        &self,
        new_order: NewOrder,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        match insert_order_rows(&txn, &new_order).await {
            Ok(order) => {
                txn.commit().await?;
                info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "order created");
                Ok(order)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!("Failed to roll back order creation: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn set_payment_reference(
        &self,
        order_id: Uuid,
        reference: &str,
    ) -> Result<(), ServiceError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::PaymentReference, Expr::value(reference.to_string()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(())
    }

    /// Undoes [`create_pending_order`](Self::create_pending_order): restores
    /// stock and deletes the order with its items and addresses.
    ///
    /// Safe to repeat. Refuses to touch an order that already left PENDING.
    #[instrument(skip(self))]
    pub async fn compensate_order(
        &self,
        order_id: Uuid,
    ) -> Result<CompensationOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        match remove_order_rows(&txn, order_id).await {
            Ok(outcome) => {
                txn.commit().await?;
                if outcome == CompensationOutcome::RolledBack {
                    info!(%order_id, "order rolled back and stock restored");
                }
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!("Failed to roll back compensation: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub async fn flag_for_reconciliation(
        &self,
        order_id: Uuid,
        note: &str,
    ) -> Result<(), ServiceError> {
        flag_order(&*self.db, order_id, note).await
    }

    pub async fn find_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::PaymentReference.eq(reference))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn get_order_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await?;
        let addresses = order_address::Entity::find()
            .filter(order_address::Column::OrderId.eq(order_id))
            .order_by_asc(order_address::Column::Kind)
            .all(db)
            .await?;

        Ok(OrderDetails {
            order,
            items,
            addresses,
        })
    }

    /// Applies an operator status change through the state machine.
    #[instrument(skip(self))]
    pub async fn apply_admin_transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let result = async {
            let order = order::Entity::find_by_id(order_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
            let transition = admin_transition(order.status, target)?;
            let updated = guarded_update(&txn, &order, transition.to, None).await?;
            Ok::<_, ServiceError>((transition, updated))
        }
        .await;

        let (transition, updated) = match result {
            Ok(value) => {
                txn.commit().await?;
                value
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!("Failed to roll back admin transition: {}", rollback_err);
                }
                return Err(e);
            }
        };

        info!(%order_id, from = %transition.from, to = %transition.to, "admin status change applied");
        let snapshot = OrderSnapshot::from(&updated);
        self.event_sender.publish(if transition.to == OrderStatus::Cancelled {
            Event::OrderCancelled(snapshot)
        } else {
            Event::OrderStatusChanged {
                order: snapshot,
                from: transition.from,
                to: transition.to,
            }
        });

        Ok(updated)
    }
}

#[async_trait]
impl StockLookup for OrderService {
    async fn snapshot(
        &self,
        product_ids: &[Uuid],
        variant_ids: &[Uuid],
    ) -> Result<StockSnapshot, ServiceError> {
        let db = &*self.db;
        let mut snapshot = StockSnapshot::default();

        if !product_ids.is_empty() {
            let products = product::Entity::find()
                .filter(product::Column::Id.is_in(product_ids.iter().copied()))
                .all(db)
                .await?;
            snapshot.products.extend(products.into_iter().map(|p| {
                (
                    p.id,
                    ProductStock {
                        price: p.price,
                        stock: p.stock,
                    },
                )
            }));
        }

        if !variant_ids.is_empty() {
            let variants = product_variant::Entity::find()
                .filter(product_variant::Column::Id.is_in(variant_ids.iter().copied()))
                .all(db)
                .await?;
            snapshot.variants.extend(variants.into_iter().map(|v| {
                (
                    v.id,
                    VariantStock {
                        product_id: v.product_id,
                        price: v.price,
                        stock: v.stock,
                    },
                )
            }));
        }

        Ok(snapshot)
    }
}

async fn insert_order_rows(
    txn: &DatabaseTransaction,
    new_order: &NewOrder,
) -> Result<order::Model, ServiceError> {
    for line in &new_order.cart.lines {
        reserve_stock(txn, line).await?;
    }

    let now = Utc::now();
    let order_id = Uuid::new_v4();
    let order = order::ActiveModel {
        id: Set(order_id),
        order_number: Set(generate_order_number()),
        status: Set(OrderStatus::Pending),
        customer_id: Set(new_order.customer_id),
        customer_email: Set(new_order.customer_email.clone()),
        currency: Set(new_order.currency.clone()),
        shipping_method: Set(new_order.shipping_method.clone()),
        subtotal: Set(new_order.cart.subtotal),
        shipping_total: Set(new_order.cart.shipping_total),
        total: Set(new_order.cart.total),
        payment_reference: Set(None),
        needs_reconciliation: Set(false),
        reconciliation_note: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        version: Set(1),
    }
    .insert(txn)
    .await?;

    let items = new_order.cart.lines.iter().map(|line| order_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        product_id: Set(line.product_id),
        variant_id: Set(line.variant_id),
        quantity: Set(line.quantity),
        unit_price: Set(line.unit_price),
        line_total: Set(line.line_total),
        created_at: Set(now),
    });
    order_item::Entity::insert_many(items)
        .exec_without_returning(txn)
        .await?;

    upsert_address(txn, order_id, AddressKind::Shipping, &new_order.shipping_address).await?;
    if let Some(billing) = &new_order.billing_address {
        upsert_address(txn, order_id, AddressKind::Billing, billing).await?;
    }

    Ok(order)
}

/// Conditional decrement: only succeeds while enough stock remains.
async fn reserve_stock(txn: &DatabaseTransaction, line: &PricedLine) -> Result<(), ServiceError> {
    let now = Utc::now();
    let rows_affected = match line.variant_id {
        Some(variant_id) => {
            product_variant::Entity::update_many()
                .col_expr(
                    product_variant::Column::Stock,
                    Expr::col(product_variant::Column::Stock).sub(line.quantity),
                )
                .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
                .filter(product_variant::Column::Id.eq(variant_id))
                .filter(product_variant::Column::Stock.gte(line.quantity))
                .exec(txn)
                .await?
                .rows_affected
        }
        None => {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(line.product_id))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(txn)
                .await?
                .rows_affected
        }
    };

    if rows_affected == 0 {
        let available = current_stock(txn, line).await?;
        warn!(
            line = line.line,
            requested = line.quantity,
            available,
            "stock reservation lost a race"
        );
        return Err(ServiceError::InsufficientStock {
            line: line.line,
            requested: line.quantity,
            available,
        });
    }
    Ok(())
}

async fn current_stock(txn: &DatabaseTransaction, line: &PricedLine) -> Result<i32, ServiceError> {
    match line.variant_id {
        Some(variant_id) => product_variant::Entity::find_by_id(variant_id)
            .one(txn)
            .await?
            .map(|v| v.stock)
            .ok_or(ServiceError::VariantNotFound {
                line: line.line,
                variant_id,
            }),
        None => product::Entity::find_by_id(line.product_id)
            .one(txn)
            .await?
            .map(|p| p.stock)
            .ok_or(ServiceError::ProductNotFound {
                line: line.line,
                product_id: line.product_id,
            }),
    }
}

async fn restore_stock(txn: &DatabaseTransaction, item: &order_item::Model) -> Result<(), ServiceError> {
    let now = Utc::now();
    match item.variant_id {
        Some(variant_id) => {
            product_variant::Entity::update_many()
                .col_expr(
                    product_variant::Column::Stock,
                    Expr::col(product_variant::Column::Stock).add(item.quantity),
                )
                .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
                .filter(product_variant::Column::Id.eq(variant_id))
                .exec(txn)
                .await?;
        }
        None => {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(item.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(item.product_id))
                .exec(txn)
                .await?;
        }
    }
    Ok(())
}

async fn remove_order_rows(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> Result<CompensationOutcome, ServiceError> {
    let Some(order) = order::Entity::find_by_id(order_id).one(txn).await? else {
        return Ok(CompensationOutcome::AlreadyAbsent);
    };

    if order.status != OrderStatus::Pending {
        return Err(ServiceError::InvalidTransition {
            from: order.status,
            attempted: "compensating rollback".to_string(),
        });
    }

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(txn)
        .await?;
    for item in &items {
        restore_stock(txn, item).await?;
    }

    order_address::Entity::delete_many()
        .filter(order_address::Column::OrderId.eq(order_id))
        .exec(txn)
        .await?;
    order_item::Entity::delete_many()
        .filter(order_item::Column::OrderId.eq(order_id))
        .exec(txn)
        .await?;
    order::Entity::delete_by_id(order_id).exec(txn).await?;

    Ok(CompensationOutcome::RolledBack)
}
