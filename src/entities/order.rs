use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Lifecycle status of an order.
///
/// `Delivered` and `Cancelled` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Parses a status name, rejecting anything outside the closed set.
    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        value
            .trim()
            .parse::<OrderStatus>()
            .map_err(|_| ServiceError::InvalidStatus(format!("unknown order status '{}'", value)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub status: OrderStatus,
    #[sea_orm(nullable)]
    pub customer_id: Option<Uuid>,
    pub customer_email: String,
    pub currency: String,
    pub shipping_method: String,
    #[sea_orm(column_type = "Decimal(None)")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub shipping_total: Decimal,
    #[sea_orm(column_type = "Decimal(None)")]
    pub total: Decimal,
    /// Provider authorization id; unset until the gateway answers
    #[sea_orm(nullable)]
    pub payment_reference: Option<String>,
    pub needs_reconciliation: bool,
    #[sea_orm(nullable)]
    pub reconciliation_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_address::Entity")]
    OrderAddress,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_address::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderAddress.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
