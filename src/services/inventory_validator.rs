//! Cart validation against a stock snapshot.
//!
//! Pricing is pure: [`price_cart`] takes a [`StockSnapshot`] and never touches
//! the database. [`InventoryValidator`] gathers the snapshot through a
//! [`StockLookup`] and then prices the cart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

/// One requested cart line as the client sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct CartLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    /// Price the client displayed; only used to rebuild the claimed total
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductStock {
    pub price: Decimal,
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantStock {
    pub product_id: Uuid,
    pub price: Option<Decimal>,
    pub stock: i32,
}

/// Point-in-time view of the catalog rows a cart refers to.
#[derive(Debug, Clone, Default)]
pub struct StockSnapshot {
    pub products: HashMap<Uuid, ProductStock>,
    pub variants: HashMap<Uuid, VariantStock>,
}

/// Source of catalog prices and stock levels.
#[async_trait]
pub trait StockLookup: Send + Sync {
    async fn snapshot(
        &self,
        product_ids: &[Uuid],
        variant_ids: &[Uuid],
    ) -> Result<StockSnapshot, ServiceError>;
}

/// A line priced at the server-side price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    /// 1-based position in the request
    pub line: usize,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedCart {
    pub lines: Vec<PricedLine>,
    pub subtotal: Decimal,
    pub shipping_total: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StockKey {
    Product(Uuid),
    Variant(Uuid),
}

/// Prices `lines` against `snapshot`.
///
/// Stock is checked cumulatively: two lines for the same variant must fit in
/// its stock together. The claimed total is `expected_total` when given,
/// otherwise the client's own unit prices plus shipping; it must equal the
/// computed total exactly.
pub fn price_cart(
    lines: &[CartLine],
    snapshot: &StockSnapshot,
    shipping: Decimal,
    expected_total: Option<Decimal>,
) -> Result<ValidatedCart, ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "cart must contain at least one line".to_string(),
        ));
    }
    if shipping < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "shipping rate cannot be negative".to_string(),
        ));
    }

    let mut reserved: HashMap<StockKey, i32> = HashMap::new();
    let mut priced = Vec::with_capacity(lines.len());
    let mut claimed_subtotal = Decimal::ZERO;
    let mut subtotal = Decimal::ZERO;
    let mut first_mismatch = None;

    for (index, line) in lines.iter().enumerate() {
        let number = index + 1;

        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "line {}: quantity must be positive",
                number
            )));
        }

        let product =
            snapshot
                .products
                .get(&line.product_id)
                .ok_or(ServiceError::ProductNotFound {
                    line: number,
                    product_id: line.product_id,
                })?;

        let (key, available, price) = match line.variant_id {
            Some(variant_id) => {
                let variant = snapshot
                    .variants
                    .get(&variant_id)
                    .filter(|v| v.product_id == line.product_id)
                    .ok_or(ServiceError::VariantNotFound {
                        line: number,
                        variant_id,
                    })?;
                (
                    StockKey::Variant(variant_id),
                    variant.stock,
                    variant.price.unwrap_or(product.price),
                )
            }
            None => (
                StockKey::Product(line.product_id),
                product.stock,
                product.price,
            ),
        };

        let requested = reserved.entry(key).or_insert(0);
        *requested = requested.saturating_add(line.quantity);
        if *requested > available {
            return Err(ServiceError::InsufficientStock {
                line: number,
                requested: *requested,
                available,
            });
        }

        if price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "line {}: product has no sellable price",
                number
            )));
        }

        if first_mismatch.is_none() && line.unit_price != price {
            first_mismatch = Some(number);
        }

        let quantity = Decimal::from(line.quantity);
        claimed_subtotal = line
            .unit_price
            .checked_mul(quantity)
            .and_then(|claimed_line| claimed_subtotal.checked_add(claimed_line))
            .ok_or_else(|| amount_overflow(Some(number)))?;
        let line_total = price
            .checked_mul(quantity)
            .ok_or_else(|| amount_overflow(Some(number)))?;
        subtotal = subtotal
            .checked_add(line_total)
            .ok_or_else(|| amount_overflow(Some(number)))?;
        priced.push(PricedLine {
            line: number,
            product_id: line.product_id,
            variant_id: line.variant_id,
            quantity: line.quantity,
            unit_price: price,
            line_total,
        });
    }

    let total = subtotal
        .checked_add(shipping)
        .ok_or_else(|| amount_overflow(None))?;
    let claimed = match expected_total {
        Some(claimed) => claimed,
        None => claimed_subtotal
            .checked_add(shipping)
            .ok_or_else(|| amount_overflow(None))?,
    };

    if claimed != total {
        warn!(
            claimed = %claimed,
            computed = %total,
            line = ?first_mismatch,
            "cart total does not match server-side pricing"
        );
        return Err(ServiceError::TotalMismatch {
            claimed,
            computed: total,
            line: first_mismatch,
        });
    }

    Ok(ValidatedCart {
        lines: priced,
        subtotal,
        shipping_total: shipping,
        total,
    })
}

fn amount_overflow(line: Option<usize>) -> ServiceError {
    match line {
        Some(number) => ServiceError::ValidationError(format!(
            "line {}: amount is out of range",
            number
        )),
        None => ServiceError::ValidationError("cart total is out of range".to_string()),
    }
}

/// Validates carts against live catalog data.
#[derive(Clone)]
pub struct InventoryValidator {
    lookup: Arc<dyn StockLookup>,
}

impl InventoryValidator {
    pub fn new(lookup: Arc<dyn StockLookup>) -> Self {
        Self { lookup }
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn validate(
        &self,
        lines: &[CartLine],
        shipping: Decimal,
        expected_total: Option<Decimal>,
    ) -> Result<ValidatedCart, ServiceError> {
        let mut product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        product_ids.sort_unstable();
        product_ids.dedup();
        let mut variant_ids: Vec<Uuid> = lines.iter().filter_map(|l| l.variant_id).collect();
        variant_ids.sort_unstable();
        variant_ids.dedup();

        let snapshot = self.lookup.snapshot(&product_ids, &variant_ids).await?;
        price_cart(lines, &snapshot, shipping, expected_total)
    }
}
