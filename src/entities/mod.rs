pub mod customer;
pub mod order;
pub mod order_address;
pub mod order_item;
pub mod processed_webhook_event;
pub mod product;
pub mod product_variant;
