pub mod coupon;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod product;

pub use order::OrderStatus;
