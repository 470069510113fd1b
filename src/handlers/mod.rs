//! HTTP surface. Handlers stay thin: extract, call one service, wrap the
//! result in [`crate::ApiResponse`].

pub mod checkout;
pub mod coupons;
pub mod orders;
pub mod payments;

pub use crate::AppState;
