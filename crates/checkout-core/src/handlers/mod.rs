//! Command and notification handlers.
//!
//! Client commands go through the order handler; inbound payment
//! notifications go through the payment handler.

pub mod order;
pub mod payment;

pub use order::{OrderError, OrderHandler};
pub use payment::{NotificationOutcome, PaymentError, PaymentHandler};
