//! Core checkout engine.
//!
//! This crate implements the exactly-once order lifecycle: the order state
//! machine and its static transition table, the idempotency gateway for
//! client commands, the inbox for inbound notifications, the inventory
//! reservation ledger and the transactional outbox. The engine and builder
//! wire these together over one storage handle, one bus and one clock.

pub mod builder;
pub mod engine;
pub mod handlers;
pub mod idempotency;
pub mod inbox;
pub mod inventory;
pub mod outbox;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{BuilderError, CheckoutBuilder, CheckoutFactories};
pub use engine::{periodic::PeriodicTask, CheckoutEngine, EngineError};
pub use handlers::{NotificationOutcome, OrderError, OrderHandler, PaymentError, PaymentHandler};
pub use idempotency::{IdempotencyError, IdempotencyGateway, RecordState, StartOutcome};
pub use inbox::{Inbox, InboxError};
pub use inventory::{ConfirmOutcome, InventoryError, InventoryLedger, ReleaseOutcome, ReserveOutcome};
pub use outbox::{OutboxError, OutboxPublisher, PublishReport};
pub use state::{Operation, OrderStateError, OrderStateMachine, TransitionOutcome, TransitionRequest};
