//! Common types module for the checkout system.
//!
//! This module defines the persisted record shapes and shared value types used
//! throughout the checkout workspace. Every crate that reads or writes a record
//! goes through the definitions here, so the field-level shape of each type is
//! the compatibility surface for any storage substitution.

/// Command and response types for the command submission interface.
pub mod api;
/// Clock abstraction injected into every component.
pub mod clock;
/// Outbox events and the record forwarded to the message bus.
pub mod events;
/// Idempotency records owned by the idempotency gateway.
pub mod idempotency;
/// Inbox entries used for inbound notification deduplication.
pub mod inbox;
/// Stock rows and reservation markers.
pub mod inventory;
/// Orders and their lifecycle status.
pub mod order;
/// Payments and inbound payment notifications.
pub mod payment;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage tables known to the system.
pub mod storage;
/// Formatting helpers.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use api::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::*;
pub use idempotency::*;
pub use inbox::*;
pub use inventory::*;
pub use order::*;
pub use payment::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use utils::truncate_id;
pub use validation::*;
