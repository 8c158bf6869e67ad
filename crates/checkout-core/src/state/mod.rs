//! State management for orders.
//!
//! This module provides the order state machine and the static transition
//! table it dispatches on.

pub mod order;
pub mod transitions;

pub use order::{OrderStateError, OrderStateMachine, TransitionOutcome, TransitionRequest};
pub use transitions::{Operation, Transition};
