//! Builders for constructing configurations in code.

pub mod config;
