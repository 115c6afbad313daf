//! Domain layer - port definitions
//!
//! The traits the reconciler and the migration tracker are written against;
//! `cluster` and `backends` provide the adapters.

pub mod ports;

pub use ports::*;
