//! Observability
//!
//! Structured audit events for dispatch and environment lifecycle.

pub mod audit;
