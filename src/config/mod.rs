//! Configuration
//!
//! Engine settings, shared error types, and the loaders that build them.

pub mod loader;
pub mod types;
