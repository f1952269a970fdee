//! The calling-context model and the invalidation analysis built on it.

pub mod calling_context;
pub mod invalidation;
