//! CLI command implementations.

pub mod dump;
pub mod identifier;
pub mod page;
