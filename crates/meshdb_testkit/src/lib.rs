//! # MeshDB Testkit
//!
//! Test utilities for MeshDB.
//!
//! This crate provides:
//! - Mock connection manager, connections, transport and platform adapter
//! - A runtime fixture wired to those mocks
//! - Property-based test generators using proptest
//! - Stress helpers for concurrent auto-launch and cursor draining
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust
//! use meshdb_testkit::prelude::*;
//! use meshdb_core::AutoLaunchOption;
//!
//! let test = TestRuntime::new();
//! let props = kv_properties("notes");
//! test.enable_auto_launch(props.clone(), None, AutoLaunchOption::default()).unwrap();
//! assert_eq!(test.auto_launch().item_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod mocks;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::mocks::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use mocks::*;
pub use stress::*;
