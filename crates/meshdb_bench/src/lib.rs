//! Benchmark helpers for MeshDB.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
