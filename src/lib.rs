//! Cyris library crate.
//!
//! Cyber range orchestration: a declarative range description is compiled
//! into a dependency-ordered plan, materialized as virtual machines and
//! networks across one or more hypervisor hosts, configured post-boot over
//! SSH, and tracked in a durable registry until destruction.

/// Core library modules and APIs.
pub mod core;

/// CLI argument parsing and adapters (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
pub mod app;

mod config;
mod error;

pub use config::*;
pub use error::*;
