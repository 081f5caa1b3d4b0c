//! Configuration module for TableCopy
//!
//! Provides the transfer configuration: file loading, environment
//! overrides and validation.

mod settings;

pub use settings::*;
