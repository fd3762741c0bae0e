//! Utility functions and helpers for transit-core

pub mod error_logging;

pub use error_logging::ErrorLogging;
