//! Shared helpers for the transports

pub mod sanitize;
pub mod staging;

pub use sanitize::sanitize_filename;
pub use staging::{StagedFile, StagingArea};
