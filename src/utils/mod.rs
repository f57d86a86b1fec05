//!
//! Utility module for the state synchronizer.
//!
//! Re-exports hex helpers for field elements and event words used throughout the codebase.
/// Hex encoding helpers for field elements
pub mod index;

pub use index::{field_from_hex, field_to_hex, format_field, parse_hex_u64};
