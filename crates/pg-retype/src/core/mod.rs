//! Shared building blocks.

pub mod identifier;

pub use identifier::{base_type, qualify_pg, quote_pg, sanitize_type, validate_identifier};
