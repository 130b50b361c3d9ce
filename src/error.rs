//! Application-wide error alias.

/// Convenience result type used across the crate.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
