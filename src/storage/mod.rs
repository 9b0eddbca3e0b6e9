//! Undo storage: configuration, observability hooks and the undo layer.

/// Observability hooks for slot and page accounting.
pub mod metrics;

/// Tunables loadable from TOML.
pub mod options;

/// Undo segments, rollback segments and history lists.
pub mod undo;
