//! Control layer exposing engine state to external tooling.

/// High-level control API for the published engine.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
