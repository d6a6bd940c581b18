//! hiera-audit library
//!
//! Resolves a fact-driven Hiera hierarchy into concrete data files, flattens
//! their content and reconciles it against logged key lookups to report dead,
//! missing and duplicated keys.

pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod flatten;
pub mod format;
pub mod hierarchy;
pub mod logging;
pub mod reconcile;
pub mod retention;
pub mod service;
pub mod sources;
pub mod substitute;
