//! # Configuration Modules
//!
//! Tunables of the realtime layer: pool size, timeouts, health sweep cadence
//! and the reconnection policy.

/// Realtime tunables loaded from JSON with per-field defaults.
pub mod config_realtime;
