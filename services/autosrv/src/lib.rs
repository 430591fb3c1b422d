//! # Automation Service (autosrv)
//!
//! The Hearth automation engine. Devices publish state over MQTT; autosrv
//! maintains a cached view of device state, evaluates a user-defined library
//! of conditional rules, and publishes command messages back to devices when
//! rules fire. Rules can also fire on a time schedule, and concurrent rules
//! writing the same device attribute are resolved deterministically.
//!
//! ## Overview
//!
//! ```text
//! broker ──► debounce stream ──► device_update task ──► cache + index lookup
//!                                                          │
//! scheduler (cron) ────────────► evaluate_rule task ◄──────┘ (one per rule)
//!                                       │
//!                  redundancy check → conditions → conflict resolution
//!                                       │
//!                            devices/{id}/commands (QoS 1)
//! ```
//!
//! The HTTP CRUD surface, authentication, and remote access live elsewhere;
//! they drive this crate through [`engine::Engine`]'s entry points
//! (`refresh_rule`, `remove_rule`, `reindex`, `trigger_rule`).

/// Configuration management
pub mod config;

/// Condition-tree evaluation
pub mod condition_evaluator;

/// Engine core: lifecycle, ingress, update/evaluate handlers, dispatch
pub mod engine;

/// Error types and result handling
pub mod error;

/// Device→rule inverted index
pub mod index;

/// Store key naming
pub mod keys;

/// Domain models
pub mod models;

/// Relational store access
pub mod repository;

/// Cron scheduler
pub mod scheduler;

/// Durable task queue and worker pool
pub mod taskqueue;

/// Time-leaf extraction and cron synthesis
pub mod time_extractor;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use error::{AutosrvError, Result};
