//! Core functionality module
//!
//! This module contains the grab pipeline itself: configuration, the path
//! rules and rename strategy applied to each file, the transfer executor, the
//! persistent grab state, session summaries and the supervisor that ties them
//! together.
//!
//! # Submodules
//!
//! - `config` - Configuration loading, saving, and validation
//! - `config_watch` - Hot reload of the configuration file
//! - `error` - Error types and result aliases
//! - `rules` - Include/exclude globs, source directories, target templates
//! - `rename` - Naming strategies, metadata probe, target reservations
//! - `session` - Per-device session and per-file state machine
//! - `transfer` - Copy, verify, commit and delete
//! - `state` - Completed-file and session history store
//! - `notifier` - Session summaries and their sinks
//! - `grabber` - Event-driven session supervisor

pub mod config;
pub mod config_watch;
pub mod error;
pub mod grabber;
pub mod notifier;
pub mod rename;
pub mod rules;
pub mod session;
pub mod state;
pub mod transfer;
