//! grabby Library
//!
//! Copies files off removable volumes (camera cards, recorders, USB sticks)
//! as soon as they are mounted, renames them by capture date and optionally
//! clears them from the device once the copy is committed.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`core`] - Configuration, grab state, path rules, renaming, the transfer
//!   executor and the session supervisor
//! - [`device`] - Mount enumeration, attach/detach monitoring and profile
//!   matching
//! - [`cli`] - Command-line interface (only used by the binary)
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use grabby::core::config::Config;
//! use grabby::core::config_watch::ConfigHandle;
//! use grabby::core::grabber::{GrabContext, Grabber};
//! use grabby::core::notifier::LogNotifier;
//! use grabby::core::state::GrabStateStore;
//! use grabby::device::monitor_from_config;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("grabby.toml")?;
//!     let store = Arc::new(GrabStateStore::open(&config.state.state_file)?);
//!     let context = GrabContext::new(store, Arc::new(LogNotifier));
//!
//!     let (tx, rx) = crossbeam_channel::unbounded();
//!     let mut monitor = monitor_from_config(&config);
//!     monitor.start(tx)?;
//!
//!     let shutdown = Arc::new(AtomicBool::new(false));
//!     Grabber::new(ConfigHandle::new(config), context, shutdown).run(rx, monitor.lost_devices());
//!     monitor.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! - A source file is deleted only after its copy is fully written, synced,
//!   renamed into place and recorded in the grab state
//! - Files already recorded for a device are never copied twice
//! - Concurrent sessions never write to the same target path
//! - One device is grabbed by at most one session at a time

pub mod cli;
pub mod core;
pub mod device;

#[cfg(test)]
mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
