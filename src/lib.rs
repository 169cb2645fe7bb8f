//! Launchpad - extension runtime for a desktop launcher
//!
//! This library hosts third-party extension modules: it discovers them on
//! disk, loads each into its own context, tracks who disabled what, and hot
//! reloads when the extensions directory changes.
//!
//! # Modules
//!
//! - [`config`]: Configuration management and serialization
//! - [`extensions`]: Extension discovery, loading and supervision
//! - [`logging`]: Subscriber setup for the management CLI

pub mod config;
pub mod extensions;
pub mod logging;
