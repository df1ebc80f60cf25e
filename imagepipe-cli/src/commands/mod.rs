//! CLI command implementations.
//!
//! Each subcommand has its own module with argument definitions and handlers.
//!
//! # Command Modules
//!
//! - [`cache`] - Cache management (stats, clear, prune, trim, evict)
//! - [`config`] - Configuration file (path, show, init)
//! - [`fetch`] - Load one image through every cache tier
//! - [`prefetch`] - Warm the caches for a list of images

pub mod cache;
pub mod common;
pub mod config;
pub mod fetch;
pub mod prefetch;
