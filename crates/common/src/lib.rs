//! Common types shared across Callgrid components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
