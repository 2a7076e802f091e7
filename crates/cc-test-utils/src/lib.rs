//! # CC Test Utilities
//!
//! Shared test utilities for the Call Controller (CC) service.
//!
//! ## Modules
//!
//! - `recording_sink` - notification sink that records every delivery
//! - `fixtures` - a fully wired in-memory stack and request builders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let stack = TestStack::new();
//!     let call = stack.start_call(1, &[2]).await;
//!     let invitation = stack.invitation_for(&call.call_id, 2).await;
//!     assert_eq!(stack.sink.names_for(2), vec!["incoming_call"]);
//! }
//! ```

pub mod fixtures;
pub mod recording_sink;

// Re-export commonly used items
pub use fixtures::*;
pub use recording_sink::*;
