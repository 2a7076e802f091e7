//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across the workspace. Database URLs
//! and any other credential-bearing configuration go through these so that
//! `{:?}` and tracing fields never print them.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnCredential {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let turn = TurnCredential {
//!     username: "relay".to_string(),
//!     credential: SecretString::from("s3cret"),
//! };
//!
//! assert!(!format!("{turn:?}").contains("s3cret"));
//! assert_eq!(turn.credential.expose_secret(), "s3cret");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
