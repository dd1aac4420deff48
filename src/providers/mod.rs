//! External service implementations.
//!
//! - [`email`] - Mail transports (IMAP, in-memory) and message normalization

pub mod email;
