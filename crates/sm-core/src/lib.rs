//! Shared building blocks for the shellmux workspace: configuration, ids,
//! credentials, session states and the client-facing error codes.

pub mod config;
pub mod crypto;
pub mod error;
pub mod types;
