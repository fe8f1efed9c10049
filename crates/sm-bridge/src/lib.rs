//! Network edge of shellmux.
//!
//! - [`ws`]: the `/ws` socket, one per browser tab, carrying many sessions
//! - [`protocol`]: the JSON wire messages
//! - [`multiplexer`]: routes messages between sockets and the session registry
//! - [`http_api`]: router, shared state, AI chat, health, stats and metrics
//! - [`auth`]: pre-shared API key middleware
//! - [`profiles`]: saved connection profiles behind `/api/configs`

pub mod api_error;
pub mod auth;
pub mod http_api;
pub mod multiplexer;
pub mod profiles;
pub mod protocol;
pub mod ws;

pub use http_api::{api_router, AppState};
pub use multiplexer::{ClientConnection, Multiplexer, MuxSettings};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
