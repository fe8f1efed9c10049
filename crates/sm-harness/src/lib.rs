//! Reliability plumbing shared by the shellmux services: per-principal rate
//! limiting, an explicit retry/backoff state machine, and cooperative
//! shutdown for background loops.

pub mod backoff;
pub mod rate_limiter;
pub mod shutdown;
