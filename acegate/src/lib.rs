//! acegate — HTTP streaming gateway fronting a fleet of P2P video engines.
//!
//! Player clients ask for a stream by content id; the gateway picks a
//! healthy engine (via the orchestrator, or a static fallback), opens a
//! per-request playback session, pipes the raw media bytes back, and
//! reports the stream lifecycle so fleet capacity decisions stay accurate.

pub mod api;
pub mod config;
pub mod debug;
pub mod logging;
pub mod stream;
