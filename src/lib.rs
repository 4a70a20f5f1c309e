//! calls-client - negotiation engine for SFU-backed real-time media sessions
//!
//! One peer connection per client, a signaling session bound to it, and
//! push/pull track pipelines that renegotiate through a single serialized
//! lane. The connection is replaced, and the session re-derived, whenever
//! it fails.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod utils;
pub mod webrtc;

pub use error::{AppError, Result};
