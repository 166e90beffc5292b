//! room-mesh - full-mesh WebRTC room negotiation
//!
//! Every participant in a room keeps a direct peer connection to every
//! other participant. A relay only forwards signaling envelopes between
//! them; this crate drives the per-peer offer/answer/candidate exchange on
//! top of it.

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod mesh;
pub mod webrtc;

#[cfg(test)]
mod testutil;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use mesh::{MeshHandle, MeshObserver, SessionOrchestrator};
