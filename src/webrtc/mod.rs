//! WebRTC signaling and transport plumbing
//!
//! ```text
//!  SessionOrchestrator
//!     |            ^
//!     | envelopes  | RelayEvent
//!     v            |
//!  SignalChannel (WebSocket) <------> Relay <------> other participants
//!
//!  PeerSession --> PeerTransport (RTCPeerConnection)
//!                      |
//!                      +-- TransportEvent (candidate, track, state) --> event loop
//! ```

pub mod channel;
pub mod mdns;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use channel::{RelayEvent, SignalChannel, SignalConnector, WsSignalChannel, WsSignalConnector};
pub use peer::{RtcTransport, RtcTransportFactory};
pub use signaling::{
    IceCandidate, ParticipantId, SdpType, SessionDescription, SignalBody, SignalEnvelope,
};
pub use transport::{
    ConnectionState, PeerTransport, TransportEvent, TransportEventKind, TransportEventSink,
    TransportFactory,
};
