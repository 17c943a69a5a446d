//! Direct peer-to-peer links behind one interface
//!
//! A transport is an endpoint factory in the style of a browser data channel:
//! the initiator produces an offer, the responder turns it into an answer,
//! both sides may trade candidates, and the transport reports when the link
//! opens. The connection manager drives the handshake; the transport only
//! moves bytes.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

use crate::error::TransportError;
use shared::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The direct link to the peer is usable
    Opened(PeerId),
    /// Bytes received from an open link
    Data(PeerId, Vec<u8>),
    /// The link dropped or the remote side hung up
    Closed(PeerId),
    /// A local candidate that must reach the peer through signaling
    LocalCandidate(PeerId, String),
}

pub trait Transport {
    /// Prepares a local endpoint for `peer` and returns the offer data
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, TransportError>;

    /// Builds the local endpoint from a remote offer and returns the answer data
    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, TransportError>;

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), TransportError>;

    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), TransportError>;

    fn send(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Tears down the endpoint for `peer`; closing an unknown peer is a no-op
    fn close(&mut self, peer: &PeerId);

    /// Drains everything that happened since the last call
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}
