use shared::{EntityId, PeerId, ShapeError};
use thiserror::Error;

/// Failure classes of the synchronization core
///
/// Network failures are contained by the session: they are logged and turned
/// into session events, never returned from `SyncSession::tick`. The
/// local-API variants report misuse of `spawn_local` and friends.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("signaling relay unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("handshake with {peer} timed out after {attempts} attempt(s)")]
    HandshakeTimeout { peer: PeerId, attempts: u32 },

    #[error("peer {0} is not reachable through the relay")]
    PeerUnreachable(PeerId),

    #[error("link to {0} closed")]
    TransportClosed(PeerId),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),

    #[error("entity {0} is not owned by this peer")]
    NotOwner(EntityId),

    #[error("session has been torn down")]
    SessionClosed,
}

impl From<ShapeError> for SyncError {
    fn from(err: ShapeError) -> Self {
        SyncError::MalformedEnvelope(err.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(err: bincode::Error) -> Self {
        SyncError::MalformedEnvelope(err.to_string())
    }
}

/// Failures reported by a `Transport` implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint for peer {0}")]
    UnknownPeer(PeerId),

    #[error("link to {0} is not open")]
    NotOpen(PeerId),

    #[error("invalid signaling data: {0}")]
    BadSignal(String),

    #[error("datagram of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_becomes_malformed() {
        let err: SyncError = ShapeError::NonFinite("x").into();
        assert!(matches!(err, SyncError::MalformedEnvelope(ref msg) if msg.contains("x")));
    }

    #[test]
    fn test_error_messages() {
        let err = SyncError::HandshakeTimeout {
            peer: PeerId::new("peerX"),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "handshake with peerX timed out after 3 attempt(s)"
        );
        assert_eq!(
            TransportError::NotOpen(PeerId::new("a")).to_string(),
            "link to a is not open"
        );
    }
}
