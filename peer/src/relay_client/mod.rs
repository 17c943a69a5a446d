//! Access to the external signaling relay and room service

mod memory;
mod udp;

pub use memory::{MemoryRelay, MemoryRelayHandle};
pub use udp::UdpRelayClient;

use crate::error::SyncError;
use shared::{Member, PeerId, RoomId, SignalRecord};

/// Something the relay handed back from a mailbox read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxItem {
    Record { id: u64, record: SignalRecord },
    /// A record we posted could not be delivered because `to` is not in the room
    Undeliverable { to: PeerId },
}

/// Read/write mailbox used only to bootstrap direct links
pub trait Mailbox {
    fn post(&mut self, record: SignalRecord) -> Result<(), SyncError>;

    /// Returns records visible to `to`; the caller filters and acknowledges them
    fn fetch(&mut self, room: &RoomId, to: &PeerId) -> Result<Vec<MailboxItem>, SyncError>;

    fn remove(&mut self, room: &RoomId, ids: &[u64]) -> Result<(), SyncError>;
}

/// Room membership and host designation
pub trait RoomService {
    fn list_members(&mut self, room: &RoomId) -> Result<Vec<Member>, SyncError>;

    /// True once after every membership change
    fn membership_changed(&mut self) -> bool;
}
