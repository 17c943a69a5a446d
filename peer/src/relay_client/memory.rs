use super::{Mailbox, MailboxItem, RoomService};
use crate::error::SyncError;
use shared::{Member, PeerId, RoomId, SignalRecord};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
struct RoomState {
    members: Vec<Member>,
    mailbox: Vec<(u64, SignalRecord)>,
    version: u64,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<RoomId, RoomState>,
    next_record_id: u64,
    unavailable: bool,
}

/// In-process relay and room service shared by every session in a test
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Rc<RefCell<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: &RoomId, member: Member) {
        let mut state = self.state.borrow_mut();
        let room_state = state.rooms.entry(room.clone()).or_default();
        room_state.members.retain(|m| m.peer_id != member.peer_id);
        room_state.members.push(member);
        room_state.version += 1;
    }

    pub fn leave(&self, room: &RoomId, peer: &PeerId) {
        let mut state = self.state.borrow_mut();
        if let Some(room_state) = state.rooms.get_mut(room) {
            room_state.members.retain(|m| &m.peer_id != peer);
            room_state.version += 1;
        }
    }

    /// Simulates the relay being unreachable
    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().unavailable = !available;
    }

    pub fn pending_records(&self, room: &RoomId) -> usize {
        self.state
            .borrow()
            .rooms
            .get(room)
            .map_or(0, |r| r.mailbox.len())
    }

    pub fn handle(&self, room: &RoomId) -> MemoryRelayHandle {
        MemoryRelayHandle {
            room: room.clone(),
            seen_version: 0,
            state: Rc::clone(&self.state),
        }
    }
}

pub struct MemoryRelayHandle {
    room: RoomId,
    seen_version: u64,
    state: Rc<RefCell<RelayState>>,
}

impl MemoryRelayHandle {
    fn check_available(&self) -> Result<(), SyncError> {
        if self.state.borrow().unavailable {
            return Err(SyncError::SignalingUnavailable(
                "relay offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl Mailbox for MemoryRelayHandle {
    fn post(&mut self, record: SignalRecord) -> Result<(), SyncError> {
        self.check_available()?;
        let mut state = self.state.borrow_mut();
        let id = state.next_record_id;
        let room = state.rooms.entry(record.room.clone()).or_default();
        if !room.members.iter().any(|m| m.peer_id == record.to) {
            return Err(SyncError::PeerUnreachable(record.to));
        }
        room.mailbox.push((id, record));
        state.next_record_id += 1;
        Ok(())
    }

    fn fetch(&mut self, room: &RoomId, _to: &PeerId) -> Result<Vec<MailboxItem>, SyncError> {
        self.check_available()?;
        let state = self.state.borrow();
        Ok(state
            .rooms
            .get(room)
            .map(|r| {
                r.mailbox
                    .iter()
                    .map(|(id, record)| MailboxItem::Record {
                        id: *id,
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&mut self, room: &RoomId, ids: &[u64]) -> Result<(), SyncError> {
        self.check_available()?;
        if let Some(room) = self.state.borrow_mut().rooms.get_mut(room) {
            room.mailbox.retain(|(id, _)| !ids.contains(id));
        }
        Ok(())
    }
}

impl RoomService for MemoryRelayHandle {
    fn list_members(&mut self, room: &RoomId) -> Result<Vec<Member>, SyncError> {
        self.check_available()?;
        Ok(self
            .state
            .borrow()
            .rooms
            .get(room)
            .map(|r| r.members.clone())
            .unwrap_or_default())
    }

    fn membership_changed(&mut self) -> bool {
        let version = self
            .state
            .borrow()
            .rooms
            .get(&self.room)
            .map_or(0, |r| r.version);
        let changed = version != self.seen_version;
        self.seen_version = version;
        changed
    }
}
