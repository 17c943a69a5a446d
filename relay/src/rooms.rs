//! Room membership and signaling mailboxes held by the relay
//!
//! This module keeps the relay's only state:
//! - Which peers are in which room, and which of them is the host
//! - The mailbox of handshake records waiting to be picked up
//! - When each member was last heard from, for idle eviction
//!
//! The relay never looks inside a record; it only checks that the author is a
//! member and that the addressee exists.

use log::info;
use shared::{Member, PeerId, RoomId, SignalRecord};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A peer currently present in a room
#[derive(Debug)]
pub struct RoomMember {
    pub peer_id: PeerId,
    /// Address replies and membership pushes are sent to
    pub addr: SocketAddr,
    pub is_host: bool,
    /// Last time we received any packet from this member
    pub last_seen: Instant,
}

impl RoomMember {
    pub fn new(peer_id: PeerId, addr: SocketAddr, is_host: bool, now: Instant) -> Self {
        Self {
            peer_id,
            addr,
            is_host,
            last_seen: now,
        }
    }

    /// Returns true if nothing was heard from the member for `timeout`
    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, Default)]
pub struct Room {
    /// Members in join order
    pub members: Vec<RoomMember>,
    /// Records not yet acknowledged by their addressee
    pub mailbox: Vec<(u64, SignalRecord)>,
}

impl Room {
    fn member(&self, peer: &PeerId) -> Option<&RoomMember> {
        self.members.iter().find(|m| &m.peer_id == peer)
    }

    fn member_mut(&mut self, peer: &PeerId) -> Option<&mut RoomMember> {
        self.members.iter_mut().find(|m| &m.peer_id == peer)
    }

    pub fn listing(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|m| Member {
                peer_id: m.peer_id.clone(),
                is_host: m.is_host,
            })
            .collect()
    }

    fn drop_records_of(&mut self, peer: &PeerId) {
        self.mailbox
            .retain(|(_, record)| &record.to != peer && &record.from != peer);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New member; everyone in the room needs the new listing
    Joined { is_host: bool },
    /// Already a member, possibly from a new address
    Rejoined,
    Full,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    Stored(u64),
    /// The addressee is not in the room
    UnknownRecipient,
    /// The author is not a member at that address
    NotMember,
}

/// All rooms known to the relay
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    next_record_id: u64,
    /// Maximum number of members per room
    max_members: usize,
    member_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(max_members: usize, member_timeout: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            next_record_id: 1,
            max_members,
            member_timeout,
        }
    }

    /// Adds `peer` to `room`, creating the room on first join
    ///
    /// The first member of a room, or the first to join a room whose host
    /// left, becomes its host.
    pub fn join(&mut self, room: &RoomId, peer: &PeerId, addr: SocketAddr, now: Instant) -> JoinOutcome {
        let max_members = self.max_members;
        let entry = self.rooms.entry(room.clone()).or_default();

        if let Some(member) = entry.member_mut(peer) {
            member.addr = addr;
            member.last_seen = now;
            return JoinOutcome::Rejoined;
        }

        if entry.members.len() >= max_members {
            if entry.members.is_empty() {
                self.rooms.remove(room);
            }
            return JoinOutcome::Full;
        }

        let is_host = !entry.members.iter().any(|m| m.is_host);
        entry
            .members
            .push(RoomMember::new(peer.clone(), addr, is_host, now));
        info!(
            "{} joined room {} from {}{}",
            peer,
            room,
            addr,
            if is_host { " as host" } else { "" }
        );
        JoinOutcome::Joined { is_host }
    }

    /// Removes a member; returns false if it was already gone
    pub fn leave(&mut self, room: &RoomId, peer: &PeerId) -> bool {
        let Some(entry) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = entry.members.len();
        entry.members.retain(|m| &m.peer_id != peer);
        if entry.members.len() == before {
            return false;
        }
        entry.drop_records_of(peer);
        info!("{} left room {}", peer, room);

        if entry.members.is_empty() {
            self.rooms.remove(room);
        }
        true
    }

    /// The member of `room` sending from `addr`
    pub fn member_at(&self, room: &RoomId, addr: SocketAddr) -> Option<PeerId> {
        self.rooms
            .get(room)?
            .members
            .iter()
            .find(|m| m.addr == addr)
            .map(|m| m.peer_id.clone())
    }

    /// Refreshes a member's activity; false if it is not a member at `addr`
    pub fn touch(&mut self, room: &RoomId, peer: &PeerId, addr: SocketAddr, now: Instant) -> bool {
        match self.rooms.get_mut(room).and_then(|r| r.member_mut(peer)) {
            Some(member) if member.addr == addr => {
                member.last_seen = now;
                true
            }
            _ => false,
        }
    }

    pub fn post(&mut self, record: SignalRecord, addr: SocketAddr) -> PostOutcome {
        let Some(entry) = self.rooms.get_mut(&record.room) else {
            return PostOutcome::NotMember;
        };
        match entry.member(&record.from) {
            Some(author) if author.addr == addr => {}
            _ => return PostOutcome::NotMember,
        }
        if entry.member(&record.to).is_none() {
            return PostOutcome::UnknownRecipient;
        }

        let id = self.next_record_id;
        self.next_record_id += 1;
        entry.mailbox.push((id, record));
        PostOutcome::Stored(id)
    }

    /// Records addressed to `peer`, oldest first
    pub fn fetch(&self, room: &RoomId, peer: &PeerId) -> Vec<(u64, SignalRecord)> {
        self.rooms
            .get(room)
            .map(|r| {
                r.mailbox
                    .iter()
                    .filter(|(_, record)| &record.to == peer)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes acknowledged records addressed to `peer`; returns how many went
    pub fn ack(&mut self, room: &RoomId, peer: &PeerId, ids: &[u64]) -> usize {
        let Some(entry) = self.rooms.get_mut(room) else {
            return 0;
        };
        let before = entry.mailbox.len();
        entry
            .mailbox
            .retain(|(id, record)| !(ids.contains(id) && &record.to == peer));
        before - entry.mailbox.len()
    }

    pub fn listing(&self, room: &RoomId) -> Vec<Member> {
        self.rooms.get(room).map(Room::listing).unwrap_or_default()
    }

    /// Addresses of every member of `room`
    pub fn member_addrs(&self, room: &RoomId) -> Vec<SocketAddr> {
        self.rooms
            .get(room)
            .map(|r| r.members.iter().map(|m| m.addr).collect())
            .unwrap_or_default()
    }

    /// Evicts silent members and returns the rooms whose membership changed
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<RoomId> {
        let timeout = self.member_timeout;
        let mut evicted: Vec<(RoomId, PeerId)> = Vec::new();
        for (room_id, room) in &self.rooms {
            for member in &room.members {
                if member.is_timed_out(timeout, now) {
                    evicted.push((room_id.clone(), member.peer_id.clone()));
                }
            }
        }

        let mut changed: Vec<RoomId> = Vec::new();
        for (room, peer) in evicted {
            info!("{} timed out in room {}", peer, room);
            self.leave(&room, &peer);
            if !changed.contains(&room) {
                changed.push(room);
            }
        }
        changed
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |r| r.members.len())
    }

    pub fn pending_records(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |r| r.mailbox.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SignalKind;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn room() -> RoomId {
        RoomId::new("lobby")
    }

    fn record(from: &str, to: &str) -> SignalRecord {
        SignalRecord {
            from: PeerId::new(from),
            to: PeerId::new(to),
            kind: SignalKind::Offer,
            data: "127.0.0.1:4000".to_string(),
            room: room(),
        }
    }

    fn registry_with_pair(now: Instant) -> RoomRegistry {
        let mut registry = RoomRegistry::new(4, Duration::from_secs(5));
        registry.join(&room(), &PeerId::new("host"), test_addr(), now);
        registry.join(&room(), &PeerId::new("m1"), test_addr2(), now);
        registry
    }

    #[test]
    fn test_first_joiner_is_host() {
        let now = Instant::now();
        let mut registry = RoomRegistry::new(4, Duration::from_secs(5));

        let first = registry.join(&room(), &PeerId::new("host"), test_addr(), now);
        let second = registry.join(&room(), &PeerId::new("m1"), test_addr2(), now);

        assert_eq!(first, JoinOutcome::Joined { is_host: true });
        assert_eq!(second, JoinOutcome::Joined { is_host: false });
        assert_eq!(
            registry.listing(&room()),
            vec![Member::new("host", true), Member::new("m1", false)]
        );
    }

    #[test]
    fn test_rejoin_updates_address() {
        let now = Instant::now();
        let mut registry = registry_with_pair(now);
        let new_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let outcome = registry.join(&room(), &PeerId::new("m1"), new_addr, now);
        assert_eq!(outcome, JoinOutcome::Rejoined);
        assert_eq!(registry.member_count(&room()), 2);
        assert_eq!(registry.member_at(&room(), new_addr), Some(PeerId::new("m1")));
    }

    #[test]
    fn test_room_capacity() {
        let now = Instant::now();
        let mut registry = RoomRegistry::new(1, Duration::from_secs(5));

        registry.join(&room(), &PeerId::new("host"), test_addr(), now);
        let outcome = registry.join(&room(), &PeerId::new("m1"), test_addr2(), now);
        assert_eq!(outcome, JoinOutcome::Full);
        assert_eq!(registry.member_count(&room()), 1);
    }

    #[test]
    fn test_post_fetch_ack() {
        let now = Instant::now();
        let mut registry = registry_with_pair(now);

        let outcome = registry.post(record("host", "m1"), test_addr());
        let PostOutcome::Stored(id) = outcome else {
            panic!("Wrong outcome, expected Stored");
        };

        assert!(registry.fetch(&room(), &PeerId::new("host")).is_empty());
        let records = registry.fetch(&room(), &PeerId::new("m1"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, id);

        // Only the addressee can acknowledge
        assert_eq!(registry.ack(&room(), &PeerId::new("host"), &[id]), 0);
        assert_eq!(registry.ack(&room(), &PeerId::new("m1"), &[id]), 1);
        assert_eq!(registry.pending_records(&room()), 0);
    }

    #[test]
    fn test_post_validation() {
        let now = Instant::now();
        let mut registry = registry_with_pair(now);

        assert_eq!(
            registry.post(record("host", "ghost"), test_addr()),
            PostOutcome::UnknownRecipient
        );
        // Author must post from its own address
        assert_eq!(
            registry.post(record("host", "m1"), test_addr2()),
            PostOutcome::NotMember
        );
    }

    #[test]
    fn test_leave_drops_records_and_empty_rooms() {
        let now = Instant::now();
        let mut registry = registry_with_pair(now);
        registry.post(record("host", "m1"), test_addr());

        assert!(registry.leave(&room(), &PeerId::new("m1")));
        assert!(!registry.leave(&room(), &PeerId::new("m1")));
        assert_eq!(registry.pending_records(&room()), 0);

        registry.leave(&room(), &PeerId::new("host"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_host_slot_refilled_after_host_leaves() {
        let now = Instant::now();
        let mut registry = registry_with_pair(now);
        registry.leave(&room(), &PeerId::new("host"));

        let outcome = registry.join(&room(), &PeerId::new("m2"), test_addr(), now);
        assert_eq!(outcome, JoinOutcome::Joined { is_host: true });
    }

    #[test]
    fn test_check_timeouts() {
        let start = Instant::now();
        let mut registry = registry_with_pair(start);

        let later = start + Duration::from_secs(4);
        assert!(registry.touch(&room(), &PeerId::new("m1"), test_addr2(), later));
        assert!(!registry.touch(&room(), &PeerId::new("m1"), test_addr(), later));

        let evicted = registry.check_timeouts(start + Duration::from_secs(6));
        assert_eq!(evicted, vec![room()]);
        assert_eq!(registry.listing(&room()), vec![Member::new("m1", false)]);
    }
}
