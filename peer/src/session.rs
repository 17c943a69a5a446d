//! One synchronization session per room join
//!
//! `SyncSession` owns every component of the sync core and is the only thing
//! the game loop talks to. It is driven by `tick`, which never blocks and
//! never fails: network problems are logged and reported as `SessionEvent`s,
//! and the local world keeps running even with zero links.
//!
//! Topology is a star. The host links to every member and forwards what one
//! member announces to all the others; members link to the host only.

use crate::authority::{AuthorityModel, SpawnOutcome, Verdict};
use crate::batcher::OutboundBatcher;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, LinkEvent, LinkState};
use crate::error::SyncError;
use crate::event_bus::{EventBus, SubscriptionId};
use crate::interpolation::Interpolator;
use crate::relay_client::{Mailbox, RoomService};
use crate::signaling::SignalingClient;
use crate::transport::Transport;
use crate::world::{EntityClass, EntityRecord, World};
use log::{debug, info, warn};
use shared::{
    ActionPayload, DeletePayload, Delivery, Envelope, EnvelopeKind, LinkPacket, Member,
    MovePayload, Payload, PeerId, Role, RoomId, SpawnPayload,
};
use std::mem;
use std::time::{Duration, Instant};

/// Session-level happenings the driver may want to react to
#[derive(Debug)]
pub enum SessionEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    PeerFailed { peer: PeerId, error: SyncError },
    /// The host link closed; this member now runs alone
    HostLost(PeerId),
    /// Signaling entered (`true`) or left (`false`) degraded mode
    Degraded(bool),
}

pub struct SyncSession<T, R> {
    local: PeerId,
    room: RoomId,
    config: SyncConfig,
    host: Option<PeerId>,
    /// Open link to the host, as seen by a member
    host_link: Option<PeerId>,
    connections: ConnectionManager<T, R>,
    bus: EventBus,
    batcher: OutboundBatcher,
    authority: AuthorityModel,
    interpolator: Interpolator,
    world: World,
    events: Vec<SessionEvent>,
    /// Time of the latest tick
    clock: Instant,
    degraded: bool,
    /// The last membership read failed and must be retried
    members_stale: bool,
    abandoned: bool,
    closed: bool,
}

impl<T: Transport, R: Mailbox + RoomService> SyncSession<T, R> {
    pub fn new(
        local: PeerId,
        room: RoomId,
        config: SyncConfig,
        transport: T,
        relay: R,
        now: Instant,
    ) -> Self {
        let signaling = SignalingClient::new(relay, room.clone(), local.clone(), &config);
        let connections =
            ConnectionManager::new(local.clone(), false, config.clone(), transport, signaling);
        Self {
            batcher: OutboundBatcher::new(&config, now),
            authority: AuthorityModel::new(local.clone()),
            interpolator: Interpolator::new(config.snap_epsilon),
            local,
            room,
            config,
            host: None,
            host_link: None,
            connections,
            bus: EventBus::new(),
            world: World::new(),
            events: Vec::new(),
            clock: now,
            degraded: false,
            members_stale: false,
            abandoned: false,
            closed: false,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_host(&self) -> bool {
        self.host.as_ref() == Some(&self.local)
    }

    pub fn host(&self) -> Option<&PeerId> {
        self.host.as_ref()
    }

    /// True once a member has lost its host and carries on alone
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.connections.open_peers()
    }

    pub fn link_state(&self, peer: &PeerId) -> LinkState {
        self.connections.state(peer)
    }

    pub fn connections(&self) -> &ConnectionManager<T, R> {
        &self.connections
    }

    pub fn relay_mut(&mut self) -> &mut R {
        self.connections.signaling_mut().relay_mut()
    }

    pub fn entity(&self, id: &str) -> Option<&EntityRecord> {
        self.world.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.world.len()
    }

    pub fn owner_of(&self, id: &str) -> Option<&PeerId> {
        self.authority.owner_of(id)
    }

    /// Where the renderer should draw an entity this tick
    ///
    /// Locally owned entities are drawn where the game put them; remote ones
    /// at their smoothed position.
    pub fn visible_position(&self, id: &str) -> Option<(f32, f32)> {
        if let Some((x, y, _)) = self.interpolator.visible(id) {
            return Some((x, y));
        }
        self.world.get(id).map(|record| (record.x, record.y))
    }

    pub fn subscribe<F>(&mut self, kind: EnvelopeKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Envelope, Verdict) + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }

    /// Reads the room membership once and links up accordingly
    pub fn start(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.refresh_membership(now);
    }

    fn refresh_membership(&mut self, now: Instant) {
        let room = self.room.clone();
        match self.relay_mut().list_members(&room) {
            Ok(members) => {
                self.members_stale = false;
                self.reconcile_membership(&members, now);
            }
            Err(e) => {
                if !self.members_stale {
                    warn!("Could not list members of {}: {}", self.room, e);
                }
                self.members_stale = true;
            }
        }
    }

    /// Brings the link set in line with the room membership
    ///
    /// The host links to every member, a member only to the host. Links to
    /// peers that are no longer listed are closed. A failed link stays failed
    /// until its peer leaves the room and joins again.
    pub fn reconcile_membership(&mut self, members: &[Member], now: Instant) {
        if self.closed || self.abandoned {
            return;
        }

        // A departed host stays recorded until its link is gone
        if let Some(host) = members.iter().find(|m| m.role() == Role::Host) {
            if self.host.as_ref() != Some(&host.peer_id) {
                info!("Host of {} is {}", self.room, host.peer_id);
                self.host = Some(host.peer_id.clone());
            }
        }
        let is_host = self.is_host();
        self.connections.set_host(is_host);

        // The host may have linked to us before we knew who it was
        if let Some(host) = self.host.clone() {
            if !is_host && self.connections.state(&host) == LinkState::Open {
                self.host_link = Some(host);
            }
        }

        let wanted: Vec<PeerId> = members
            .iter()
            .filter(|m| m.peer_id != self.local)
            .filter(|m| is_host || m.role() == Role::Host)
            .map(|m| m.peer_id.clone())
            .collect();

        for peer in self.connections.peers() {
            if !wanted.contains(&peer) {
                debug!("{} left {}", peer, self.room);
                self.connections.disconnect(&peer);
            }
        }
        for peer in &wanted {
            match self.connections.state(peer) {
                LinkState::Idle | LinkState::Closed => {
                    self.connections.connect(peer, now);
                }
                LinkState::Connecting | LinkState::Open | LinkState::Failed => {}
            }
        }
    }

    /// Advances the session by one simulation tick
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.clock = now;

        if self.relay_mut().membership_changed() || self.members_stale {
            self.refresh_membership(now);
        }

        for event in self.connections.poll(now) {
            self.handle_link_event(event, now);
        }

        let degraded = self.members_stale || self.connections.signaling().is_degraded();
        self.set_degraded(degraded);

        if let Some(batch) = self.batcher.flush_due(now) {
            self.send_batch(&batch);
        }

        self.interpolator.step();
    }

    fn set_degraded(&mut self, degraded: bool) {
        if degraded != self.degraded {
            self.degraded = degraded;
            self.events.push(SessionEvent::Degraded(degraded));
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        if self.abandoned {
            return;
        }
        match event {
            LinkEvent::Opened(peer) => {
                if !self.is_host() && self.host.as_ref() == Some(&peer) {
                    self.host_link = Some(peer.clone());
                }
                self.events.push(SessionEvent::PeerConnected(peer.clone()));
                let request = Envelope::new(self.local.clone(), Payload::RequestSpawn);
                self.send_to(&peer, request);
            }
            LinkEvent::Closed(peer) => self.peer_lost(&peer),
            LinkEvent::Failed { peer, error } => {
                warn!("Continuing without {}: {}", peer, error);
                self.events.push(SessionEvent::PeerFailed { peer, error });
            }
            LinkEvent::Packet { peer, packet } => match packet {
                LinkPacket::Envelope(envelope) => self.receive(&peer, envelope, now),
                LinkPacket::Batch(envelopes) => {
                    for envelope in envelopes {
                        self.receive(&peer, envelope, now);
                    }
                }
                LinkPacket::Heartbeat { .. } | LinkPacket::Goodbye => {}
            },
        }
    }

    fn peer_lost(&mut self, peer: &PeerId) {
        info!("Lost link to {}", peer);
        self.events.push(SessionEvent::PeerDisconnected(peer.clone()));

        if self.host_link.as_ref() == Some(peer) {
            self.host_link = None;
            self.abandon(peer);
            return;
        }

        for id in self.authority.remove_peer(peer) {
            self.remove_entity(&id);
            let delete = Envelope::new(
                self.local.clone(),
                Payload::Delete(DeletePayload { entity_id: id }),
            );
            self.bus.dispatch(&delete, Verdict::Authoritative);
            if self.is_host() {
                self.broadcast(&delete, None);
            }
        }
    }

    /// Drops every link and every remote entity after the host went away
    fn abandon(&mut self, host: &PeerId) {
        warn!("Host {} is gone, continuing alone", host);
        self.abandoned = true;
        self.connections.shutdown();
        for id in self.authority.remove_remote() {
            self.remove_entity(&id);
            let delete = Envelope::new(
                host.clone(),
                Payload::Delete(DeletePayload { entity_id: id }),
            );
            self.bus.dispatch(&delete, Verdict::Authoritative);
        }
        self.events.push(SessionEvent::HostLost(host.clone()));
    }

    fn remove_entity(&mut self, id: &str) {
        self.world.remove(id);
        self.interpolator.remove(id);
        self.batcher.forget(id);
    }

    fn receive(&mut self, link_peer: &PeerId, envelope: Envelope, now: Instant) {
        if let Err(e) = envelope.validate() {
            warn!(
                "Dropping envelope from {}: {}",
                link_peer,
                SyncError::from(e)
            );
            return;
        }
        if envelope.sender == self.local {
            return;
        }
        // Only the host relays other peers' envelopes
        if self.is_host() && envelope.sender != *link_peer {
            warn!(
                "Dropping envelope from {} claiming to be {}",
                link_peer, envelope.sender
            );
            return;
        }

        match &envelope.payload {
            Payload::Move(update) => {
                let verdict = self.authority.classify(&update.entity_id, &envelope.sender);
                match verdict {
                    Verdict::Authoritative => {
                        if let Some(record) = self.world.get_mut(&update.entity_id) {
                            record.apply_move(update);
                        }
                        self.interpolator.update(update, now);
                        self.bus.dispatch(&envelope, verdict);
                        self.forward(&envelope, link_peer, now);
                    }
                    Verdict::Advisory => {
                        self.bus.dispatch(&envelope, verdict);
                    }
                    Verdict::Unknown => {
                        debug!("Move for unknown entity {}", update.entity_id);
                    }
                }
            }
            Payload::Action(action) => {
                let verdict = self.authority.classify(&action.entity_id, &envelope.sender);
                if verdict == Verdict::Unknown {
                    debug!("Action for unknown entity {}", action.entity_id);
                    return;
                }
                self.bus.dispatch(&envelope, verdict);
                self.forward(&envelope, link_peer, now);
            }
            Payload::Spawn(spawn) => {
                match self.authority.record_spawn(&spawn.entity_id, &envelope.sender) {
                    SpawnOutcome::Created => {
                        let record = EntityRecord::from_spawn(spawn, envelope.sender.clone());
                        let alpha = self.config.alpha(record.class);
                        self.interpolator
                            .track(&spawn.entity_id, spawn.x, spawn.y, alpha, now);
                        self.world.insert(record);
                        self.bus.dispatch(&envelope, Verdict::Authoritative);
                        self.forward(&envelope, link_peer, now);
                    }
                    SpawnOutcome::Refreshed => {
                        if let Some(record) = self.world.get_mut(&spawn.entity_id) {
                            record.x = spawn.x;
                            record.y = spawn.y;
                        }
                        self.interpolator
                            .retarget(&spawn.entity_id, spawn.x, spawn.y, now);
                    }
                    SpawnOutcome::Conflict { owner } => {
                        warn!(
                            "{} tried to spawn {}, which belongs to {}",
                            envelope.sender, spawn.entity_id, owner
                        );
                    }
                }
            }
            Payload::Delete(delete) => {
                if self.authority.is_local(&delete.entity_id) {
                    warn!(
                        "Ignoring delete of our own entity {} from {}",
                        delete.entity_id, envelope.sender
                    );
                    return;
                }
                let Some(owner) = self.authority.owner_of(&delete.entity_id) else {
                    debug!("Delete for unknown entity {}", delete.entity_id);
                    return;
                };
                // The host may clean up after a departed owner
                if *owner != envelope.sender && self.host.as_ref() != Some(&envelope.sender) {
                    warn!(
                        "{} tried to delete {}, which belongs to {}",
                        envelope.sender, delete.entity_id, owner
                    );
                    return;
                }
                self.authority.release(&delete.entity_id);
                self.remove_entity(&delete.entity_id);
                self.bus.dispatch(&envelope, Verdict::Authoritative);
                self.forward(&envelope, link_peer, now);
            }
            Payload::RequestSpawn => self.answer_resync(link_peer, &envelope.sender),
        }
    }

    /// Replays current entities to a peer that asked for a resync
    ///
    /// The host knows the whole room and sends everything the requester does
    /// not own; a member only speaks for its own entities.
    fn answer_resync(&mut self, link_peer: &PeerId, requester: &PeerId) {
        let replies: Vec<Envelope> = self
            .world
            .records()
            .into_iter()
            .filter(|record| record.owner != *requester)
            .filter(|record| self.is_host() || record.owner == self.local)
            .map(|record| Envelope::new(record.owner.clone(), Payload::Spawn(record.to_spawn())))
            .collect();
        debug!("Resync for {}: {} entities", requester, replies.len());
        for reply in replies {
            self.send_to(link_peer, reply);
        }
    }

    /// Passes a member's envelope on to the other members
    fn forward(&mut self, envelope: &Envelope, from: &PeerId, now: Instant) {
        if !self.is_host() {
            return;
        }
        match envelope.kind().delivery() {
            Delivery::Batched => self.enqueue(envelope.clone(), None, now),
            Delivery::Immediate => self.broadcast(envelope, Some(from)),
        }
    }

    /// Sends an envelope this peer authored
    fn publish(&mut self, envelope: Envelope, min_interval: Option<Duration>, now: Instant) {
        match envelope.kind().delivery() {
            Delivery::Batched => self.enqueue(envelope, min_interval, now),
            Delivery::Immediate => self.broadcast(&envelope, None),
        }
    }

    fn enqueue(&mut self, envelope: Envelope, min_interval: Option<Duration>, now: Instant) {
        if let Some(batch) = self.batcher.push(envelope, min_interval, now) {
            self.send_batch(&batch);
        }
    }

    fn send_to(&mut self, peer: &PeerId, envelope: Envelope) {
        if let Err(e) = self.connections.send(peer, &LinkPacket::Envelope(envelope)) {
            debug!("Could not send to {}: {}", peer, e);
        }
    }

    /// Sends an immediate envelope on every open link except `except` and
    /// the envelope's own sender
    fn broadcast(&mut self, envelope: &Envelope, except: Option<&PeerId>) {
        for peer in self.connections.open_peers() {
            if Some(&peer) == except || peer == envelope.sender {
                continue;
            }
            self.send_to(&peer, envelope.clone());
        }
    }

    fn send_batch(&mut self, batch: &[Envelope]) {
        for peer in self.connections.open_peers() {
            let envelopes = OutboundBatcher::for_link(batch, &peer);
            if envelopes.is_empty() {
                continue;
            }
            if let Err(e) = self.connections.send(&peer, &LinkPacket::Batch(envelopes)) {
                debug!("Could not send batch to {}: {}", peer, e);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Creates an entity owned by this peer and announces it right away
    pub fn spawn_local(&mut self, spawn: SpawnPayload) -> Result<(), SyncError> {
        self.ensure_open()?;
        let record = EntityRecord::from_spawn(&spawn, self.local.clone());
        let envelope = Envelope::new(self.local.clone(), Payload::Spawn(spawn));
        envelope.validate()?;

        self.authority.claim_local(&record.id)?;
        debug!("Spawned {} ({})", record.id, record.entity_type);
        self.world.insert(record);
        self.publish(envelope, None, self.clock);
        Ok(())
    }

    /// Records a new position for a local entity and queues it for sending
    pub fn announce_move(&mut self, update: MovePayload, now: Instant) -> Result<(), SyncError> {
        self.ensure_open()?;
        if !self.authority.is_local(&update.entity_id) {
            return Err(SyncError::NotOwner(update.entity_id));
        }
        let envelope = Envelope::new(self.local.clone(), Payload::Move(update.clone()));
        envelope.validate()?;

        let class = match self.world.get_mut(&update.entity_id) {
            Some(record) => {
                record.apply_move(&update);
                record.class
            }
            None => EntityClass::Npc,
        };
        let interval = self.config.send_interval(class);
        self.publish(envelope, Some(interval), now);
        Ok(())
    }

    /// Sends a discrete event about any known entity
    ///
    /// Actions about entities owned by someone else reach the owner as
    /// advisory hints.
    pub fn announce_action(&mut self, action: ActionPayload) -> Result<(), SyncError> {
        self.ensure_open()?;
        let envelope = Envelope::new(self.local.clone(), Payload::Action(action));
        envelope.validate()?;
        self.publish(envelope, None, self.clock);
        Ok(())
    }

    /// Removes a local entity everywhere
    pub fn despawn_local(&mut self, id: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        if !self.authority.is_local(id) {
            return Err(SyncError::NotOwner(id.to_string()));
        }
        self.authority.release(id);
        self.remove_entity(id);
        let envelope = Envelope::new(
            self.local.clone(),
            Payload::Delete(DeletePayload {
                entity_id: id.to_string(),
            }),
        );
        self.publish(envelope, None, self.clock);
        Ok(())
    }

    /// Closes every link, cancels every timer and forgets all state
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        info!("Tearing down session in {}", self.room);
        self.closed = true;
        self.connections.shutdown();
        self.bus.clear();
        self.batcher.clear();
        self.authority.clear();
        self.interpolator.clear();
        self.world.clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_client::{MemoryRelay, MemoryRelayHandle};
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use shared::FieldValue;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    type Session = SyncSession<MemoryTransport, MemoryRelayHandle>;

    const STEP: Duration = Duration::from_millis(50);

    fn session(network: &MemoryNetwork, relay: &MemoryRelay, local: &str, is_host: bool, now: Instant) -> Session {
        let room = RoomId::new("room");
        relay.join(&room, Member::new(local, is_host));
        SyncSession::new(
            PeerId::new(local),
            room.clone(),
            SyncConfig::default(),
            network.endpoint(local),
            relay.handle(&room),
            now,
        )
    }

    /// Ticks every session together for `rounds` steps and returns the final time
    fn run(sessions: &mut [&mut Session], mut now: Instant, rounds: u32) -> Instant {
        for _ in 0..rounds {
            now += STEP;
            for session in sessions.iter_mut() {
                session.tick(now);
            }
        }
        now
    }

    fn connected_pair() -> (MemoryNetwork, MemoryRelay, Session, Session, Instant) {
        let network = MemoryNetwork::new();
        let relay = MemoryRelay::new();
        let start = Instant::now();
        let mut host = session(&network, &relay, "host", true, start);
        let mut member = session(&network, &relay, "m1", false, start);
        host.start(start);
        member.start(start);
        let now = run(&mut [&mut host, &mut member], start, 20);
        (network, relay, host, member, now)
    }

    #[test]
    fn test_pair_connects() {
        let (_network, _relay, host, mut member, _) = connected_pair();
        assert!(host.is_host());
        assert!(!member.is_host());
        assert_eq!(host.open_peers(), vec![PeerId::new("m1")]);
        assert_eq!(member.open_peers(), vec![PeerId::new("host")]);

        let events = member.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerConnected(p) if p.as_str() == "host")));
        assert_eq!(host.connections().link_count(), 1);
    }

    #[test]
    fn test_spawn_reaches_member() {
        let (_network, _relay, mut host, mut member, now) = connected_pair();
        host.spawn_local(SpawnPayload::new("mouse_1", "MOUSE", 5.0, 6.0))
            .unwrap();
        run(&mut [&mut host, &mut member], now, 2);

        let record = member.entity("mouse_1").expect("spawned on member");
        assert_eq!(record.owner, PeerId::new("host"));
        assert_eq!((record.x, record.y), (5.0, 6.0));
        assert_eq!(member.visible_position("mouse_1"), Some((5.0, 6.0)));
    }

    #[test]
    fn test_late_joiner_receives_resync() {
        let network = MemoryNetwork::new();
        let relay = MemoryRelay::new();
        let start = Instant::now();
        let mut host = session(&network, &relay, "host", true, start);
        host.start(start);
        for i in 0..3 {
            host.spawn_local(SpawnPayload::new(format!("mouse_{}", i), "MOUSE", 1.0, 1.0))
                .unwrap();
        }

        let mut member = session(&network, &relay, "m1", false, start);
        member.start(start);
        run(&mut [&mut host, &mut member], start, 20);

        assert_eq!(member.entity_count(), 3);
        assert_eq!(member.owner_of("mouse_2"), Some(&PeerId::new("host")));
    }

    #[test]
    fn test_non_owner_move_is_advisory() {
        let (_network, _relay, mut host, mut member, now) = connected_pair();
        host.spawn_local(SpawnPayload::new("mouse_1", "MOUSE", 0.0, 0.0))
            .unwrap();
        let now = run(&mut [&mut host, &mut member], now, 2);

        assert!(matches!(
            member.announce_move(MovePayload::new("mouse_1", 50.0, 50.0), now),
            Err(SyncError::NotOwner(_))
        ));

        let verdicts = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&verdicts);
        host.subscribe(EnvelopeKind::Action, move |_, verdict| {
            seen.borrow_mut().push(verdict);
        });
        member
            .announce_action(
                ActionPayload::new("mouse_1", "push").with_field("force", FieldValue::Number(3.0)),
            )
            .unwrap();
        run(&mut [&mut host, &mut member], now, 2);

        assert_eq!(verdicts.borrow().as_slice(), &[Verdict::Advisory]);
        assert_eq!(host.entity("mouse_1").unwrap().x, 0.0);
    }

    #[test]
    fn test_spawn_local_duplicate_and_despawn() {
        let (_network, _relay, mut host, mut member, now) = connected_pair();
        host.spawn_local(SpawnPayload::new("item_1", "ITEM", 0.0, 0.0))
            .unwrap();
        assert!(matches!(
            host.spawn_local(SpawnPayload::new("item_1", "ITEM", 0.0, 0.0)),
            Err(SyncError::DuplicateEntity(_))
        ));
        let now = run(&mut [&mut host, &mut member], now, 2);
        assert!(member.entity("item_1").is_some());

        assert!(matches!(
            member.despawn_local("item_1"),
            Err(SyncError::NotOwner(_))
        ));
        host.despawn_local("item_1").unwrap();
        run(&mut [&mut host, &mut member], now, 2);
        assert!(member.entity("item_1").is_none());
        assert!(host.entity("item_1").is_none());
    }

    #[test]
    fn test_local_envelopes_follow_their_delivery_class() {
        let (network, _relay, mut host, _member, now) = connected_pair();
        let (host_id, m1) = (PeerId::new("host"), PeerId::new("m1"));
        let before = network.sent_count(&host_id, &m1);

        host.spawn_local(SpawnPayload::new("mouse_1", "MOUSE", 0.0, 0.0))
            .unwrap();
        host.announce_action(ActionPayload::new("mouse_1", "squeak"))
            .unwrap();
        assert_eq!(network.sent_count(&host_id, &m1), before + 2);

        host.announce_move(MovePayload::new("mouse_1", 1.0, 1.0), now)
            .unwrap();
        assert_eq!(network.sent_count(&host_id, &m1), before + 2);
        assert_eq!(host.batcher.len(), 1);

        host.despawn_local("mouse_1").unwrap();
        assert_eq!(network.sent_count(&host_id, &m1), before + 3);
        assert!(host.batcher.is_empty());
    }

    #[test]
    fn test_closed_session_rejects_local_calls() {
        let (_network, _relay, mut host, _member, _) = connected_pair();
        host.teardown();
        assert!(matches!(
            host.spawn_local(SpawnPayload::new("cat_1", "CAT", 0.0, 0.0)),
            Err(SyncError::SessionClosed)
        ));
        host.teardown();
        assert!(host.is_closed());
    }
}
