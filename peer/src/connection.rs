//! Direct link lifecycle: handshake, retry, liveness and teardown
//!
//! Each remote peer has at most one `Link`, moving through
//! `Idle -> Connecting -> Open -> Closed`, with `Connecting -> Failed` on a
//! handshake timeout. A failed attempt is retried after a growing delay until
//! `max_attempts` have been made, at which point the link stays `Failed` and the
//! session carries on without that peer. Nothing here blocks: timeouts are
//! scheduler entries checked on every `poll`, and transport or signaling
//! activity is only looked at from `poll`.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::relay_client::Mailbox;
use crate::signaling::{SignalEvent, SignalingClient};
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::{Transport, TransportEvent};
use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use rand::Rng;
use shared::{timestamp_ms, LinkPacket, PeerId, SignalKind, SignalRecord};
use std::collections::HashMap;
use std::mem;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Failed,
    Closed,
}

#[derive(Debug)]
pub struct Link {
    pub peer: PeerId,
    pub state: LinkState,
    /// Whether the current attempt was started by us
    pub initiator: bool,
    /// Handshake attempts made since the link last opened
    pub attempts: u32,
    pub last_activity: Instant,
    last_heartbeat: Instant,
    timeout: Option<TimerHandle>,
    retry: Option<TimerHandle>,
}

impl Link {
    fn new(peer: PeerId, now: Instant) -> Self {
        Self {
            peer,
            state: LinkState::Idle,
            initiator: false,
            attempts: 0,
            last_activity: now,
            last_heartbeat: now,
            timeout: None,
            retry: None,
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }
}

#[derive(Debug)]
enum ConnectionTask {
    HandshakeTimeout { peer: PeerId },
    Retry { peer: PeerId },
}

/// Link transitions and traffic reported to the session
#[derive(Debug)]
pub enum LinkEvent {
    Opened(PeerId),
    Closed(PeerId),
    /// The link gave up; the session continues without this peer
    Failed { peer: PeerId, error: SyncError },
    Packet { peer: PeerId, packet: LinkPacket },
}

pub struct ConnectionManager<T, R> {
    local: PeerId,
    is_host: bool,
    config: SyncConfig,
    transport: T,
    signaling: SignalingClient<R>,
    links: HashMap<PeerId, Link>,
    timers: Scheduler<ConnectionTask>,
    events: Vec<LinkEvent>,
}

impl<T: Transport, R: Mailbox> ConnectionManager<T, R> {
    pub fn new(
        local: PeerId,
        is_host: bool,
        config: SyncConfig,
        transport: T,
        signaling: SignalingClient<R>,
    ) -> Self {
        Self {
            local,
            is_host,
            config,
            transport,
            signaling,
            links: HashMap::new(),
            timers: Scheduler::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self, peer: &PeerId) -> LinkState {
        self.links.get(peer).map_or(LinkState::Idle, |link| link.state)
    }

    pub fn link(&self, peer: &PeerId) -> Option<&Link> {
        self.links.get(peer)
    }

    /// Every peer with a link record, whatever its state
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Role changes only take effect for glare decisions made afterwards
    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .values()
            .filter(|link| link.state == LinkState::Open)
            .map(|link| link.peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn signaling(&self) -> &SignalingClient<R> {
        &self.signaling
    }

    pub fn signaling_mut(&mut self) -> &mut SignalingClient<R> {
        &mut self.signaling
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn active_links(&self) -> usize {
        self.links
            .values()
            .filter(|link| matches!(link.state, LinkState::Connecting | LinkState::Open))
            .count()
    }

    fn has_capacity(&self, peer: &PeerId) -> bool {
        let already_active = matches!(
            self.state(peer),
            LinkState::Connecting | LinkState::Open
        );
        already_active || self.active_links() + 1 < self.config.max_peers
    }

    /// Starts a handshake with `peer`
    ///
    /// A no-op returning false while a link to `peer` is already connecting
    /// or open, so repeated calls never create a second link.
    pub fn connect(&mut self, peer: &PeerId, now: Instant) -> bool {
        if *peer == self.local {
            return false;
        }
        if matches!(self.state(peer), LinkState::Connecting | LinkState::Open) {
            debug!("Link to {} already {:?}", peer, self.state(peer));
            return false;
        }
        if !self.has_capacity(peer) {
            warn!(
                "Refusing link to {}: session already has {} peer(s)",
                peer, self.config.max_peers
            );
            return false;
        }

        let link = self
            .links
            .entry(peer.clone())
            .or_insert_with(|| Link::new(peer.clone(), now));
        if let Some(retry) = link.retry.take() {
            self.timers.cancel(retry);
        } else {
            link.attempts = 0;
        }

        self.start_attempt(peer, now);
        true
    }

    fn start_attempt(&mut self, peer: &PeerId, now: Instant) {
        let offer = self.transport.create_offer(peer);
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        link.state = LinkState::Connecting;
        link.initiator = true;
        link.attempts += 1;
        info!("Connecting to {} (attempt {})", peer, link.attempts);

        match offer {
            Ok(offer) => {
                let deadline = now + self.config.handshake_timeout;
                link.timeout = Some(
                    self.timers
                        .schedule(deadline, ConnectionTask::HandshakeTimeout { peer: peer.clone() }),
                );
                self.signaling.send(peer, SignalKind::Offer, offer, now);
            }
            Err(e) => {
                warn!("Could not create offer for {}: {}", peer, e);
                self.attempt_failed(peer, now);
            }
        }
    }

    /// Records a failed attempt and either schedules a retry or gives up
    fn attempt_failed(&mut self, peer: &PeerId, now: Instant) {
        self.transport.close(peer);
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        if let Some(timeout) = link.timeout.take() {
            self.timers.cancel(timeout);
        }
        link.state = LinkState::Failed;

        if link.attempts < self.config.max_attempts {
            let delay = self.config.retry_backoff(link.attempts) + jitter(self.config.retry_jitter);
            debug!(
                "Handshake with {} failed (attempt {}), retrying in {:?}",
                peer, link.attempts, delay
            );
            link.retry = Some(
                self.timers
                    .schedule(now + delay, ConnectionTask::Retry { peer: peer.clone() }),
            );
        } else {
            warn!(
                "Giving up on {} after {} attempt(s)",
                peer, link.attempts
            );
            let attempts = link.attempts;
            self.events.push(LinkEvent::Failed {
                peer: peer.clone(),
                error: SyncError::HandshakeTimeout {
                    peer: peer.clone(),
                    attempts,
                },
            });
        }
    }

    /// Stops trying to reach an unreachable peer; not retried automatically
    fn mark_unreachable(&mut self, peer: PeerId) {
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };
        if link.state != LinkState::Connecting {
            return;
        }
        if let Some(timeout) = link.timeout.take() {
            self.timers.cancel(timeout);
        }
        link.state = LinkState::Failed;
        self.transport.close(&peer);
        warn!("Peer {} is not reachable through the relay", peer);
        self.events.push(LinkEvent::Failed {
            error: SyncError::PeerUnreachable(peer.clone()),
            peer,
        });
    }

    /// Closes the link to `peer`, reporting `Closed` if it was open
    pub fn disconnect(&mut self, peer: &PeerId) {
        let Some(link) = self.links.remove(peer) else {
            return;
        };
        self.cancel_timers(&link);
        if link.state == LinkState::Open {
            self.send_packet(peer, &LinkPacket::Goodbye);
            self.events.push(LinkEvent::Closed(peer.clone()));
        }
        self.transport.close(peer);
        info!("Disconnected from {}", peer);
    }

    fn cancel_timers(&mut self, link: &Link) {
        if let Some(timeout) = link.timeout {
            self.timers.cancel(timeout);
        }
        if let Some(retry) = link.retry {
            self.timers.cancel(retry);
        }
    }

    pub fn send(&mut self, peer: &PeerId, packet: &LinkPacket) -> Result<(), SyncError> {
        if self.state(peer) != LinkState::Open {
            return Err(SyncError::TransportClosed(peer.clone()));
        }
        let bytes = serialize(packet)?;
        self.transport
            .send(peer, &bytes)
            .map_err(|_| SyncError::TransportClosed(peer.clone()))
    }

    fn send_packet(&mut self, peer: &PeerId, packet: &LinkPacket) {
        let bytes = match serialize(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode packet for {}: {}", peer, e);
                return;
            }
        };
        if let Err(e) = self.transport.send(peer, &bytes) {
            debug!("Send to {} failed: {}", peer, e);
        }
    }

    /// Advances timers, signaling and transport; returns what happened
    pub fn poll(&mut self, now: Instant) -> Vec<LinkEvent> {
        for task in self.timers.due(now) {
            self.run_task(task, now);
        }

        for event in self.signaling.poll(now) {
            match event {
                SignalEvent::Record(record) => self.handle_signal(record, now),
                SignalEvent::Unreachable(peer) => self.mark_unreachable(peer),
            }
        }

        for event in self.transport.poll_events() {
            self.handle_transport_event(event, now);
        }

        self.check_liveness(now);
        mem::take(&mut self.events)
    }

    fn run_task(&mut self, task: ConnectionTask, now: Instant) {
        match task {
            ConnectionTask::HandshakeTimeout { peer } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                link.timeout = None;
                if link.state == LinkState::Connecting {
                    warn!("Handshake with {} timed out", peer);
                    self.attempt_failed(&peer, now);
                }
            }
            ConnectionTask::Retry { peer } => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                link.retry = None;
                if link.state == LinkState::Failed {
                    self.start_attempt(&peer, now);
                }
            }
        }
    }

    fn handle_signal(&mut self, record: SignalRecord, now: Instant) {
        let peer = record.from;
        match record.kind {
            SignalKind::Offer => self.accept_offer(&peer, &record.data, now),
            SignalKind::Answer => {
                let expecting = self
                    .links
                    .get(&peer)
                    .is_some_and(|link| link.state == LinkState::Connecting && link.initiator);
                if !expecting {
                    debug!("Ignoring unexpected answer from {}", peer);
                    return;
                }
                if let Err(e) = self.transport.accept_answer(&peer, &record.data) {
                    warn!("Bad answer from {}: {}", peer, e);
                }
            }
            SignalKind::Candidate => {
                let usable = matches!(self.state(&peer), LinkState::Connecting | LinkState::Open);
                if usable {
                    if let Err(e) = self.transport.add_candidate(&peer, &record.data) {
                        debug!("Ignoring candidate from {}: {}", peer, e);
                    }
                }
            }
        }
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &str, now: Instant) {
        match self.links.get(peer).map(|link| (link.state, link.initiator)) {
            Some((LinkState::Open, _)) => {
                debug!("Ignoring offer from {}: link already open", peer);
                return;
            }
            Some((LinkState::Connecting, true)) if self.is_host => {
                debug!("Offer glare with {}, keeping our own offer", peer);
                return;
            }
            _ => {}
        }
        if !self.has_capacity(peer) {
            warn!("Ignoring offer from {}: session is full", peer);
            return;
        }

        self.transport.close(peer);
        let answer = self.transport.accept_offer(peer, offer);

        let link = self
            .links
            .entry(peer.clone())
            .or_insert_with(|| Link::new(peer.clone(), now));
        if let Some(timeout) = link.timeout.take() {
            self.timers.cancel(timeout);
        }
        if let Some(retry) = link.retry.take() {
            self.timers.cancel(retry);
        }
        if link.state != LinkState::Connecting {
            link.attempts += 1;
        }
        link.state = LinkState::Connecting;
        link.initiator = false;

        match answer {
            Ok(answer) => {
                let deadline = now + self.config.handshake_timeout;
                link.timeout = Some(
                    self.timers
                        .schedule(deadline, ConnectionTask::HandshakeTimeout { peer: peer.clone() }),
                );
                debug!("Answering offer from {}", peer);
                self.signaling.send(peer, SignalKind::Answer, answer, now);
            }
            Err(e) => {
                warn!("Could not accept offer from {}: {}", peer, e);
                self.attempt_failed(peer, now);
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened(peer) => {
                let Some(link) = self.links.get_mut(&peer) else {
                    debug!("Transport opened unknown peer {}, closing", peer);
                    self.transport.close(&peer);
                    return;
                };
                if link.state != LinkState::Connecting {
                    return;
                }
                if let Some(timeout) = link.timeout.take() {
                    self.timers.cancel(timeout);
                }
                link.state = LinkState::Open;
                link.attempts = 0;
                link.last_activity = now;
                link.last_heartbeat = now;
                info!("Link to {} open", peer);
                self.events.push(LinkEvent::Opened(peer));
            }
            TransportEvent::Data(peer, bytes) => {
                let Some(link) = self.links.get_mut(&peer) else {
                    return;
                };
                if link.state != LinkState::Open {
                    return;
                }
                link.last_activity = now;
                match deserialize::<LinkPacket>(&bytes) {
                    Ok(LinkPacket::Heartbeat { .. }) => {}
                    Ok(LinkPacket::Goodbye) => self.remote_closed(&peer, now),
                    Ok(packet) => self.events.push(LinkEvent::Packet { peer, packet }),
                    Err(e) => warn!("Dropping undecodable packet from {}: {}", peer, e),
                }
            }
            TransportEvent::Closed(peer) => self.remote_closed(&peer, now),
            TransportEvent::LocalCandidate(peer, candidate) => {
                if self.state(&peer) == LinkState::Connecting {
                    self.signaling.send(&peer, SignalKind::Candidate, candidate, now);
                }
            }
        }
    }

    fn remote_closed(&mut self, peer: &PeerId, now: Instant) {
        match self.state(peer) {
            LinkState::Open => {
                if let Some(link) = self.links.remove(peer) {
                    self.cancel_timers(&link);
                }
                self.transport.close(peer);
                info!("Link to {} closed by remote", peer);
                self.events.push(LinkEvent::Closed(peer.clone()));
            }
            LinkState::Connecting => self.attempt_failed(peer, now),
            _ => {}
        }
    }

    fn check_liveness(&mut self, now: Instant) {
        let mut silent = Vec::new();
        let mut heartbeats = Vec::new();
        for link in self.links.values_mut() {
            if link.state != LinkState::Open {
                continue;
            }
            if now.duration_since(link.last_activity) >= self.config.link_idle_timeout {
                silent.push(link.peer.clone());
            } else if now.duration_since(link.last_heartbeat) >= self.config.heartbeat_interval {
                link.last_heartbeat = now;
                heartbeats.push(link.peer.clone());
            }
        }

        let heartbeat = LinkPacket::Heartbeat {
            sent_at: timestamp_ms(),
        };
        for peer in heartbeats {
            self.send_packet(&peer, &heartbeat);
        }
        for peer in silent {
            warn!("Link to {} went silent", peer);
            self.remote_closed(&peer, now);
        }
    }

    /// Closes every link and cancels every timer; safe to call repeatedly
    pub fn shutdown(&mut self) {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        for peer in peers {
            if self.state(&peer) == LinkState::Open {
                self.send_packet(&peer, &LinkPacket::Goodbye);
            }
            self.transport.close(&peer);
        }
        self.links.clear();
        self.timers.clear();
        self.signaling.clear();
        self.events.clear();
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
