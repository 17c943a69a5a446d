//! Handshake record exchange through the relay mailbox
//!
//! The signaling client only moves offer/answer/candidate records; it has no
//! notion of game state. Records are addressed `(from, to, kind, data)`, only
//! records addressed to the local peer are acted on, self-authored records
//! are ignored, and every processed record is removed from the mailbox.
//! A relay failure puts the client into backoff: posts stay queued and
//! fetches pause until the backoff expires.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::relay_client::{Mailbox, MailboxItem};
use log::{debug, warn};
use shared::{PeerId, RoomId, SignalKind, SignalRecord};
use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Record(SignalRecord),
    Unreachable(PeerId),
}

pub struct SignalingClient<R> {
    relay: R,
    room: RoomId,
    local: PeerId,
    outbox: VecDeque<SignalRecord>,
    events: Vec<SignalEvent>,

    base_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    retry_at: Option<Instant>,

    poll_interval: Duration,
    last_fetch: Option<Instant>,
    degraded: bool,
}

impl<R: Mailbox> SignalingClient<R> {
    pub fn new(relay: R, room: RoomId, local: PeerId, config: &SyncConfig) -> Self {
        Self {
            relay,
            room,
            local,
            outbox: VecDeque::new(),
            events: Vec::new(),
            base_backoff: config.signaling_backoff,
            max_backoff: config.signaling_backoff_max,
            backoff: config.signaling_backoff,
            retry_at: None,
            poll_interval: config.mailbox_poll_interval,
            last_fetch: None,
            degraded: false,
        }
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn relay_mut(&mut self) -> &mut R {
        &mut self.relay
    }

    /// True while posts are queued behind a relay failure or reads are failing
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Addresses a record to `to` and posts it, queueing it if the relay is down
    pub fn send(&mut self, to: &PeerId, kind: SignalKind, data: String, now: Instant) {
        self.outbox.push_back(SignalRecord {
            from: self.local.clone(),
            to: to.clone(),
            kind,
            data,
            room: self.room.clone(),
        });
        self.flush_outbox(now);
    }

    /// Retries queued posts and reads the mailbox
    pub fn poll(&mut self, now: Instant) -> Vec<SignalEvent> {
        self.flush_outbox(now);

        let fetch_due = self
            .last_fetch
            .map_or(true, |at| now.duration_since(at) >= self.poll_interval);
        if !self.in_backoff(now) && fetch_due {
            self.last_fetch = Some(now);
            self.read_mailbox(now);
        }

        mem::take(&mut self.events)
    }

    /// Drops queued posts; used on teardown
    pub fn clear(&mut self) {
        self.outbox.clear();
        self.events.clear();
        self.retry_at = None;
        self.backoff = self.base_backoff;
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now < at)
    }

    fn enter_backoff(&mut self, now: Instant, err: &SyncError) {
        warn!(
            "Signaling degraded ({}), retrying in {:?}",
            err, self.backoff
        );
        self.retry_at = Some(now + self.backoff);
        self.backoff = (self.backoff * 2).min(self.max_backoff);
        self.degraded = true;
    }

    fn recover(&mut self) {
        self.retry_at = None;
        self.backoff = self.base_backoff;
        if self.degraded && self.outbox.is_empty() {
            debug!("Signaling recovered");
            self.degraded = false;
        }
    }

    fn flush_outbox(&mut self, now: Instant) {
        if self.outbox.is_empty() || self.in_backoff(now) {
            return;
        }
        while let Some(record) = self.outbox.front().cloned() {
            match self.relay.post(record) {
                Ok(()) => {
                    self.outbox.pop_front();
                }
                Err(SyncError::PeerUnreachable(peer)) => {
                    self.outbox.pop_front();
                    self.events.push(SignalEvent::Unreachable(peer));
                }
                Err(e) => {
                    self.enter_backoff(now, &e);
                    return;
                }
            }
        }
        self.recover();
    }

    fn read_mailbox(&mut self, now: Instant) {
        let items = match self.relay.fetch(&self.room, &self.local) {
            Ok(items) => items,
            Err(e) => {
                self.enter_backoff(now, &e);
                return;
            }
        };

        let mut processed = Vec::new();
        for item in items {
            match item {
                MailboxItem::Record { id, record } => {
                    if record.room != self.room || record.from == self.local {
                        continue;
                    }
                    if record.to != self.local {
                        continue;
                    }
                    processed.push(id);
                    self.events.push(SignalEvent::Record(record));
                }
                MailboxItem::Undeliverable { to } => {
                    self.events.push(SignalEvent::Unreachable(to));
                }
            }
        }

        if !processed.is_empty() {
            if let Err(e) = self.relay.remove(&self.room, &processed) {
                self.enter_backoff(now, &e);
                return;
            }
        }
        self.recover();
    }
}
