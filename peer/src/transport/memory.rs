//! In-process transport used by tests and local simulations

use super::{Transport, TransportEvent};
use crate::error::TransportError;
use log::debug;
use shared::PeerId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
struct NetworkState {
    /// (local, remote) -> open
    endpoints: HashMap<(PeerId, PeerId), bool>,
    queues: HashMap<PeerId, Vec<TransportEvent>>,
    sent_packets: HashMap<(PeerId, PeerId), usize>,
}

impl NetworkState {
    fn push(&mut self, to: &PeerId, event: TransportEvent) {
        self.queues.entry(to.clone()).or_default().push(event);
    }
}

/// A single-threaded in-memory network connecting `MemoryTransport` endpoints
///
/// Links open when the initiator accepts the answer and both endpoints
/// exist. Tests use `drop_link` to simulate a remote hangup.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, local: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            local: PeerId::new(local),
            state: Rc::clone(&self.state),
        }
    }

    pub fn is_open(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.state.borrow();
        state.endpoints.get(&(a.clone(), b.clone())) == Some(&true)
            && state.endpoints.get(&(b.clone(), a.clone())) == Some(&true)
    }

    /// Cuts the link between two peers, both sides observe `Closed`
    pub fn drop_link(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.borrow_mut();
        let had_a = state.endpoints.remove(&(a.clone(), b.clone())).is_some();
        let had_b = state.endpoints.remove(&(b.clone(), a.clone())).is_some();
        if had_a {
            state.push(a, TransportEvent::Closed(b.clone()));
        }
        if had_b {
            state.push(b, TransportEvent::Closed(a.clone()));
        }
    }

    /// Number of payload sends from `from` to `to` so far
    pub fn sent_count(&self, from: &PeerId, to: &PeerId) -> usize {
        self.state
            .borrow()
            .sent_packets
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }
}

pub struct MemoryTransport {
    local: PeerId,
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryTransport {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn key(&self, peer: &PeerId) -> (PeerId, PeerId) {
        (self.local.clone(), peer.clone())
    }
}

impl Transport for MemoryTransport {
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, TransportError> {
        let mut state = self.state.borrow_mut();
        state.endpoints.insert(self.key(peer), false);
        state.push(
            &self.local,
            TransportEvent::LocalCandidate(peer.clone(), format!("cand:{}", self.local)),
        );
        Ok(format!("offer:{}", self.local))
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, TransportError> {
        if !offer.starts_with("offer:") {
            return Err(TransportError::BadSignal(offer.to_string()));
        }
        let mut state = self.state.borrow_mut();
        state.endpoints.insert(self.key(peer), false);
        Ok(format!("answer:{}", self.local))
    }

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), TransportError> {
        if !answer.starts_with("answer:") {
            return Err(TransportError::BadSignal(answer.to_string()));
        }
        let mut state = self.state.borrow_mut();
        let local_key = self.key(peer);
        let remote_key = (peer.clone(), self.local.clone());
        if !state.endpoints.contains_key(&local_key) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        if state.endpoints.contains_key(&remote_key) {
            state.endpoints.insert(local_key, true);
            state.endpoints.insert(remote_key, true);
            state.push(&self.local, TransportEvent::Opened(peer.clone()));
            state.push(peer, TransportEvent::Opened(self.local.clone()));
            debug!("memory link {} <-> {} open", self.local, peer);
        }
        Ok(())
    }

    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), TransportError> {
        if !candidate.starts_with("cand:") {
            return Err(TransportError::BadSignal(candidate.to_string()));
        }
        if !self.state.borrow().endpoints.contains_key(&self.key(peer)) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        Ok(())
    }

    fn send(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let open = state.endpoints.get(&self.key(peer)) == Some(&true)
            && state.endpoints.get(&(peer.clone(), self.local.clone())) == Some(&true);
        if !open {
            return Err(TransportError::NotOpen(peer.clone()));
        }
        *state.sent_packets.entry(self.key(peer)).or_insert(0) += 1;
        state.push(peer, TransportEvent::Data(self.local.clone(), bytes.to_vec()));
        Ok(())
    }

    fn close(&mut self, peer: &PeerId) {
        let mut state = self.state.borrow_mut();
        let was_open = state.endpoints.remove(&self.key(peer)) == Some(true);
        let remote_key = (peer.clone(), self.local.clone());
        if was_open && state.endpoints.remove(&remote_key).is_some() {
            state.push(peer, TransportEvent::Closed(self.local.clone()));
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.state
            .borrow_mut()
            .queues
            .remove(&self.local)
            .unwrap_or_default()
    }
}
