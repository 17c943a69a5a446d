//! Typed dispatch of inbound envelopes to game-logic handlers
//!
//! Handlers are registered per envelope kind and called in registration
//! order. They receive the envelope together with the authority verdict, so a
//! handler can tell an owner's update from an advisory hint.

use crate::authority::Verdict;
use shared::{Envelope, EnvelopeKind};
use std::collections::HashMap;

pub type Handler = Box<dyn FnMut(&Envelope, Verdict)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<EnvelopeKind, Vec<(SubscriptionId, Handler)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: EnvelopeKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Envelope, Verdict) + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.handlers.values_mut() {
            if let Some(index) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    /// Calls every handler for the envelope's kind; returns how many ran
    pub fn dispatch(&mut self, envelope: &Envelope, verdict: Verdict) -> usize {
        let Some(handlers) = self.handlers.get_mut(&envelope.kind()) else {
            return 0;
        };
        for (_, handler) in handlers.iter_mut() {
            handler(envelope, verdict);
        }
        handlers.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{DeletePayload, MovePayload, Payload, PeerId};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn move_envelope() -> Envelope {
        Envelope::new(
            PeerId::new("host"),
            Payload::Move(MovePayload::new("mouse_1", 1.0, 2.0)),
        )
    }

    #[test]
    fn test_dispatch_by_kind() {
        let mut bus = EventBus::new();
        let moves = Rc::new(RefCell::new(Vec::new()));
        let deletes = Rc::new(RefCell::new(0));

        let seen = Rc::clone(&moves);
        bus.subscribe(EnvelopeKind::Move, move |envelope, verdict| {
            seen.borrow_mut()
                .push((envelope.entity_id().unwrap_or_default().to_string(), verdict));
        });
        let counter = Rc::clone(&deletes);
        bus.subscribe(EnvelopeKind::Delete, move |_, _| {
            *counter.borrow_mut() += 1;
        });

        assert_eq!(bus.dispatch(&move_envelope(), Verdict::Advisory), 1);
        assert_eq!(
            moves.borrow().as_slice(),
            &[("mouse_1".to_string(), Verdict::Advisory)]
        );
        assert_eq!(*deletes.borrow(), 0);

        let delete = Envelope::new(
            PeerId::new("host"),
            Payload::Delete(DeletePayload {
                entity_id: "mouse_1".to_string(),
            }),
        );
        bus.dispatch(&delete, Verdict::Authoritative);
        assert_eq!(*deletes.borrow(), 1);
    }

    #[test]
    fn test_unsubscribe_and_clear() {
        let mut bus = EventBus::new();
        let calls = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&calls);
        let first = bus.subscribe(EnvelopeKind::Move, move |_, _| {
            *counter.borrow_mut() += 1;
        });
        let counter = Rc::clone(&calls);
        bus.subscribe(EnvelopeKind::Move, move |_, _| {
            *counter.borrow_mut() += 10;
        });

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.dispatch(&move_envelope(), Verdict::Authoritative);
        assert_eq!(*calls.borrow(), 10);

        bus.clear();
        assert_eq!(bus.handler_count(), 0);
        assert_eq!(bus.dispatch(&move_envelope(), Verdict::Authoritative), 0);
    }
}
