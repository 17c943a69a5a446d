//! Coalescing outbound queue for `move` envelopes
//!
//! Positions are idempotent state, so only the newest queued value per entity
//! is kept. The queue is flushed when it reaches the configured size or when
//! the batch interval has passed since the last flush, whichever comes first.
//! Entities announced by this peer carry a minimum send interval: a value that
//! is not yet allowed out stays queued, still coalescing, until it is.

use crate::config::SyncConfig;
use shared::{EntityId, Envelope, PeerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Queued {
    envelope: Envelope,
    min_interval: Option<Duration>,
}

#[derive(Debug)]
pub struct OutboundBatcher {
    queue: Vec<Queued>,
    last_sent: HashMap<EntityId, Instant>,
    max_size: usize,
    interval: Duration,
    last_flush: Instant,
}

impl OutboundBatcher {
    pub fn new(config: &SyncConfig, now: Instant) -> Self {
        Self {
            queue: Vec::new(),
            last_sent: HashMap::new(),
            max_size: config.max_batch_size.max(1),
            interval: config.batch_interval,
            last_flush: now,
        }
    }

    /// Queues a move, replacing any queued value for the same entity
    ///
    /// `min_interval` rate limits locally announced entities; forwarded moves
    /// pass `None`. Returns a batch when the queue reached its size limit.
    pub fn push(
        &mut self,
        envelope: Envelope,
        min_interval: Option<Duration>,
        now: Instant,
    ) -> Option<Vec<Envelope>> {
        let entity = envelope.entity_id().map(str::to_string);
        let existing = entity.as_deref().and_then(|id| {
            self.queue
                .iter()
                .position(|queued| queued.envelope.entity_id() == Some(id))
        });

        match existing {
            Some(index) => {
                self.queue[index] = Queued {
                    envelope,
                    min_interval,
                }
            }
            None => self.queue.push(Queued {
                envelope,
                min_interval,
            }),
        }

        if self.queue.len() >= self.max_size {
            self.take(now)
        } else {
            None
        }
    }

    /// Returns a batch if the batch interval has passed since the last flush
    pub fn flush_due(&mut self, now: Instant) -> Option<Vec<Envelope>> {
        if self.queue.is_empty() || now.duration_since(self.last_flush) < self.interval {
            return None;
        }
        self.take(now)
    }

    fn ready(&self, queued: &Queued, now: Instant) -> bool {
        let (Some(interval), Some(id)) = (queued.min_interval, queued.envelope.entity_id()) else {
            return true;
        };
        self.last_sent
            .get(id)
            .map_or(true, |sent| now.duration_since(*sent) >= interval)
    }

    fn take(&mut self, now: Instant) -> Option<Vec<Envelope>> {
        let mut batch = Vec::new();
        let mut held = Vec::new();
        for queued in std::mem::take(&mut self.queue) {
            if batch.len() < self.max_size && self.ready(&queued, now) {
                if let (Some(_), Some(id)) = (queued.min_interval, queued.envelope.entity_id()) {
                    self.last_sent.insert(id.to_string(), now);
                }
                batch.push(queued.envelope);
            } else {
                held.push(queued);
            }
        }
        self.queue = held;

        // A flush that sent nothing does not restart the interval
        if batch.is_empty() {
            None
        } else {
            self.last_flush = now;
            Some(batch)
        }
    }

    /// The part of a batch worth sending to `peer`: never its own envelopes
    pub fn for_link(batch: &[Envelope], peer: &PeerId) -> Vec<Envelope> {
        batch
            .iter()
            .filter(|envelope| envelope.sender != *peer)
            .cloned()
            .collect()
    }

    /// Drops queued values and rate-limit state for a removed entity
    pub fn forget(&mut self, entity: &str) {
        self.queue
            .retain(|queued| queued.envelope.entity_id() != Some(entity));
        self.last_sent.remove(entity);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_sent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MovePayload, Payload};

    fn move_from(sender: &str, entity: &str, x: f32) -> Envelope {
        Envelope::new(
            PeerId::new(sender),
            Payload::Move(MovePayload::new(entity, x, 0.0)),
        )
    }

    fn x_of(envelope: &Envelope) -> f32 {
        match &envelope.payload {
            Payload::Move(m) => m.x,
            _ => panic!("Wrong payload type, expected Move"),
        }
    }

    #[test]
    fn test_coalesces_to_latest_value() {
        let config = SyncConfig::default();
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);

        for i in 0..25 {
            assert!(batcher.push(move_from("host", "cat_1", i as f32), None, start).is_none());
        }
        assert_eq!(batcher.len(), 1);

        assert!(batcher.flush_due(start + Duration::from_millis(100)).is_none());
        let batch = batcher
            .flush_due(start + config.batch_interval)
            .expect("interval elapsed");
        assert_eq!(batch.len(), 1);
        assert_eq!(x_of(&batch[0]), 24.0);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_size_threshold_flushes_early() {
        let config = SyncConfig::default();
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);

        let mut flushed = None;
        for i in 0..config.max_batch_size {
            flushed = batcher.push(move_from("host", &format!("mouse_{}", i), 0.0), None, start);
        }
        let batch = flushed.expect("queue reached max size");
        assert_eq!(batch.len(), config.max_batch_size);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batch_never_exceeds_max() {
        let config = SyncConfig {
            max_batch_size: 5,
            ..SyncConfig::default()
        };
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);

        // Everything held back by the rate limiter piles up past the cap
        for i in 0..12 {
            let id = format!("mouse_{}", i);
            batcher.last_sent.insert(id.clone(), start);
            batcher.push(move_from("host", &id, 0.0), Some(Duration::from_secs(1)), start);
        }
        assert_eq!(batcher.len(), 12);

        let later = start + Duration::from_secs(1);
        let mut sizes = Vec::new();
        while let Some(batch) = batcher.flush_due(later + config.batch_interval * sizes.len() as u32) {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn test_rate_limit_holds_latest_value() {
        let config = SyncConfig::default();
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);
        let interval = config.npc_send_interval;

        batcher.push(move_from("host", "mouse_1", 1.0), Some(interval), start);
        let first = batcher.flush_due(start + config.batch_interval).unwrap();
        assert_eq!(x_of(&first[0]), 1.0);

        // Sent 150ms ago, limit is 300ms
        batcher.push(move_from("host", "mouse_1", 2.0), Some(interval), start);
        assert!(batcher.flush_due(start + config.batch_interval * 2).is_none());
        batcher.push(move_from("host", "mouse_1", 3.0), Some(interval), start);

        let second = batcher
            .flush_due(start + config.batch_interval * 3)
            .expect("rate limit elapsed");
        assert_eq!(second.len(), 1);
        assert_eq!(x_of(&second[0]), 3.0);
    }

    #[test]
    fn test_held_value_leaves_when_its_interval_elapses() {
        let config = SyncConfig {
            batch_interval: Duration::from_millis(150),
            ..SyncConfig::default()
        };
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);
        let interval = Duration::from_millis(200);

        batcher.push(move_from("host", "cat_1", 1.0), Some(interval), start);
        assert!(batcher.flush_due(start + Duration::from_millis(150)).is_some());

        batcher.push(move_from("host", "cat_1", 2.0), Some(interval), start);
        // Batch interval elapsed but the entity is still rate limited
        assert!(batcher.flush_due(start + Duration::from_millis(300)).is_none());

        let batch = batcher
            .flush_due(start + Duration::from_millis(350))
            .expect("held value goes out once its own interval elapsed");
        assert_eq!(x_of(&batch[0]), 2.0);
    }

    #[test]
    fn test_for_link_skips_peer_own_envelopes() {
        let batch = vec![
            move_from("m1", "dog_3", 1.0),
            move_from("host", "mouse_1", 2.0),
            move_from("m2", "cat_1", 3.0),
        ];
        let to_m1 = OutboundBatcher::for_link(&batch, &PeerId::new("m1"));
        assert_eq!(to_m1.len(), 2);
        assert!(to_m1.iter().all(|e| e.sender.as_str() != "m1"));
    }

    #[test]
    fn test_forget_drops_queued_value() {
        let config = SyncConfig::default();
        let start = Instant::now();
        let mut batcher = OutboundBatcher::new(&config, start);
        batcher.push(move_from("host", "mouse_1", 1.0), None, start);
        batcher.forget("mouse_1");
        assert!(batcher.flush_due(start + config.batch_interval).is_none());
    }
}
