//! Smoothing of remotely owned entities
//!
//! Remote updates arrive in bursts of a few per second. Each tick the visible
//! position moves a fixed fraction `alpha` of the remaining distance toward the
//! latest snapshot, so motion stays continuous between updates and simply
//! settles on the last known value when updates stop arriving.

use shared::{EntityId, MovePayload};
use std::collections::HashMap;
use std::time::Instant;

/// Latest authoritative value announced by an entity's owner
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub target_x: f32,
    pub target_y: f32,
    pub angle: f32,
    pub vx: f32,
    pub vy: f32,
    pub last_seen_at: Instant,
}

#[derive(Debug)]
struct Track {
    snapshot: RemoteSnapshot,
    visible_x: f32,
    visible_y: f32,
    alpha: f32,
}

#[derive(Debug)]
pub struct Interpolator {
    tracks: HashMap<EntityId, Track>,
    snap_epsilon: f32,
}

impl Interpolator {
    pub fn new(snap_epsilon: f32) -> Self {
        Self {
            tracks: HashMap::new(),
            snap_epsilon,
        }
    }

    /// Starts tracking an entity, visible at its spawn position
    pub fn track(&mut self, id: &str, x: f32, y: f32, alpha: f32, now: Instant) {
        self.tracks.insert(
            id.to_string(),
            Track {
                snapshot: RemoteSnapshot {
                    target_x: x,
                    target_y: y,
                    angle: 0.0,
                    vx: 0.0,
                    vy: 0.0,
                    last_seen_at: now,
                },
                visible_x: x,
                visible_y: y,
                alpha: alpha.clamp(0.0, 1.0),
            },
        );
    }

    /// Replaces the snapshot target; returns false for untracked entities
    pub fn update(&mut self, update: &MovePayload, now: Instant) -> bool {
        let Some(track) = self.tracks.get_mut(&update.entity_id) else {
            return false;
        };
        track.snapshot = RemoteSnapshot {
            target_x: update.x,
            target_y: update.y,
            angle: update.angle,
            vx: update.vx,
            vy: update.vy,
            last_seen_at: now,
        };
        true
    }

    /// Moves a re-announced entity's target without touching its visible position
    pub fn retarget(&mut self, id: &str, x: f32, y: f32, now: Instant) {
        if let Some(track) = self.tracks.get_mut(id) {
            track.snapshot.target_x = x;
            track.snapshot.target_y = y;
            track.snapshot.last_seen_at = now;
        }
    }

    /// Advances every visible position one tick toward its target
    pub fn step(&mut self) {
        for track in self.tracks.values_mut() {
            let dx = track.snapshot.target_x - track.visible_x;
            let dy = track.snapshot.target_y - track.visible_y;
            if dx.hypot(dy) <= self.snap_epsilon {
                track.visible_x = track.snapshot.target_x;
                track.visible_y = track.snapshot.target_y;
            } else {
                track.visible_x += dx * track.alpha;
                track.visible_y += dy * track.alpha;
            }
        }
    }

    /// Smoothed position and the latest announced angle
    pub fn visible(&self, id: &str) -> Option<(f32, f32, f32)> {
        self.tracks
            .get(id)
            .map(|t| (t.visible_x, t.visible_y, t.snapshot.angle))
    }

    pub fn snapshot(&self, id: &str) -> Option<&RemoteSnapshot> {
        self.tracks.get(id).map(|t| &t.snapshot)
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracks.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) {
        self.tracks.remove(id);
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
