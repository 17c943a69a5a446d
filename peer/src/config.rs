//! Tunables for a synchronization session

use crate::world::EntityClass;
use shared::MAX_PEERS;
use std::time::Duration;

/// Timing, bandwidth and smoothing parameters shared by all session components
///
/// The defaults mirror the values the browser game shipped with: a 10 second
/// handshake window, three attempts per peer, 150 ms move batches capped at 20
/// entries, and per-class send intervals and smoothing factors.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a handshake may stay in CONNECTING before it counts as failed
    pub handshake_timeout: Duration,
    /// Total handshake attempts per peer before the link is marked FAILED
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry
    pub retry_jitter: Duration,

    pub batch_interval: Duration,
    pub max_batch_size: usize,

    pub avatar_send_interval: Duration,
    pub npc_send_interval: Duration,
    pub prop_send_interval: Duration,

    pub avatar_alpha: f32,
    pub npc_alpha: f32,
    pub prop_alpha: f32,
    /// Distance under which a smoothed position snaps onto its target
    pub snap_epsilon: f32,

    pub heartbeat_interval: Duration,
    /// Silence after which an open link is considered closed
    pub link_idle_timeout: Duration,

    pub signaling_backoff: Duration,
    pub signaling_backoff_max: Duration,
    pub mailbox_poll_interval: Duration,

    pub max_peers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            retry_jitter: Duration::from_millis(250),

            batch_interval: Duration::from_millis(150),
            max_batch_size: 20,

            avatar_send_interval: Duration::from_millis(200),
            npc_send_interval: Duration::from_millis(300),
            prop_send_interval: Duration::from_millis(1000),

            avatar_alpha: 0.3,
            npc_alpha: 0.15,
            prop_alpha: 0.5,
            snap_epsilon: 0.01,

            heartbeat_interval: Duration::from_secs(1),
            link_idle_timeout: Duration::from_secs(5),

            signaling_backoff: Duration::from_millis(500),
            signaling_backoff_max: Duration::from_secs(8),
            mailbox_poll_interval: Duration::from_millis(100),

            max_peers: MAX_PEERS,
        }
    }
}

impl SyncConfig {
    pub fn send_interval(&self, class: EntityClass) -> Duration {
        match class {
            EntityClass::Avatar => self.avatar_send_interval,
            EntityClass::Npc => self.npc_send_interval,
            EntityClass::Prop => self.prop_send_interval,
        }
    }

    pub fn alpha(&self, class: EntityClass) -> f32 {
        match class {
            EntityClass::Avatar => self.avatar_alpha,
            EntityClass::Npc => self.npc_alpha,
            EntityClass::Prop => self.prop_alpha,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5);
        self.retry_delay * 2u32.pow(exponent)
    }
}
