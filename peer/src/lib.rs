//! # Peer Synchronization Core
//!
//! This library keeps a small group of game clients looking at the same scene
//! without a simulation server. One peer is the room's host and owns the
//! ambient entities; every peer owns its own avatar; state travels over
//! direct peer-to-peer links that are bootstrapped through a signaling relay.
//!
//! ## Architecture Overview
//!
//! Everything runs on the caller's game loop. Network I/O completes in the
//! background and is queued; `SyncSession::tick` drains those queues, advances
//! timers and flushes outbound traffic. No call ever waits on a round trip.
//!
//! ### Links
//! The connection manager drives one handshake state machine per remote peer
//! (`Idle -> Connecting -> Open`, with bounded retries into `Failed`). The
//! handshake records travel through the relay mailbox; once a link is open
//! the relay is no longer involved.
//!
//! ### Ownership
//! Whoever spawns an entity owns it for life. Only the owner's `move` and
//! `action` envelopes change local state; anything else is passed to game
//! logic as an advisory hint. When an owner disconnects, the host deletes its
//! entities for everyone.
//!
//! ### Bandwidth
//! `move` envelopes are coalesced per entity and sent in batches, either every
//! batch interval or when the batch is full. `spawn`, `delete`, `action` and
//! `request_spawn` go out immediately.
//!
//! ### Smoothing
//! Remote entities are drawn at a position that eases toward the latest value
//! their owner announced, so sparse updates still look like continuous motion.
//!
//! ## Module Organization
//!
//! - `session`: `SyncSession`, the single entry point for the game loop
//! - `connection`: per-peer link state machine, retries and liveness
//! - `signaling`: handshake records through the relay mailbox
//! - `transport`: the `Transport` trait with in-memory and UDP implementations
//! - `relay_client`: the `Mailbox` and `RoomService` traits and their clients
//! - `authority`: entity ownership and the inbound acceptance rule
//! - `event_bus`: per-kind handler registry
//! - `batcher`: coalescing, rate-limited `move` queue
//! - `interpolation`: exponential smoothing of remote entities
//! - `world`: local copy of every known entity
//! - `timer`: cancellable deadlines polled from the tick
//! - `config`: `SyncConfig` tunables
//! - `error`: `SyncError` and `TransportError`
//!
//! ## Usage Example
//!
//! ```rust
//! use peer::relay_client::MemoryRelay;
//! use peer::session::SyncSession;
//! use peer::transport::MemoryNetwork;
//! use peer::SyncConfig;
//! use shared::{Member, PeerId, RoomId, SpawnPayload};
//! use std::time::Instant;
//!
//! let network = MemoryNetwork::new();
//! let relay = MemoryRelay::new();
//! let room = RoomId::new("lobby");
//! relay.join(&room, Member::new("host", true));
//!
//! let now = Instant::now();
//! let mut session = SyncSession::new(
//!     PeerId::new("host"),
//!     room.clone(),
//!     SyncConfig::default(),
//!     network.endpoint("host"),
//!     relay.handle(&room),
//!     now,
//! );
//! session.start(now);
//! session
//!     .spawn_local(SpawnPayload::new("mouse_1", "MOUSE", 100.0, 100.0))
//!     .unwrap();
//! session.tick(now);
//! assert_eq!(session.entity_count(), 1);
//! session.teardown();
//! ```

pub mod authority;
pub mod batcher;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod interpolation;
pub mod relay_client;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod transport;
pub mod world;

pub use config::SyncConfig;
pub use error::{SyncError, TransportError};
pub use session::{SessionEvent, SyncSession};
