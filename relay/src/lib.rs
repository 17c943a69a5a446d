//! # Signaling Relay
//!
//! A small UDP service that lets peers find each other and exchange the
//! handshake records they need before a direct link exists. It does not see
//! or forward game traffic.
//!
//! ## Responsibilities
//!
//! ### Rooms
//! Peers join a room by id. The first peer to join a room without a host is
//! designated host, and every membership change is pushed to all members as a
//! fresh `Members` listing. Members that stop sending heartbeats are evicted.
//!
//! ### Mailbox
//! Handshake records are stored per room until the addressee fetches and
//! acknowledges them. A record addressed to someone who is not in the room is
//! answered with `Undeliverable` so the sender can fail fast.
//!
//! ## Module Organization
//!
//! - `rooms`: `RoomRegistry`, membership, host designation and stored records
//! - `network`: `RelayServer`, the socket tasks and the request loop

pub mod network;
pub mod rooms;

pub use network::RelayServer;
pub use rooms::RoomRegistry;
