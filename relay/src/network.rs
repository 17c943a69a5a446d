//! Relay network layer: UDP receive/send tasks and the request loop

use crate::rooms::{JoinOutcome, PostOutcome, RoomRegistry};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{RelayPacket, RoomId, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Most records returned in one `Records` datagram
const MAX_RECORDS_PER_PACKET: usize = 32;

pub type RelayResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Messages sent from network tasks to the request loop
#[derive(Debug)]
pub enum RelayMessage {
    PacketReceived {
        packet: RelayPacket,
        addr: SocketAddr,
    },
    /// Members of the room were evicted for silence
    MembersEvicted {
        room: RoomId,
    },
}

/// Messages sent from the request loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: RelayPacket,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: RelayPacket,
        addrs: Vec<SocketAddr>,
    },
}

/// Signaling relay and room service
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    rooms: Arc<RwLock<RoomRegistry>>,
    check_interval: Duration,

    // Communication channels
    relay_tx: mpsc::UnboundedSender<RelayMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl RelayServer {
    pub async fn new(
        addr: &str,
        max_members: usize,
        member_timeout: Duration,
    ) -> RelayResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Relay listening on {}", socket.local_addr()?);

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(RelayServer {
            socket,
            rooms: Arc::new(RwLock::new(RoomRegistry::new(max_members, member_timeout))),
            check_interval: (member_timeout / 5).max(Duration::from_millis(100)),
            relay_tx,
            relay_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let relay_tx = self.relay_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<RelayPacket>(&buffer[..len]) {
                            if let Err(e) =
                                relay_tx.send(RelayMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastPacket { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that evicts silent members
    fn spawn_timeout_checker(&self) {
        let rooms = Arc::clone(&self.rooms);
        let relay_tx = self.relay_tx.clone();
        let check_interval = self.check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);

            loop {
                interval.tick().await;

                let changed = {
                    let mut rooms = rooms.write().await;
                    rooms.check_timeouts(Instant::now())
                };

                for room in changed {
                    if let Err(e) = relay_tx.send(RelayMessage::MembersEvicted { room }) {
                        error!("Failed to send eviction message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &RelayPacket,
        addr: SocketAddr,
    ) -> RelayResult<()> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: RelayPacket, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Pushes the current member listing to everyone in the room
    async fn broadcast_members(&self, room: &RoomId) {
        let (members, addrs) = {
            let rooms = self.rooms.read().await;
            (rooms.listing(room), rooms.member_addrs(room))
        };
        if addrs.is_empty() {
            return;
        }

        let packet = RelayPacket::Members {
            room: room.clone(),
            members,
        };
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::BroadcastPacket { packet, addrs })
        {
            error!("Failed to queue membership broadcast: {}", e);
        }
    }

    fn reject(&self, reason: &str, addr: SocketAddr) {
        self.send_packet(
            RelayPacket::Rejected {
                reason: reason.to_string(),
            },
            addr,
        );
    }

    /// Handles one request from a peer
    async fn handle_packet(&mut self, packet: RelayPacket, addr: SocketAddr) {
        let now = Instant::now();
        match packet {
            RelayPacket::Join {
                room,
                peer,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "{} at {} speaks protocol {}, expected {}",
                        peer, addr, version, PROTOCOL_VERSION
                    );
                    self.reject("Protocol version mismatch", addr);
                    return;
                }

                let outcome = {
                    let mut rooms = self.rooms.write().await;
                    rooms.join(&room, &peer, addr, now)
                };

                match outcome {
                    JoinOutcome::Joined { .. } => self.broadcast_members(&room).await,
                    JoinOutcome::Rejoined => {
                        let members = self.rooms.read().await.listing(&room);
                        self.send_packet(RelayPacket::Members { room, members }, addr);
                    }
                    JoinOutcome::Full => {
                        info!("Room {} is full, rejecting {}", room, peer);
                        self.reject("Room full", addr);
                    }
                }
            }

            RelayPacket::Leave { room, peer } => {
                let removed = {
                    let mut rooms = self.rooms.write().await;
                    rooms.member_at(&room, addr).as_ref() == Some(&peer)
                        && rooms.leave(&room, &peer)
                };
                if removed {
                    self.broadcast_members(&room).await;
                }
            }

            RelayPacket::Heartbeat { room, peer } => {
                let known = {
                    let mut rooms = self.rooms.write().await;
                    rooms.touch(&room, &peer, addr, now)
                };
                if !known {
                    debug!("Heartbeat from {} at {}, not a member of {}", peer, addr, room);
                    self.reject("Not a member", addr);
                }
            }

            RelayPacket::Post { record } => {
                let room = record.room.clone();
                let to = record.to.clone();
                let outcome = {
                    let mut rooms = self.rooms.write().await;
                    rooms.touch(&room, &record.from, addr, now);
                    rooms.post(record, addr)
                };

                match outcome {
                    PostOutcome::Stored(id) => debug!("Stored record {} for {} in {}", id, to, room),
                    PostOutcome::UnknownRecipient => {
                        self.send_packet(RelayPacket::Undeliverable { room, to }, addr)
                    }
                    PostOutcome::NotMember => self.reject("Not a member", addr),
                }
            }

            RelayPacket::Fetch { room, peer } => {
                let records = {
                    let mut rooms = self.rooms.write().await;
                    if !rooms.touch(&room, &peer, addr, now) {
                        None
                    } else {
                        Some(rooms.fetch(&room, &peer))
                    }
                };

                match records {
                    Some(records) => {
                        for chunk in records.chunks(MAX_RECORDS_PER_PACKET) {
                            self.send_packet(
                                RelayPacket::Records {
                                    room: room.clone(),
                                    records: chunk.to_vec(),
                                },
                                addr,
                            );
                        }
                    }
                    None => self.reject("Not a member", addr),
                }
            }

            RelayPacket::Ack { room, ids } => {
                let mut rooms = self.rooms.write().await;
                if let Some(peer) = rooms.member_at(&room, addr) {
                    rooms.ack(&room, &peer, &ids);
                }
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    /// Main relay loop
    pub async fn run(&mut self) -> RelayResult<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Relay started successfully");

        while let Some(message) = self.relay_rx.recv().await {
            match message {
                RelayMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                RelayMessage::MembersEvicted { room } => {
                    self.broadcast_members(&room).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PeerId;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_test::assert_ok;

    #[test]
    fn test_relay_message_creation() {
        let packet = RelayPacket::Join {
            room: RoomId::new("lobby"),
            peer: PeerId::new("host"),
            version: PROTOCOL_VERSION,
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000);

        let msg = RelayMessage::PacketReceived {
            packet: packet.clone(),
            addr,
        };

        match msg {
            RelayMessage::PacketReceived { packet: p, addr: a } => {
                assert_eq!(a, addr);
                match p {
                    RelayPacket::Join { version, .. } => assert_eq!(version, PROTOCOL_VERSION),
                    _ => panic!("Unexpected packet type"),
                }
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[test]
    fn test_broadcast_message() {
        let addrs = vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4000),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4001),
        ];
        let msg = OutboundMessage::BroadcastPacket {
            packet: RelayPacket::Rejected {
                reason: "Room full".to_string(),
            },
            addrs: addrs.clone(),
        };

        match msg {
            OutboundMessage::BroadcastPacket { addrs: a, .. } => assert_eq!(a, addrs),
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = assert_ok!(RelayServer::new("127.0.0.1:0", 4, Duration::from_secs(5)).await);
        let addr = assert_ok!(server.local_addr());
        assert_ne!(addr.port(), 0);
    }
}
