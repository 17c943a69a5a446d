//! Client side of the reference relay server

use super::{Mailbox, MailboxItem, RoomService};
use crate::error::SyncError;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Member, PeerId, RelayPacket, RoomId, SignalRecord, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::collections::BTreeSet;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Delivered record ids remembered to filter replies to overlapping fetches
const SEEN_CAPACITY: usize = 1024;

/// Mailbox and room service backed by the `relay` binary over UDP
///
/// Replies arrive asynchronously: `fetch` returns what the relay delivered
/// since the previous call and asks for the next round.
pub struct UdpRelayClient {
    room: RoomId,
    peer: PeerId,
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<RelayPacket>,
    members: Vec<Member>,
    members_dirty: bool,
    items: Vec<MailboxItem>,
    seen: BTreeSet<u64>,
    receiver: JoinHandle<()>,
}

impl UdpRelayClient {
    /// Joins `room` as `peer` and waits for the first membership listing
    pub async fn connect(relay_addr: &str, room: RoomId, peer: PeerId) -> Result<Self, SyncError> {
        let relay_addr: SocketAddr = relay_addr
            .parse()
            .map_err(|e| SyncError::SignalingUnavailable(format!("bad relay address: {}", e)))?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| SyncError::SignalingUnavailable(e.to_string()))?;
        let socket = Arc::new(socket);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let receiver = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buffer).await {
                        Ok((len, from)) if from == relay_addr => {
                            match deserialize::<RelayPacket>(&buffer[..len]) {
                                Ok(packet) => {
                                    if inbound_tx.send(packet).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => warn!("Failed to deserialize relay packet"),
                            }
                        }
                        Ok((_, from)) => debug!("Ignoring datagram from {}", from),
                        Err(e) => {
                            error!("Error receiving from relay: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            })
        };

        let mut client = Self {
            room: room.clone(),
            peer: peer.clone(),
            socket,
            relay_addr,
            inbound_rx,
            members: Vec::new(),
            members_dirty: false,
            items: Vec::new(),
            seen: BTreeSet::new(),
            receiver,
        };

        client.send(&RelayPacket::Join {
            room,
            peer,
            version: PROTOCOL_VERSION,
        })?;

        let joined = timeout(JOIN_TIMEOUT, async {
            while let Some(packet) = client.inbound_rx.recv().await {
                match packet {
                    RelayPacket::Members { members, .. } => return Ok(members),
                    RelayPacket::Rejected { reason } => {
                        return Err(SyncError::SignalingUnavailable(reason))
                    }
                    other => debug!("Unexpected packet while joining: {:?}", other),
                }
            }
            Err(SyncError::SignalingUnavailable("relay receiver stopped".to_string()))
        })
        .await
        .map_err(|_| SyncError::SignalingUnavailable("join timed out".to_string()))??;

        info!(
            "Joined room {} as {} ({} member(s))",
            client.room,
            client.peer,
            joined.len()
        );
        client.members = joined;
        client.members_dirty = true;
        Ok(client)
    }

    pub fn heartbeat(&mut self) -> Result<(), SyncError> {
        self.send(&RelayPacket::Heartbeat {
            room: self.room.clone(),
            peer: self.peer.clone(),
        })
    }

    pub fn leave(&mut self) {
        let packet = RelayPacket::Leave {
            room: self.room.clone(),
            peer: self.peer.clone(),
        };
        if let Err(e) = self.send(&packet) {
            warn!("Failed to leave room {}: {}", self.room, e);
        }
    }

    fn send(&self, packet: &RelayPacket) -> Result<(), SyncError> {
        let data = serialize(packet).map_err(|e| SyncError::SignalingUnavailable(e.to_string()))?;
        self.socket
            .try_send_to(&data, self.relay_addr)
            .map_err(|e| SyncError::SignalingUnavailable(e.to_string()))?;
        Ok(())
    }

    fn drain(&mut self) {
        while let Ok(packet) = self.inbound_rx.try_recv() {
            match packet {
                RelayPacket::Members { room, members } if room == self.room => {
                    self.members = members;
                    self.members_dirty = true;
                }
                RelayPacket::Records { room, records } if room == self.room => {
                    for (id, record) in records {
                        // A fetch sent before the previous ack landed repeats records
                        if self.seen.insert(id) {
                            self.items.push(MailboxItem::Record { id, record });
                        }
                    }
                    while self.seen.len() > SEEN_CAPACITY {
                        self.seen.pop_first();
                    }
                }
                RelayPacket::Undeliverable { room, to } if room == self.room => {
                    self.items.push(MailboxItem::Undeliverable { to });
                }
                RelayPacket::Rejected { reason } => warn!("Relay rejected request: {}", reason),
                other => debug!("Ignoring relay packet {:?}", other),
            }
        }
    }
}

impl Mailbox for UdpRelayClient {
    fn post(&mut self, record: SignalRecord) -> Result<(), SyncError> {
        self.send(&RelayPacket::Post { record })
    }

    fn fetch(&mut self, room: &RoomId, to: &PeerId) -> Result<Vec<MailboxItem>, SyncError> {
        self.drain();
        self.send(&RelayPacket::Fetch {
            room: room.clone(),
            peer: to.clone(),
        })?;
        Ok(mem::take(&mut self.items))
    }

    fn remove(&mut self, room: &RoomId, ids: &[u64]) -> Result<(), SyncError> {
        self.send(&RelayPacket::Ack {
            room: room.clone(),
            ids: ids.to_vec(),
        })
    }
}

impl RoomService for UdpRelayClient {
    fn list_members(&mut self, _room: &RoomId) -> Result<Vec<Member>, SyncError> {
        self.drain();
        Ok(self.members.clone())
    }

    fn membership_changed(&mut self) -> bool {
        self.drain();
        mem::take(&mut self.members_dirty)
    }
}

impl Drop for UdpRelayClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}
