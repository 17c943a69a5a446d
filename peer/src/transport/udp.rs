//! Native UDP transport
//!
//! Offer and answer data carry the socket address the remote should talk to;
//! any extra advertised addresses travel as candidates. A link opens once a
//! hello or hello-ack arrives over the direct path. Pending hellos are
//! retransmitted from `poll_events` because UDP may lose them.

use super::{Transport, TransportEvent};
use crate::error::TransportError;
use bincode::{deserialize, serialize};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use shared::{PeerId, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HELLO_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize, Deserialize)]
enum Datagram {
    Hello { from: PeerId },
    HelloAck { from: PeerId },
    Data { from: PeerId, payload: Vec<u8> },
    Bye { from: PeerId },
}

#[derive(Debug, Default)]
struct Endpoint {
    remote_addrs: Vec<SocketAddr>,
    confirmed: Option<SocketAddr>,
    open: bool,
    last_hello: Option<Instant>,
}

pub struct UdpTransport {
    local: PeerId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    advertised: Vec<SocketAddr>,
    endpoints: HashMap<PeerId, Endpoint>,
    inbound_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    events: Vec<TransportEvent>,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Binds the socket and spawns the receive task on the current runtime
    ///
    /// `advertised` lists addresses remote peers should try; when empty the
    /// bound address is offered.
    pub async fn bind(
        local: PeerId,
        addr: &str,
        advertised: Vec<SocketAddr>,
    ) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let receiver = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buffer).await {
                        Ok((len, from)) => {
                            if inbound_tx.send((buffer[..len].to_vec(), from)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            })
        };

        debug!("UDP transport for {} bound to {}", local, local_addr);

        Ok(Self {
            local,
            socket,
            local_addr,
            advertised,
            endpoints: HashMap::new(),
            inbound_rx,
            events: Vec::new(),
            receiver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn offered_addr(&self) -> SocketAddr {
        self.advertised.first().copied().unwrap_or(self.local_addr)
    }

    fn emit_candidates(&mut self, peer: &PeerId) {
        for addr in self.advertised.iter().skip(1) {
            self.events
                .push(TransportEvent::LocalCandidate(peer.clone(), addr.to_string()));
        }
    }

    fn send_datagram(&self, datagram: &Datagram, to: SocketAddr) -> Result<(), TransportError> {
        let data = serialize(datagram)?;
        // The receiver would truncate anything larger
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::TooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.try_send_to(&data, to)?;
        Ok(())
    }

    fn add_remote(&mut self, peer: &PeerId, data: &str) -> Result<(), TransportError> {
        let addr: SocketAddr = data
            .parse()
            .map_err(|_| TransportError::BadSignal(data.to_string()))?;
        let endpoint = self
            .endpoints
            .get_mut(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        if !endpoint.remote_addrs.contains(&addr) {
            endpoint.remote_addrs.push(addr);
        }
        endpoint.last_hello = None;
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: Datagram, addr: SocketAddr) {
        match datagram {
            Datagram::Hello { from } => {
                let Some(endpoint) = self.endpoints.get_mut(&from) else {
                    debug!("Hello from {} before its offer arrived, ignoring", from);
                    return;
                };
                endpoint.confirmed = Some(addr);
                let opened = !mem::replace(&mut endpoint.open, true);
                let ack = Datagram::HelloAck {
                    from: self.local.clone(),
                };
                if let Err(e) = self.send_datagram(&ack, addr) {
                    warn!("Failed to acknowledge hello from {}: {}", from, e);
                }
                if opened {
                    self.events.push(TransportEvent::Opened(from));
                }
            }
            Datagram::HelloAck { from } => {
                if let Some(endpoint) = self.endpoints.get_mut(&from) {
                    endpoint.confirmed = Some(addr);
                    if !mem::replace(&mut endpoint.open, true) {
                        self.events.push(TransportEvent::Opened(from));
                    }
                }
            }
            Datagram::Data { from, payload } => match self.endpoints.get(&from) {
                Some(endpoint) if endpoint.open && endpoint.confirmed == Some(addr) => {
                    self.events.push(TransportEvent::Data(from, payload));
                }
                _ => debug!("Dropping data from {} at {}", from, addr),
            },
            Datagram::Bye { from } => {
                if let Some(endpoint) = self.endpoints.remove(&from) {
                    if endpoint.open {
                        self.events.push(TransportEvent::Closed(from));
                    }
                }
            }
        }
    }

    fn retransmit_hellos(&mut self, now: Instant) {
        let hello = Datagram::Hello {
            from: self.local.clone(),
        };
        let mut targets = Vec::new();
        for endpoint in self.endpoints.values_mut() {
            let due = endpoint
                .last_hello
                .map_or(true, |sent| now.duration_since(sent) >= HELLO_INTERVAL);
            if !endpoint.open && due && !endpoint.remote_addrs.is_empty() {
                endpoint.last_hello = Some(now);
                targets.extend(endpoint.remote_addrs.iter().copied());
            }
        }
        for addr in targets {
            if let Err(e) = self.send_datagram(&hello, addr) {
                debug!("Hello to {} failed: {}", addr, e);
            }
        }
    }
}

impl Transport for UdpTransport {
    fn create_offer(&mut self, peer: &PeerId) -> Result<String, TransportError> {
        self.endpoints.insert(peer.clone(), Endpoint::default());
        self.emit_candidates(peer);
        Ok(self.offered_addr().to_string())
    }

    fn accept_offer(&mut self, peer: &PeerId, offer: &str) -> Result<String, TransportError> {
        self.endpoints.insert(peer.clone(), Endpoint::default());
        if let Err(e) = self.add_remote(peer, offer) {
            self.endpoints.remove(peer);
            return Err(e);
        }
        self.emit_candidates(peer);
        Ok(self.offered_addr().to_string())
    }

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), TransportError> {
        self.add_remote(peer, answer)
    }

    fn add_candidate(&mut self, peer: &PeerId, candidate: &str) -> Result<(), TransportError> {
        self.add_remote(peer, candidate)
    }

    fn send(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let addr = match self.endpoints.get(peer) {
            Some(Endpoint {
                open: true,
                confirmed: Some(addr),
                ..
            }) => *addr,
            _ => return Err(TransportError::NotOpen(peer.clone())),
        };
        let datagram = Datagram::Data {
            from: self.local.clone(),
            payload: bytes.to_vec(),
        };
        self.send_datagram(&datagram, addr)
    }

    fn close(&mut self, peer: &PeerId) {
        if let Some(Endpoint {
            confirmed: Some(addr),
            ..
        }) = self.endpoints.remove(peer)
        {
            let bye = Datagram::Bye {
                from: self.local.clone(),
            };
            if let Err(e) = self.send_datagram(&bye, addr) {
                debug!("Goodbye to {} failed: {}", peer, e);
            }
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        while let Ok((bytes, addr)) = self.inbound_rx.try_recv() {
            match deserialize::<Datagram>(&bytes) {
                Ok(datagram) => self.handle_datagram(datagram, addr),
                Err(_) => warn!("Failed to deserialize datagram from {}", addr),
            }
        }
        self.retransmit_hellos(Instant::now());
        mem::take(&mut self.events)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    async fn pump(a: &mut UdpTransport, b: &mut UdpTransport) -> (Vec<TransportEvent>, Vec<TransportEvent>) {
        let mut a_events = Vec::new();
        let mut b_events = Vec::new();
        for _ in 0..20 {
            sleep(Duration::from_millis(10)).await;
            a_events.extend(a.poll_events());
            b_events.extend(b.poll_events());
        }
        (a_events, b_events)
    }

    #[tokio::test]
    async fn test_udp_handshake_and_data() {
        let mut a = UdpTransport::bind(PeerId::new("a"), "127.0.0.1:0", vec![])
            .await
            .unwrap();
        let mut b = UdpTransport::bind(PeerId::new("b"), "127.0.0.1:0", vec![])
            .await
            .unwrap();

        let offer = a.create_offer(&PeerId::new("b")).unwrap();
        assert_eq!(offer, a.local_addr().to_string());
        let answer = b.accept_offer(&PeerId::new("a"), &offer).unwrap();
        a.accept_answer(&PeerId::new("b"), &answer).unwrap();

        let (a_events, b_events) = pump(&mut a, &mut b).await;
        assert!(a_events.contains(&TransportEvent::Opened(PeerId::new("b"))));
        assert!(b_events.contains(&TransportEvent::Opened(PeerId::new("a"))));

        a.send(&PeerId::new("b"), b"ping").unwrap();
        let (_, b_events) = pump(&mut a, &mut b).await;
        assert!(b_events.contains(&TransportEvent::Data(PeerId::new("a"), b"ping".to_vec())));

        let oversized = vec![7u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            a.send(&PeerId::new("b"), &oversized),
            Err(TransportError::TooLarge { max: MAX_DATAGRAM_SIZE, .. })
        ));
        let (_, b_events) = pump(&mut a, &mut b).await;
        assert!(!b_events
            .iter()
            .any(|event| matches!(event, TransportEvent::Data(..))));

        a.close(&PeerId::new("b"));
        let (_, b_events) = pump(&mut a, &mut b).await;
        assert!(b_events.contains(&TransportEvent::Closed(PeerId::new("a"))));
    }

    #[tokio::test]
    async fn test_udp_rejects_bad_offer() {
        let mut b = UdpTransport::bind(PeerId::new("b"), "127.0.0.1:0", vec![])
            .await
            .unwrap();
        assert!(matches!(
            b.accept_offer(&PeerId::new("a"), "not an address"),
            Err(TransportError::BadSignal(_))
        ));
        assert!(matches!(
            b.send(&PeerId::new("a"), b"x"),
            Err(TransportError::NotOpen(_))
        ));
    }
}
