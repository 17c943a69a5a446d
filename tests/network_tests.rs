//! Network tests against a real relay on the loopback interface
//!
//! Each test starts its own relay on an ephemeral port.

use bincode::{deserialize, serialize};
use peer::relay_client::{Mailbox, MailboxItem, RoomService, UdpRelayClient};
use peer::transport::UdpTransport;
use peer::{SyncConfig, SyncError, SyncSession};
use relay::RelayServer;
use shared::{
    PeerId, RelayPacket, RoomId, SignalKind, SignalRecord, SpawnPayload, MAX_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Starts a relay in the background and returns its address
async fn start_relay(max_members: usize) -> SocketAddr {
    let mut server = RelayServer::new("127.0.0.1:0", max_members, Duration::from_secs(5))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

fn room() -> RoomId {
    RoomId::new("lobby")
}

fn record(from: &str, to: &str, data: &str) -> SignalRecord {
    SignalRecord {
        from: PeerId::new(from),
        to: PeerId::new(to),
        kind: SignalKind::Offer,
        data: data.to_string(),
        room: room(),
    }
}

async fn join(relay: SocketAddr, peer: &str) -> UdpRelayClient {
    UdpRelayClient::connect(&relay.to_string(), room(), PeerId::new(peer))
        .await
        .unwrap()
}

/// Fetches repeatedly until something arrives or the attempts run out
async fn fetch_until_some(client: &mut UdpRelayClient, peer: &str) -> Vec<MailboxItem> {
    for _ in 0..50 {
        let items = client.fetch(&room(), &PeerId::new(peer)).unwrap();
        if !items.is_empty() {
            return items;
        }
        sleep(Duration::from_millis(20)).await;
    }
    Vec::new()
}

mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn first_joiner_is_host() {
        let relay = start_relay(4).await;
        let mut a = join(relay, "a").await;
        let _b = join(relay, "b").await;
        sleep(Duration::from_millis(100)).await;

        assert!(a.membership_changed());
        let members = a.list_members(&room()).unwrap();
        assert_eq!(members.len(), 2);
        let host: Vec<_> = members.iter().filter(|m| m.is_host).collect();
        assert_eq!(host.len(), 1);
        assert_eq!(host[0].peer_id, PeerId::new("a"));
    }

    #[tokio::test]
    async fn records_reach_addressee_once() {
        let relay = start_relay(4).await;
        let mut a = join(relay, "a").await;
        let mut b = join(relay, "b").await;

        a.post(record("a", "b", "offer-data")).unwrap();
        sleep(Duration::from_millis(50)).await;

        let items = fetch_until_some(&mut b, "b").await;
        assert_eq!(items.len(), 1);
        let MailboxItem::Record { id, record } = &items[0] else {
            panic!("Wrong item type");
        };
        assert_eq!(record.data, "offer-data");
        assert_eq!(record.from, PeerId::new("a"));

        b.remove(&room(), &[*id]).unwrap();
        sleep(Duration::from_millis(50)).await;
        for _ in 0..5 {
            assert!(b.fetch(&room(), &PeerId::new("b")).unwrap().is_empty());
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn unknown_recipient_is_undeliverable() {
        let relay = start_relay(4).await;
        let mut a = join(relay, "a").await;

        a.post(record("a", "ghost", "offer-data")).unwrap();
        let items = fetch_until_some(&mut a, "a").await;
        assert!(items
            .iter()
            .any(|item| matches!(item, MailboxItem::Undeliverable { to } if to.as_str() == "ghost")));
    }

    #[tokio::test]
    async fn full_room_rejects_join() {
        let relay = start_relay(1).await;
        let _a = join(relay, "a").await;

        let result = UdpRelayClient::connect(&relay.to_string(), room(), PeerId::new("b")).await;
        assert!(matches!(result, Err(SyncError::SignalingUnavailable(_))));
    }

    #[tokio::test]
    async fn leave_updates_membership() {
        let relay = start_relay(4).await;
        let mut a = join(relay, "a").await;
        let mut b = join(relay, "b").await;
        sleep(Duration::from_millis(50)).await;
        a.membership_changed();

        b.leave();
        sleep(Duration::from_millis(100)).await;

        assert!(a.membership_changed());
        let members = a.list_members(&room()).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer_id, PeerId::new("a"));
    }

    #[tokio::test]
    async fn protocol_mismatch_is_rejected() {
        let relay = start_relay(4).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let join = RelayPacket::Join {
            room: room(),
            peer: PeerId::new("old"),
            version: 999,
        };
        socket
            .send_to(&serialize(&join).unwrap(), relay)
            .await
            .unwrap();

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("relay replied")
            .unwrap();
        match deserialize::<RelayPacket>(&buffer[..len]).unwrap() {
            RelayPacket::Rejected { reason } => assert!(reason.contains("version")),
            other => panic!("Wrong packet type: {:?}", other),
        }
    }
}

mod session_tests {
    use super::*;

    async fn udp_session(
        relay: SocketAddr,
        local: &str,
    ) -> SyncSession<UdpTransport, UdpRelayClient> {
        let peer = PeerId::new(local);
        let transport = UdpTransport::bind(peer.clone(), "127.0.0.1:0", vec![])
            .await
            .unwrap();
        let client = UdpRelayClient::connect(&relay.to_string(), room(), peer.clone())
            .await
            .unwrap();
        SyncSession::new(
            peer,
            room(),
            SyncConfig::default(),
            transport,
            client,
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn sessions_link_and_share_spawns_over_udp() {
        let relay = start_relay(4).await;
        let mut host = udp_session(relay, "host").await;
        let mut member = udp_session(relay, "m1").await;
        host.start(Instant::now());
        member.start(Instant::now());

        host.spawn_local(SpawnPayload::new("mouse_1", "MOUSE", 12.0, 34.0))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && member.entity("mouse_1").is_none() {
            sleep(Duration::from_millis(20)).await;
            let now = Instant::now();
            host.tick(now);
            member.tick(now);
        }

        assert!(host.is_host());
        assert_eq!(host.open_peers(), vec![PeerId::new("m1")]);
        let record = member.entity("mouse_1").expect("resync delivered the spawn");
        assert_eq!((record.x, record.y), (12.0, 34.0));

        member.relay_mut().leave();
        member.teardown();
        host.teardown();
    }
}
