use clap::Parser;
use log::{info, warn};
use peer::relay_client::UdpRelayClient;
use peer::transport::UdpTransport;
use peer::{SessionEvent, SyncConfig, SyncSession};
use rand::Rng;
use shared::{FieldValue, MovePayload, PeerId, RoomId, SpawnPayload};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::interval;

const WORLD_SIZE: f32 = 800.0;
const AMBIENT_MICE: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay address
    #[arg(short = 'r', long, default_value = "127.0.0.1:9000")]
    relay: String,

    /// Room to join
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Peer id, random when omitted
    #[arg(short = 'p', long)]
    peer_id: Option<String>,

    /// Local address for direct links
    #[arg(short = 'b', long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Address other peers should use, if different from the bound one
    #[arg(short = 'a', long)]
    advertise: Vec<SocketAddr>,

    /// Simulation ticks per second
    #[arg(short = 't', long, default_value = "60")]
    tick_rate: u64,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "10")]
    handshake_timeout: u64,
}

/// A point wandering around the world
struct Wanderer {
    id: String,
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
}

impl Wanderer {
    fn new(id: String, rng: &mut impl Rng) -> Self {
        Self {
            id,
            x: rng.gen_range(0.0..WORLD_SIZE),
            y: rng.gen_range(0.0..WORLD_SIZE),
            vx: 0.0,
            vy: 0.0,
        }
    }

    fn step(&mut self, dt: f32, rng: &mut impl Rng) -> MovePayload {
        self.vx = (self.vx + rng.gen_range(-20.0..20.0)).clamp(-120.0, 120.0);
        self.vy = (self.vy + rng.gen_range(-20.0..20.0)).clamp(-120.0, 120.0);
        self.x = (self.x + self.vx * dt).clamp(0.0, WORLD_SIZE);
        self.y = (self.y + self.vy * dt).clamp(0.0, WORLD_SIZE);

        let mut update = MovePayload::new(self.id.clone(), self.x, self.y);
        update.angle = self.vy.atan2(self.vx);
        update.vx = self.vx;
        update.vy = self.vy;
        update
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mut rng = rand::thread_rng();

    let peer_id = PeerId::new(
        args.peer_id
            .clone()
            .unwrap_or_else(|| format!("peer_{:04}", rng.gen_range(0..10_000))),
    );
    let room = RoomId::new(args.room.clone());

    info!("Starting peer {} in room {}", peer_id, room);
    info!("Relay: {}", args.relay);

    let transport = UdpTransport::bind(peer_id.clone(), &args.bind, args.advertise.clone()).await?;
    info!("Direct links on {}", transport.local_addr());
    let relay = UdpRelayClient::connect(&args.relay, room.clone(), peer_id.clone()).await?;

    let config = SyncConfig {
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        ..SyncConfig::default()
    };

    let start = Instant::now();
    let mut session = SyncSession::new(peer_id.clone(), room, config, transport, relay, start);
    session.start(start);

    let mut avatar = Wanderer::new(format!("cat_{}", peer_id), &mut rng);
    session.spawn_local(
        SpawnPayload::new(avatar.id.clone(), "CAT", avatar.x, avatar.y)
            .with_field("is_player", FieldValue::Bool(true)),
    )?;

    let mut mice = Vec::new();
    if session.is_host() {
        for i in 0..AMBIENT_MICE {
            let mouse = Wanderer::new(format!("mouse_{}", i), &mut rng);
            session.spawn_local(SpawnPayload::new(mouse.id.clone(), "MOUSE", mouse.x, mouse.y))?;
            mice.push(mouse);
        }
        info!("Hosting room with {} ambient mice", mice.len());
    }

    let tick_rate = args.tick_rate.max(1);
    let dt = 1.0 / tick_rate as f32;
    let mut ticker = interval(Duration::from_secs_f32(dt));
    let mut heartbeat = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                session.announce_move(avatar.step(dt, &mut rng), now)?;
                for mouse in &mut mice {
                    session.announce_move(mouse.step(dt, &mut rng), now)?;
                }
                session.tick(now);

                for event in session.drain_events() {
                    match event {
                        SessionEvent::PeerConnected(peer) => info!("Connected to {}", peer),
                        SessionEvent::PeerDisconnected(peer) => info!("{} disconnected", peer),
                        SessionEvent::PeerFailed { peer, error } => warn!("Gave up on {}: {}", peer, error),
                        SessionEvent::HostLost(host) => warn!("Host {} left, playing alone", host),
                        SessionEvent::Degraded(true) => warn!("Signaling degraded"),
                        SessionEvent::Degraded(false) => info!("Signaling recovered"),
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = session.relay_mut().heartbeat() {
                    warn!("Relay heartbeat failed: {}", e);
                }
                info!(
                    "{} entities, links: {:?}",
                    session.entity_count(),
                    session.open_peers()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    session.relay_mut().leave();
    session.teardown();
    Ok(())
}
