use clap::Parser;
use log::info;
use relay::RelayServer;
use shared::MAX_PEERS;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Relay port to listen on
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Maximum members per room
    #[arg(short, long, default_value_t = MAX_PEERS)]
    max_members: usize,

    /// Seconds of silence before a member is evicted
    #[arg(short = 't', long, default_value = "5")]
    member_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting relay on {}", address);
    info!(
        "Max members per room: {}, member timeout: {}s",
        args.max_members, args.member_timeout
    );

    let mut server = RelayServer::new(
        &address,
        args.max_members.max(1),
        Duration::from_secs(args.member_timeout.max(1)),
    )
    .await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
