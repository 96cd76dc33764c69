//! GridLink node runner
//!
//! One binary, three roles: a CSMS serving stations over WebSocket, a
//! station dialing its CSMS, or a relay bridging segments of the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gridlink_core::{
    handler_fn, ws, ConnectOptions, HandlerFault, Node, NodeConfig, Payload, WireFormat,
};
use gridlink_station::{register_station_handlers, Station};

/// GridLink charging-network node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run a central system serving stations
    Csms {
        /// Node identifier
        #[arg(long, default_value = "csms")]
        id: String,

        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:9220")]
        listen: SocketAddr,
    },

    /// Run a charging station connected to a CSMS
    Station {
        /// Node identifier (e.g. CS001)
        #[arg(long)]
        id: String,

        /// WebSocket URL of the CSMS or relay to dial
        #[arg(short, long)]
        url: String,

        /// Node id of the dialed endpoint
        #[arg(long, default_value = "csms")]
        remote: String,

        /// Number of EVSEs the station exposes
        #[arg(long, default_value = "2")]
        evses: u32,

        /// Use the binary wire format instead of JSON
        #[arg(long)]
        binary: bool,

        /// Heartbeat period in seconds (0 disables)
        #[arg(long, default_value = "300")]
        heartbeat: u64,
    },

    /// Run a relay bridging stations to an upstream node
    Relay {
        /// Node identifier
        #[arg(long, default_value = "relay")]
        id: String,

        /// Address to listen on for downstream peers
        #[arg(short, long, default_value = "0.0.0.0:9221")]
        listen: SocketAddr,

        /// Optional upstream WebSocket URL to dial
        #[arg(short, long)]
        url: Option<String>,

        /// Node id of the upstream endpoint
        #[arg(long, default_value = "csms")]
        remote: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.role {
        Role::Csms { id, listen } => run_csms(id, listen).await,
        Role::Station {
            id,
            url,
            remote,
            evses,
            binary,
            heartbeat,
        } => run_station(id, url, remote, evses, binary, heartbeat).await,
        Role::Relay {
            id,
            listen,
            url,
            remote,
        } => run_relay(id, listen, url, remote).await,
    }
}

async fn run_csms(id: String, listen: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::new(NodeConfig::new(id.clone()));
    info!("CSMS \"{}\" starting", id);

    node.dispatch().register(
        "BootNotification",
        handler_fn(|ctx, payload| async move {
            info!(station = %ctx.source, "boot notification received");
            let _doc: serde_json::Value = payload.parse()?;
            Payload::json(serde_json::json!({
                "status": "Accepted",
                "currentTime": chrono::Utc::now(),
                "interval": 300,
            }))
            .map_err(HandlerFault::from)
        }),
    );
    node.dispatch().register(
        "Heartbeat",
        handler_fn(|_ctx, _payload| async move {
            Payload::json(serde_json::json!({ "currentTime": chrono::Utc::now() }))
                .map_err(HandlerFault::from)
        }),
    );

    ws::serve(node, listen).await?;
    Ok(())
}

async fn run_station(
    id: String,
    url: String,
    remote: String,
    evses: u32,
    binary: bool,
    heartbeat: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = if binary {
        WireFormat::Binary
    } else {
        WireFormat::Json
    };
    let node = Node::new(NodeConfig::new(id.clone()).with_wire_format(format));
    let station = Arc::new(Station::new(evses));
    register_station_handlers(&node, station);
    info!("Station \"{}\" starting with {} EVSEs", id, evses);

    if heartbeat > 0 {
        let node = node.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let outcome = node.call(&remote, "Heartbeat", Payload::default()).await;
                if !outcome.is_ok() {
                    warn!(code = ?outcome.code, "heartbeat failed");
                }
            }
        });
    }

    ws::run_client(node, ConnectOptions::new(url, remote)).await;
    Ok(())
}

async fn run_relay(
    id: String,
    listen: SocketAddr,
    url: Option<String>,
    remote: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::new(NodeConfig::new(id.clone()));
    info!("Relay \"{}\" starting", id);

    if let Some(url) = url {
        let node = node.clone();
        tokio::spawn(ws::run_client(node, ConnectOptions::new(url, remote)));
    }

    ws::serve(node, listen).await?;
    Ok(())
}
