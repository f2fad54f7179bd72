//! Cyphal Node -- Cyphal/UDP node with heartbeat and dynamic node IDs.
//!
//! Usage:
//!   cyphal-node                      # Run with default config
//!   cyphal-node --config path.toml   # Run with custom config
//!   cyphal-node decode <hex>         # Decode a captured envelope

use cyphal_node::allocator_task::{self, NodeInfo};
use cyphal_node::config::NodeConfig;
use cyphal_node::receive_task::{self, Receiver};
use cyphal_node::transmit_task::{self, Destination};
use cyphal_node::transport::Transport;
use cyphal_node::{expand_tilde, HeartbeatService, TxQueue};

use clap::{Parser, Subcommand};
use std::sync::Arc;

use cyphal_identity::{AllocationTable, NodeIdentity};
use cyphal_protocol::{
    decode_heartbeat, decode_node_info, Clock, Envelope, MonotonicClock, NodeId,
    HEARTBEAT_SUBJECT_ID, NODE_INFO_SUBJECT_ID,
};

#[derive(Parser)]
#[command(name = "cyphal-node", about = "Cyphal/UDP node: heartbeat and dynamic node-ID allocation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.cyphal/node.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective configuration as TOML
    Config,
    /// Decode a hex-encoded envelope
    Decode {
        /// Envelope bytes as hex
        hex: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print a sample heartbeat envelope as hex
    Heartbeat {
        /// Source node id (omit for anonymous)
        #[arg(long)]
        id: Option<u8>,
        #[arg(long, default_value_t = 0)]
        uptime: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cyphal_node=info,cyphal_identity=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Config) => {
            cfg.validate()?;
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Decode { hex, json }) => {
            decode_command(&hex, json)?;
        }
        Some(Commands::Heartbeat { id, uptime }) => {
            let mut envelope = Envelope::create_heartbeat(
                cfg.node.initial_health,
                cfg.node.initial_mode,
                uptime,
            )?;
            if let Some(raw) = id {
                envelope.source_node_id =
                    NodeId::new(raw).ok_or_else(|| anyhow::anyhow!("invalid node id {raw}"))?;
            }
            println!("{}", hex::encode(envelope.to_bytes()));
        }
    }

    Ok(())
}

fn decode_command(input: &str, json: bool) -> anyhow::Result<()> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact)?;
    let envelope = Envelope::deserialize(&bytes)?;

    let mut body = serde_json::json!({
        "subject_id": envelope.subject_id,
        "priority": envelope.priority,
        "source_node_id": envelope.source_node_id,
        "destination_node_id": envelope.destination_node_id,
        "is_service_request": envelope.is_service_request,
        "is_anonymous": envelope.is_anonymous,
        "payload": hex::encode(envelope.payload()),
        "valid": envelope.validate(),
    });
    let detail = match envelope.subject_id {
        HEARTBEAT_SUBJECT_ID => {
            let hb = decode_heartbeat(envelope.payload())?;
            Some(serde_json::json!({
                "uptime_sec": hb.uptime_sec,
                "health": hb.health,
                "mode": hb.mode,
            }))
        }
        NODE_INFO_SUBJECT_ID => {
            let info = decode_node_info(envelope.payload())?;
            Some(serde_json::json!({
                "name": info.name,
                "sw_version": info.sw_version,
                "hw_version": info.hw_version,
            }))
        }
        _ => None,
    };

    if json {
        if let Some(detail) = detail {
            body["decoded"] = detail;
        }
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("{envelope}");
        if let Some(detail) = detail {
            println!("{detail}");
        }
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    let lock_timeout = cfg.lock_timeout();

    tracing::info!(
        name = %cfg.node.name,
        version = env!("CARGO_PKG_VERSION"),
        preferred_id = cfg.node.preferred_id,
        "starting cyphal-node"
    );
    tracing::info!(
        base = %cfg.transport.multicast_base,
        port = cfg.transport.port,
        interface = %cfg.transport.interface,
        heartbeat_ms = cfg.heartbeat.interval_ms,
        "network config"
    );

    // Identity and allocation table
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let table = Arc::new(AllocationTable::with_lock_timeout(lock_timeout));
    let node = Arc::new(NodeIdentity::with_config(
        cfg.node.preferred_id,
        table,
        clock,
        cfg.allocator_config(),
    )?);
    node.set_health(cfg.node.initial_health)?;
    node.set_mode(cfg.node.initial_mode)?;

    let queue = TxQueue::with_lock_timeout(lock_timeout);
    let allocated_rx = allocator_task::announce_on_allocation(&node);

    let transport = Transport::open(&cfg.transport, &[HEARTBEAT_SUBJECT_ID, NODE_INFO_SUBJECT_ID])?;
    let Transport { tx, rx, local } = transport;

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Spawn transmitter
    let transmit_handle = {
        let queue = queue.clone();
        let destination = Destination {
            multicast_base: cfg.transport.multicast_base,
            port: cfg.transport.port,
        };
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            transmit_task::run_transmit_loop(queue, tx, destination, shutdown).await;
        })
    };

    // Spawn receiver
    let receive_handle = {
        let receiver = Receiver::new(node.clone(), Some(local));
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            receive_task::run_receive_loop(receiver, rx, shutdown).await;
        })
    };

    // Spawn node-info announcer
    let announce_handle = {
        let info = NodeInfo {
            name: cfg.node.name.clone(),
            sw_version: cfg.node.sw_version,
            hw_version: cfg.node.hw_version,
        };
        let queue = queue.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            allocator_task::run_announce_loop(info, queue, allocated_rx, shutdown).await;
        })
    };

    // Spawn allocator
    let allocator_handle = {
        let node = node.clone();
        let tick = std::time::Duration::from_millis(cfg.allocator.tick_ms);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            allocator_task::run_allocator_loop(node, tick, shutdown).await;
        })
    };

    // Heartbeat driver
    let heartbeat = HeartbeatService::new(node.clone(), Some(queue.clone()));
    heartbeat.set_interval(cfg.heartbeat.interval_ms)?;
    if cfg.heartbeat.enabled {
        heartbeat.start()?;
    } else {
        tracing::info!("heartbeat disabled by config");
    }

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    heartbeat.stop();
    let _ = shutdown_tx.send(());

    // Wait for all tasks
    let _ = tokio::join!(transmit_handle, receive_handle, announce_handle, allocator_handle);

    let queue_status = queue.status_string().await;
    tracing::info!(
        identity = %node,
        heartbeat = %heartbeat,
        queue = %queue_status,
        "shutdown complete"
    );
    Ok(())
}
