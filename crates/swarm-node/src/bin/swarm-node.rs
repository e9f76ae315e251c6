//! Swarm Node binary
//!
//! Runs one mesh node over UDP broadcast. Arguments of the form `key=value`
//! are written to the shared state once the node is up.

use rand::Rng;
use swarm_node::{Deferred, StateChange, SwarmConfig, SwarmService, UdpLink, WILDCARD};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SwarmConfig::from_env()?;
    let id = config
        .node_id
        .unwrap_or_else(|| rand::thread_rng().gen());

    info!(id, "Starting Swarm node");

    let writes: Vec<(String, String)> = std::env::args()
        .skip(1)
        .filter_map(|arg| match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
            _ => {
                warn!(%arg, "Ignoring argument, expected key=value");
                None
            }
        })
        .collect();

    let (mut service, handle, link) = SwarmService::new(&config, id);
    service.on_local_change(|status, keys| {
        info!(keys = ?keys, peers = status.peer_count, "Published local change");
    });

    let udp = UdpLink::bind(&config, id).await?;
    let (recv_task, send_task) = udp.spawn(link, handle.clone());
    let service_task = tokio::spawn(service.run());

    handle
        .subscribe(WILDCARD, |change: &StateChange<'_>, _: &mut Deferred| {
            info!(
                key = change.key,
                value = change.value,
                old = change.old_value,
                version = change.version,
                origin = change.origin,
                "State changed"
            );
        })
        .await?;

    if !writes.is_empty() {
        let changed = handle.set_local_batch(writes).await?;
        info!(changed = ?changed, "Applied startup writes");
    }
    handle.request_full_sync().await?;

    tokio::signal::ctrl_c().await?;
    let status = handle.status().await?;
    info!(%status, "Shutting down");

    handle.shutdown().await?;
    service_task.await?;
    recv_task.abort();
    send_task.abort();

    Ok(())
}
