//! Swarm mesh simulator
//!
//! Runs a cluster of in-process engines over a lossy, reordering bus and
//! reports whether state and coordinator views converge.
//!
//! Usage: `swarm-sim [nodes] [loss] [seed] [seconds]`

use std::env;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use swarm_node::sim::{SimCluster, SimNetwork};
use swarm_node::SwarmConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STEP_MS: u64 = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarm=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line args
    let args: Vec<String> = env::args().collect();

    let node_count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5).max(1);
    let loss: f64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0.2);
    let seed: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(42);
    let seconds: u64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(60);

    println!("Swarm Mesh Simulator");
    println!("====================");
    println!();
    println!("Nodes: {node_count}  loss: {loss}  seed: {seed}  duration: {seconds}s");

    let network = SimNetwork::new(seed).with_loss(loss).with_duplication(0.05);
    let mut cluster = SimCluster::new(SwarmConfig::default(), network);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut ids: Vec<u32> = Vec::with_capacity(node_count);
    while ids.len() < node_count {
        let id: u32 = rng.gen();
        if !ids.contains(&id) {
            ids.push(id);
            cluster.add_node(id);
        }
    }
    println!("Expected coordinator: {}", ids.iter().min().copied().unwrap_or_default());
    println!();

    // Writes during the first half, then quiet time to converge.
    let steps = seconds * 1000 / STEP_MS;
    let mut writes = 0u64;
    for step in 0..steps {
        if step < steps / 2 && rng.gen_bool(0.3) {
            let id = ids[rng.gen_range(0..ids.len())];
            let key = format!("k{}", rng.gen_range(0..8));
            let value = format!("{}", rng.gen_range(0..100));
            if let Some(node) = cluster.node_mut(id) {
                if node.set_local(&key, &value) {
                    writes += 1;
                }
            }
        }
        cluster.step(STEP_MS);

        if (step + 1) % (10_000 / STEP_MS) == 0 {
            println!(
                "  t={:>4}s  converged={}  coordinators={:?}",
                (step + 1) * STEP_MS / 1000,
                cluster.converged(),
                cluster.coordinators()
            );
        }
    }

    println!();
    println!("Simulation complete:");
    println!("  Local writes: {writes}");
    println!("  Frames lost: {}", cluster.network().dropped());
    println!("  Converged: {}", cluster.converged());
    println!("  Coordinators: {:?}", cluster.coordinators());
    for node in cluster.nodes() {
        println!("  {}", node.status());
    }

    Ok(())
}
