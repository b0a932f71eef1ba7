//! node-keeper - Gossip Cluster Membership Daemon
//!
//! This is the composition root that wires together all the components.

use node_keeper::config::load_config;
use node_keeper::infrastructure::{shutdown_signal, ShutdownController};
use node_keeper::membership::{JoinStatus, MemberEvent, MemberEventGenerator, Membership};
use node_keeper::transport::TcpTransport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let membership_config = cfg.membership_config()?;
    let host = membership_config
        .host
        .clone()
        .ok_or_else(|| anyhow::anyhow!("host member is required"))?;

    tracing::info!(
        "starting node-keeper name={} listen={} seeds={}",
        host.node_name,
        host.address(),
        cfg.seeds.len()
    );

    // ===== COMPOSITION ROOT =====

    // 1. Transport
    let transport = Arc::new(TcpTransport::bind(host.address()).await?);

    // 2. Membership
    let (membership, status) = Membership::init(transport, membership_config).await?;
    match status {
        JoinStatus::SingleNode => tracing::info!("running as the first node of the cluster"),
        JoinStatus::Joined { seed, members } => {
            tracing::info!("joined through {} with {} members", seed, members)
        }
        JoinStatus::Incomplete { code } => {
            tracing::warn!("join incomplete ({:?}), waiting for gossip", code)
        }
    }

    // 3. Status bridge: turn membership notifications into member diffs
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    membership.subscribe(Arc::new(event_tx));
    let reporter = tokio::spawn(report_changes(membership.clone(), event_rx));

    // 4. Run until signalled
    shutdown_signal(ShutdownController::new("node")).await;

    membership.shutdown().await;
    reporter.abort();

    Ok(())
}

async fn report_changes(
    membership: Arc<Membership>,
    mut events: mpsc::UnboundedReceiver<node_keeper::MembershipEvent>,
) {
    let mut generator = MemberEventGenerator::new();
    generator.update(membership.get_members());

    while events.recv().await.is_some() {
        let changes = generator
            .update(membership.get_members())
            .into_iter()
            .chain(generator.update_actor_systems(membership.actor_systems()));

        for change in changes {
            match change {
                MemberEvent::MemberUp(m) => tracing::info!("node [{}] is up", m),
                MemberEvent::MemberDown(m) => tracing::info!("node [{}] is down", m),
                MemberEvent::ActorSystemUp(m) => tracing::info!("actor system on [{}] is up", m),
                MemberEvent::ActorSystemDown(m) => {
                    tracing::info!("actor system on [{}] is down", m)
                }
            }
        }
    }
}
