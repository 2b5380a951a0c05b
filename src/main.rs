// # fabric-router
//
// Bring-up binary for a single router process. Loads its configuration,
// starts channel listeners and the background timer, optionally stacks
// the session layer, cluster membership, and the queue engine on top, and
// blocks until a shutdown signal arrives.

use router_fabric::cluster::ClusterMember;
use router_fabric::config::Config;
use router_fabric::queue::{MsgQueueEngine, QueueBackend};
use router_fabric::router::{Router, RouterHandle, RouterRole};
use router_fabric::session::SessionManager;
use router_fabric::VERSION;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> router_fabric::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file = install_dir.join("fabric.toml");

    let mut config = match std::fs::read_to_string(&config_file) {
        Ok(raw) => Config::from_toml_str(&raw)?,
        Err(_) => {
            let defaults = Config::default();
            info!(path = %config_file.display(), "no config file found, writing defaults");
            if let Err(e) = std::fs::write(&config_file, defaults.to_toml_string()) {
                warn!(error = %e, path = %config_file.display(), "could not write default config file");
            }
            defaults
        }
    };
    config.apply_env_overrides();

    let role = infer_role(&config);
    print_startup_info(&config_file.display().to_string(), &config, role);

    info!(version = VERSION, router_ep = %config.router_ep, "starting router");

    let router = Router::new(config.clone(), role)?;
    router.start().await?;

    let _sessions = SessionManager::new(router.clone(), config.session_cache_time);

    let _cluster = if config.cluster_base_ep.is_some() {
        info!("cluster membership enabled");
        Some(ClusterMember::new(router.clone(), &config)?)
    } else {
        None
    };

    let _queues = if !config.queue_map.is_empty() {
        info!(queues = config.queue_map.len(), "message queue engine enabled");
        let backend = QueueBackend::File(install_dir.join("queues"));
        Some(MsgQueueEngine::new(router.clone(), &config, backend).await?)
    } else {
        None
    };

    println!();
    println!("router-fabric is up — {}", config.router_ep);
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler, running until killed");
        std::future::pending::<()>().await;
    }

    info!("shutdown requested, draining");
    if let Err(e) = router.stop(Duration::from_secs(5)).await {
        error!(error = %e, "router did not shut down cleanly");
    }
    info!("shutdown complete");

    Ok(())
}

/// A leaf has a parent, a root does not and carries no uplink targets of
/// its own; anything in between with neither a cloud endpoint nor any
/// uplink configuration but also no parent is treated as a root, matching
/// how `RouterEP` segment depth implies role in §4.5.
fn infer_role(config: &Config) -> RouterRole {
    if config.parent_ep.is_some() {
        RouterRole::Leaf
    } else if !config.downlink_ep.is_empty() {
        RouterRole::Hub
    } else {
        RouterRole::Root
    }
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║            router-fabric — messaging fabric router           ║");
    println!("║                         v{:<10}                         ║", VERSION);
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_startup_info(config_file: &str, config: &Config, role: RouterRole) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ STARTUP CONFIGURATION                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Config file:       {:<42} │", config_file);
    println!("│ Role:              {:<42} │", format!("{:?}", role));
    println!("│ Router EP:         {:<42} │", config.router_ep);
    println!("│ Parent EP:         {:<42} │", config.parent_ep.as_deref().unwrap_or("-"));
    println!("│ Discovery mode:    {:<42} │", format!("{:?}", config.discovery_mode));
    println!("│ TCP EP:            {:<42} │", config.tcp_ep.as_deref().unwrap_or("-"));
    println!("│ UDP EP:            {:<42} │", config.udp_ep.as_deref().unwrap_or("-"));
    println!("│ P2P enabled:       {:<42} │", config.enable_p2p);
    println!("│ Cluster base EP:   {:<42} │", config.cluster_base_ep.as_deref().unwrap_or("-"));
    println!("│ Queue map entries: {:<42} │", config.queue_map.len());
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}
