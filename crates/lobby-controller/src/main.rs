//! Lobby Controller demo host
//!
//! Runs two local users against the in-process loopback backend and walks
//! through a full session, then prints the collected Prometheus metrics.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the stale-session ledger selected by `LOBBY_LEDGER`
//! 4. Spawn one `SessionController` per local user
//! 5. Attach loopback backends and run the scenario
//! 6. Shut both controllers down

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::sync::Arc;

use lobby_controller::config::Config;
use lobby_controller::ledger;
use lobby_controller::models::{CreateLobbyRequest, JoinLobbyRequest, Member};
use lobby_controller::observability::init_metrics_recorder;
use lobby_controller::provider::{LoopbackHub, LoopbackProvider};
use lobby_controller::{LobbyError, SessionControllerBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lobby_controller=debug,lobby=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lobby Controller demo");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        heartbeat_interval = ?config.heartbeat_interval,
        heartbeat_timeout = ?config.heartbeat_timeout,
        heartbeat_grace = ?config.heartbeat_grace,
        ledger = ?config.ledger,
        pre_attach = ?config.pre_attach,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let ledger = ledger::from_config(&config.ledger).await.map_err(|e| {
        error!(error = %e, "Failed to initialize stale-session ledger");
        e
    })?;

    let hub = LoopbackHub::new();
    let host = Member::new("host", "Host");
    let guest = Member::new("guest", "Guest");

    let (host_handle, host_task) = SessionControllerBuilder::new(config.clone())
        .ledger(Arc::clone(&ledger))
        .spawn();
    let (guest_handle, guest_task) = SessionControllerBuilder::new(config)
        .ledger(ledger)
        .spawn();

    host_handle
        .attach_provider(Arc::new(LoopbackProvider::new(hub.clone(), host.clone())))
        .await?;
    // Ledger entries are keyed by backend type; both users share one ledger
    guest_handle
        .attach_provider(Arc::new(
            LoopbackProvider::new(hub.clone(), guest.clone()).with_backend_type("loopback-guest"),
        ))
        .await?;

    let entered = match host_handle
        .create(CreateLobbyRequest::new(4).with_lobby_data("mode", "demo"))
        .await?
    {
        Ok(entered) => entered,
        Err(reason) => {
            error!(reason = reason.as_str(), "Host failed to create lobby");
            return Err(LobbyError::Internal(format!("create failed: {reason}")).into());
        }
    };
    info!(lobby_id = %entered.lobby_id, "Host created lobby");

    match guest_handle
        .join(JoinLobbyRequest::new(entered.lobby_id.clone()))
        .await?
    {
        Ok(joined) => info!(
            lobby_id = %joined.lobby_id,
            members = joined.members.len(),
            "Guest joined lobby"
        ),
        Err(reason) => warn!(reason = reason.as_str(), "Guest failed to join lobby"),
    }

    // Let the host observe the join before acting on it
    let mut host_updates = host_handle.subscribe();
    let _ = host_updates
        .wait_for(|snapshot| snapshot.members.contains(&guest))
        .await;

    info!(
        mode = %host_handle.lobby_data_or_default("mode", "unknown"),
        members = host_handle.session().members.len(),
        "Host view before kick"
    );

    let kicked = host_handle.kick_member(guest.clone()).await?;
    info!(kicked, guest_state = %guest_handle.state(), "Guest kicked");

    host_handle.leave().await?;
    info!(
        host_state = %host_handle.state(),
        lobbies = hub.lobby_count(),
        "Host left lobby"
    );

    host_handle.shutdown().await?;
    guest_handle.shutdown().await?;
    let _ = tokio::join!(host_task, guest_task);

    info!("Lobby Controller demo finished");
    println!("{}", prometheus_handle.render());

    Ok(())
}
