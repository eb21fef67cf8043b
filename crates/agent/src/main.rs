//! `tether-agent` -- long-running connection pool daemon.
//!
//! Opens one persistent connection per configured endpoint, authenticates
//! them, joins the configured rooms and relays `room.message` traffic
//! between room members until interrupted.
//!
//! # Environment variables
//!
//! | Variable                    | Required | Default | Description                        |
//! |-----------------------------|----------|---------|------------------------------------|
//! | `TETHER_ENDPOINTS`          | yes      | --      | `name=url,...`                     |
//! | `TETHER_ROOMS`              | no       | --      | `connection:room,...`              |
//! | `TETHER_AUTH_TOKEN`         | no       | --      | Token for the auth handshake       |
//! | `TETHER_TOKEN_REFRESH_SECS` | no       | `0`     | Re-read the token on this schedule |
//!
//! Connection tuning (`TETHER_RECONNECT_INTERVAL_MS` and friends) is read
//! by `ConnectionOptions::from_env`.

use std::sync::Arc;

use anyhow::Context;
use tether_agent::config::AgentConfig;
use tether_agent::{relay, restore};
use tether_client::{AuthManager, ConnectionEvent, EventKind, Registry, RoomManager};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_agent=info,tether_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env().context("Invalid configuration")?;

    tracing::info!(
        endpoints = config.endpoints.len(),
        rooms = config.rooms.len(),
        auth = config.auth_token.is_some(),
        "Starting tether-agent",
    );

    let registry = Arc::new(Registry::new());
    let rooms = Arc::new(RoomManager::new(Arc::clone(&registry)));
    let auth = Arc::new(AuthManager::new(Arc::clone(&registry)));
    let router = Arc::new(relay::router(Arc::clone(&rooms)));

    registry.add_global_handler(EventKind::Message, router.event_handler(), false);
    registry.on(EventKind::Disconnect, |event, _| {
        if let ConnectionEvent::Disconnected {
            connection,
            code,
            reason,
            clean,
        } = event
        {
            tracing::warn!(connection = %connection, ?code, reason = %reason, clean, "Disconnected");
        }
    });
    registry.on(EventKind::ReconnectAttempt, |event, _| {
        if let ConnectionEvent::ReconnectAttempt {
            connection,
            attempt,
            max_attempts,
        } = event
        {
            tracing::info!(connection = %connection, attempt, max_attempts, "Reconnecting");
        }
    });

    // Registered before any connection exists so they cover the first open
    // and every reconnect, including connections that only come up later.
    restore::rejoin_rooms_on_connect(&registry, Arc::clone(&rooms), config.rooms.clone());
    if let Some(token) = &config.auth_token {
        restore::authenticate_on_connect(&registry, Arc::clone(&auth), token.clone());
    }

    for endpoint in &config.endpoints {
        registry.create(&endpoint.name, &endpoint.url, config.connection.clone())?;
    }

    let report = registry.connect_all().await;
    for (name, error) in &report.failed {
        tracing::warn!(connection = %name, error = %error, "Initial connect failed, retrying in background");
    }

    let refresher = config.token_refresh.map(|interval| {
        auth.start_token_refresh(interval, |_connection: String| async {
            std::env::var("TETHER_AUTH_TOKEN").context("TETHER_AUTH_TOKEN is not set")
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Some(refresher) = refresher {
        refresher.stop().await;
    }
    for name in auth.authenticated_connections() {
        auth.deauthenticate(&name);
    }
    registry.disconnect_all().await;

    tracing::info!("tether-agent stopped");
    Ok(())
}
