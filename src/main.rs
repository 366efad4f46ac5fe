//! Drama Link
//!
//! Connects to the game backend, logs in when credentials are given, prints
//! scene feed traffic and heartbeat statistics until interrupted.
//!
//! Credentials come from `DRAMA_LINK_USER` / `DRAMA_LINK_PASSWORD`; the rest
//! of the configuration from the `DRAMA_LINK_*` variables read by
//! [`ClientConfig::from_env`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use drama_link::{
    connection::{FeedHandler, HeartbeatEvent},
    Client, ClientConfig, ClientEvent, Command, CommandEvent, VERSION,
};

/// Scene feed room watched by the demo.
const DEMO_ROOM: i64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = ClientConfig::from_env();
    info!("Drama Link v{}", VERSION);
    info!("Endpoint: {}", config.endpoint);

    let (client, task) = Client::spawn(config).context("Failed to start client")?;
    let mut events = client.events();

    let feed: FeedHandler = Arc::new(|data: &Value| {
        info!("Scene feed: {}", data);
    });
    client.subscribe(feed)?;
    client.on(
        Command::GET_USER_POINTS,
        Arc::new(|event: &CommandEvent| info!("Points: {}", event.data)),
    )?;
    client.on_heartbeat_event(Arc::new(|event: &HeartbeatEvent| {
        if let HeartbeatEvent::Received { rtt, .. } = event {
            info!("Heartbeat rtt: {} ms", rtt.as_millis());
        }
    }))?;

    match (std::env::var("DRAMA_LINK_USER"), std::env::var("DRAMA_LINK_PASSWORD")) {
        (Ok(user), Ok(password)) => client.manual_login(&user, &password, None)?,
        _ => info!("No credentials given, relying on stored session"),
    }
    client.get_scene_feed(DEMO_ROOM, 0, 30, None)?;

    let mut report = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ClientEvent::LoggedIn { player_id }) => {
                    info!("Logged in as {:?}", player_id);
                    client.get_user_points()?;
                }
                Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                    warn!("Giving up after {} reconnect attempts", attempts);
                    break;
                }
                Ok(other) => info!("Event: {:?}", other),
                Err(e) => warn!("Event stream: {}", e),
            },
            _ = report.tick() => {
                let status = client.connection_status().await?;
                info!("Status: {}", serde_json::to_string(&status)?);
            }
        }
    }

    client.shutdown();
    task.await.context("Connection task failed")?;
    Ok(())
}
