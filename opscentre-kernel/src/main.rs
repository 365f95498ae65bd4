/**
 * OPSCENTRE KERNEL - service entry point
 *
 * Loads configuration (fatal on error), wires collector, alert engine,
 * publisher and history into the command centre, starts the cycle
 * scheduler, the optional MQTT side (push ingestion, critical alert
 * publishing, health beacon) and serves the HTTP API.
 */

use anyhow::{Context, Result};
use opscentre_kernel::alerts::{AlertSink, LogSink, MqttSink};
use opscentre_kernel::config::{load_config, SourceConf};
use opscentre_kernel::health::HealthTracker;
use opscentre_kernel::http::{build_router, AppState};
use opscentre_kernel::mqtt;
use opscentre_kernel::sources::PushInbox;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opscentre_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("Failed to load configuration")?;
    let addr: SocketAddr = cfg
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", cfg.listen))?;

    let health_tracker = HealthTracker::new();
    let inbox = Arc::new(PushInbox::new());
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("opscentre-kernel/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
    let mqtt_side = cfg.mqtt.as_ref().map(mqtt::connect);
    if let Some((client, _)) = &mqtt_side {
        sinks.push(Arc::new(MqttSink::new(client.clone())));
    }
    info!(sinks = ?sinks.iter().map(|s| s.name()).collect::<Vec<_>>(), "alert sinks configured");

    let centre = Arc::new(cfg.build_centre(&http_client, &inbox, sinks).context("Failed to build command centre")?);
    info!(
        hospitals = centre.hospital_count(),
        thresholds = centre.alerts().table().rules().len(),
        "command centre ready"
    );

    if let Some((client, eventloop)) = mqtt_side {
        let push_hospitals: HashSet<String> = cfg
            .hospitals
            .iter()
            .filter(|h| matches!(h.source, SourceConf::Push { .. }))
            .map(|h| h.id.clone())
            .collect();
        mqtt::spawn_mqtt_listener(client.clone(), eventloop, inbox.clone(), push_hospitals, health_tracker.clone());
        health_tracker.spawn_health_publisher(client, centre.clone(), Duration::from_secs(30));
    }

    let _scheduler = centre.spawn_scheduler();

    let app = build_router(AppState { centre: centre.clone(), health_tracker });
    let listener = TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);

    let publisher = centre.publisher().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested, closing streams");
            publisher.close_all();
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
