//! Hospital feed simulator
//!
//! Publishes the synthetic reference-network feed to the metrics topic so a
//! command centre with push sources can be exercised without real producers.
//!
//! Environment:
//! - `SIM_MQTT_HOST` / `SIM_MQTT_PORT` (default localhost:1883)
//! - `SIM_INTERVAL_SECS` seconds between rounds (default 10)
//! - `SIM_ROUNDS` stop after this many rounds (default: run forever)
//! - `SIM_HOSPITALS` comma-separated subset of reference hospital ids

use anyhow::{Context, Result};
use opscentre_devkit::{reference_hospitals, synthetic_payload, Scenario};
use opscentre_kernel::mqtt::METRICS_TOPIC;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct SimConfig {
    host: String,
    port: u16,
    interval: Duration,
    rounds: Option<u64>,
    only: Option<Vec<String>>,
}

impl SimConfig {
    fn from_env() -> Result<Self> {
        let host = std::env::var("SIM_MQTT_HOST").unwrap_or_else(|_| "localhost".into());
        let port = match std::env::var("SIM_MQTT_PORT") {
            Ok(v) => v.parse().with_context(|| format!("SIM_MQTT_PORT '{v}' is not a port"))?,
            Err(_) => 1883,
        };
        let secs: u64 = match std::env::var("SIM_INTERVAL_SECS") {
            Ok(v) => v.parse().with_context(|| format!("SIM_INTERVAL_SECS '{v}' is not a number"))?,
            Err(_) => 10,
        };
        let rounds = match std::env::var("SIM_ROUNDS") {
            Ok(v) => Some(v.parse().with_context(|| format!("SIM_ROUNDS '{v}' is not a number"))?),
            Err(_) => None,
        };
        let only = std::env::var("SIM_HOSPITALS").ok().map(|v| {
            v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
        });
        Ok(Self { host, port, interval: Duration::from_secs(secs.max(1)), rounds, only })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("opscentre_simulate=info")),
        )
        .init();

    let config = SimConfig::from_env()?;
    let hospitals: Vec<_> = reference_hospitals()
        .into_iter()
        .filter(|h| config.only.as_ref().map_or(true, |ids| ids.contains(&h.id)))
        .collect();
    if hospitals.is_empty() {
        anyhow::bail!("SIM_HOSPITALS matched no reference hospital");
    }
    info!(
        "Simulating {} hospitals against {}:{} every {:?}",
        hospitals.len(),
        config.host,
        config.port,
        config.interval
    );

    let mut opts = MqttOptions::new("opscentre-simulate", &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(opts, 32);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("MQTT connected"),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted after {} rounds", tick);
                break;
            }
        }

        for (idx, profile) in hospitals.iter().enumerate() {
            let scenario = Scenario::for_tick(tick, idx);
            let payload = synthetic_payload(profile, tick, scenario);
            let bytes = serde_json::to_vec(&payload).context("encode payload")?;
            match client.publish(METRICS_TOPIC, QoS::AtLeastOnce, false, bytes).await {
                Ok(()) => debug!("round {} {} -> {:?}", tick, profile.id, scenario),
                Err(e) => warn!("publish for {} failed: {}", profile.id, e),
            }
        }

        tick += 1;
        if config.rounds.is_some_and(|limit| tick >= limit) {
            info!("Published {} rounds, stopping", tick);
            break;
        }
    }

    client.disconnect().await.ok();
    Ok(())
}
