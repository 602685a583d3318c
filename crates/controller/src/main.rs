mod config;
mod control;
mod forecast;
mod guard;
mod notify;
mod persist;
mod sensor;
mod valve;
mod weather;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use control::{ControlLoop, LoopConfig};
use guard::ExecutionWindowGuard;
use notify::{NotificationChannel, NotificationRouter};
use persist::MarkerStore;
use valve::ValveSequencer;
use weather::OwmClient;

#[cfg(all(not(feature = "sim"), not(feature = "gpio")))]
compile_error!("enable at least one of the `sim` or `gpio` features");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        zones = cfg.zones.len(),
        "configuration loaded"
    );

    let loop_cfg = LoopConfig {
        tick_interval: Duration::from_secs(cfg.controller.tick_interval_sec),
        sample_count: cfg.controller.sample_count,
        sample_interval: Duration::from_millis(cfg.controller.sample_interval_ms),
        valve_on: Duration::from_secs(cfg.controller.valve_on_sec),
        soak: Duration::from_secs(cfg.controller.soak_sec),
        utc_offset: time::UtcOffset::from_hms(cfg.controller.utc_offset_hours, 0, 0)
            .context("utc_offset_hours is not a valid offset")?,
    };

    // ── Notification channels ───────────────────────────────────────
    let mut channels = Vec::new();
    if let Some(mqtt) = &cfg.mqtt {
        let client_id = "irrigation-controller";
        let mut mqttoptions = MqttOptions::new(client_id, &mqtt.host, mqtt.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // We only publish, but the eventloop must run to keep the
        // connection alive.
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to mqtt broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. retrying...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        channels.push(NotificationChannel::Mqtt {
            client,
            topic: mqtt.topic.clone(),
        });
    }
    if let Some(slack) = &cfg.slack {
        channels.push(NotificationChannel::Slack {
            http: reqwest::Client::new(),
            webhook_url: slack.webhook_url.clone(),
        });
    }
    if let Some(ubidots) = &cfg.ubidots {
        channels.push(NotificationChannel::Ubidots {
            http: reqwest::Client::new(),
            device_url: notify::ubidots_device_url(&ubidots.token, &ubidots.device),
        });
    }
    if channels.is_empty() {
        warn!("no notification channels configured, summaries go to the log only");
    }
    let router = NotificationRouter::new(channels);

    // ── Weather ─────────────────────────────────────────────────────
    let weather = cfg.weather.as_ref().map(|w| {
        OwmClient::new(
            w.api_key.clone(),
            cfg.location.latitude,
            cfg.location.longitude,
        )
    });
    if weather.is_none() {
        info!("no weather API key configured, demand stays at the per-zone baseline");
    }

    // ── Moisture probe ──────────────────────────────────────────────
    #[cfg(feature = "sim")]
    let probe = sensor::SimProbe::new(cfg.calibration.dry_raw, cfg.calibration.wet_raw);
    #[cfg(all(not(feature = "sim"), feature = "gpio"))]
    let probe = sensor::AdcProbe::new(0)?;

    // ── Valve board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high,
    // set RELAY_ACTIVE_LOW=0.
    let _active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let valve_count = cfg.zones.len() as u32;
    #[cfg(feature = "gpio")]
    let board = valve::GpioValveBoard::new(&cfg.gpio_pins(), _active_low)?;
    #[cfg(not(feature = "gpio"))]
    let board = valve::MockValveBoard::new(valve_count);

    // ── Durable markers ─────────────────────────────────────────────
    let state_dir = &cfg.persist.state_dir;
    let mut sequencer = ValveSequencer::new(
        board,
        valve_count,
        MarkerStore::new(state_dir.join("valve.json")),
    );
    sequencer.all_off();
    let guard = ExecutionWindowGuard::new(
        cfg.schedule.clone(),
        MarkerStore::new(state_dir.join("execution.json")),
    );

    // ── Control loop ────────────────────────────────────────────────
    let mut ctl = ControlLoop::new(
        loop_cfg,
        cfg.calibration.clone(),
        cfg.base_demands(),
        probe,
        sequencer,
        guard,
        weather,
        router,
    );

    // run() only returns on a fatal device fault, with all valves already
    // forced off. Exit non-zero so the supervisor restarts us; the durable
    // markers put the next run back where this one stopped.
    let fault = ctl.run().await;
    error!("restarting after fatal fault: {fault}");
    std::process::exit(1);
}
