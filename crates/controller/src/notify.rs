//! Best-effort notification fan-out. Each tick summary is broadcast to
//! every configured channel; a failing channel is logged and skipped so it
//! can never block the others or fail the tick.

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry inside the HTTP channel before reporting failure upward.
const SEND_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub enum NotificationChannel {
    Mqtt { client: AsyncClient, topic: String },
    Slack { http: reqwest::Client, webhook_url: String },
    /// Telemetry-only channel: carries moisture readings, not text
    /// summaries.
    Ubidots { http: reqwest::Client, device_url: String },
}

/// Ubidots "update device" endpoint for a device label and account token.
pub fn ubidots_device_url(token: &str, device: &str) -> String {
    format!("https://things.ubidots.com/api/v1.6/devices/{device}?token={token}")
}

/// POST a JSON payload, retried a few times before reporting failure
/// upward — delivery stays best-effort either way.
async fn post_json_with_retry(
    http: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let mut last_status = None;
    for attempt in 1..=SEND_ATTEMPTS {
        match http.post(url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_status = Some(resp.status().to_string()),
            Err(e) => last_status = Some(e.to_string()),
        }
        debug!(attempt, "webhook attempt failed");
        if attempt < SEND_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    bail!(
        "webhook failed after {SEND_ATTEMPTS} attempts: {}",
        last_status.unwrap_or_else(|| "no response".into())
    );
}

impl NotificationChannel {
    pub fn name(&self) -> &'static str {
        match self {
            NotificationChannel::Mqtt { .. } => "mqtt",
            NotificationChannel::Slack { .. } => "slack",
            NotificationChannel::Ubidots { .. } => "ubidots",
        }
    }

    async fn send(&self, message: &str) -> Result<()> {
        match self {
            NotificationChannel::Mqtt { client, topic } => {
                client
                    .publish(topic, QoS::AtLeastOnce, false, message.as_bytes().to_vec())
                    .await
                    .context("mqtt publish failed")?;
                Ok(())
            }
            NotificationChannel::Slack { http, webhook_url } => {
                post_json_with_retry(http, webhook_url, &json!({ "text": message }))
                    .await
                    .context("slack delivery failed")
            }
            // Text summaries don't go to the telemetry store.
            NotificationChannel::Ubidots { .. } => Ok(()),
        }
    }

    async fn send_moisture(&self, pct: f64) -> Result<()> {
        match self {
            NotificationChannel::Ubidots { http, device_url } => {
                post_json_with_retry(http, device_url, &json!({ "soil_moisture": pct }))
                    .await
                    .context("ubidots delivery failed")
            }
            _ => Ok(()),
        }
    }
}

pub struct NotificationRouter {
    channels: Vec<NotificationChannel>,
}

impl NotificationRouter {
    pub fn new(channels: Vec<NotificationChannel>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fan a message out to every channel. Failures are isolated per
    /// channel and never propagate to the caller.
    pub async fn broadcast(&self, message: &str) {
        for channel in &self.channels {
            if let Err(e) = channel.send(message).await {
                warn!(channel = channel.name(), "notification failed: {e:#}");
            }
        }
    }

    /// Post the calibrated moisture reading to every telemetry channel.
    /// Same isolation rules as `broadcast`.
    pub async fn publish_moisture(&self, pct: f64) {
        for channel in &self.channels {
            if let Err(e) = channel.send_moisture(pct).await {
                warn!(channel = channel.name(), "telemetry failed: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal MQTT AsyncClient. We never poll its event loop, so publishes
    /// accumulate in the internal buffer — sufficient for verifying that
    /// broadcast survives channel construction and send attempts.
    ///
    /// The event loop must stay alive so the internal channel remains open.
    fn test_mqtt() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-notify", "127.0.0.1", 1883);
        AsyncClient::new(opts, 10)
    }

    #[tokio::test]
    async fn broadcast_with_no_channels_is_a_no_op() {
        let router = NotificationRouter::new(vec![]);
        router.broadcast("nothing to see").await;
        assert_eq!(router.channel_count(), 0);
    }

    #[tokio::test]
    async fn mqtt_channel_buffers_publish() {
        let (client, _el) = test_mqtt();
        let router = NotificationRouter::new(vec![NotificationChannel::Mqtt {
            client,
            topic: "garden/watering".into(),
        }]);
        // Publish lands in the unpolled client buffer without error.
        router.broadcast("moisture 42.0%").await;
    }

    #[tokio::test]
    async fn failing_channel_does_not_poison_broadcast() {
        // A dropped event loop closes the MQTT request channel, making the
        // publish fail. Broadcast must swallow it.
        let (client, el) = test_mqtt();
        drop(el);
        let router = NotificationRouter::new(vec![NotificationChannel::Mqtt {
            client,
            topic: "garden/watering".into(),
        }]);
        router.broadcast("still fine").await;
    }

    #[test]
    fn channel_names_are_stable() {
        let (client, _el) = test_mqtt();
        let mqtt = NotificationChannel::Mqtt {
            client,
            topic: "t".into(),
        };
        let slack = NotificationChannel::Slack {
            http: reqwest::Client::new(),
            webhook_url: "https://hooks.slack.invalid/services/x".into(),
        };
        let ubidots = NotificationChannel::Ubidots {
            http: reqwest::Client::new(),
            device_url: ubidots_device_url("t", "d"),
        };
        assert_eq!(mqtt.name(), "mqtt");
        assert_eq!(slack.name(), "slack");
        assert_eq!(ubidots.name(), "ubidots");
    }

    #[test]
    fn ubidots_url_embeds_device_and_token() {
        assert_eq!(
            ubidots_device_url("tok-123", "garden"),
            "https://things.ubidots.com/api/v1.6/devices/garden?token=tok-123"
        );
    }

    #[tokio::test]
    async fn text_broadcast_skips_telemetry_channels() {
        // No request is made: an unreachable Ubidots device must not slow
        // down or fail a text broadcast.
        let router = NotificationRouter::new(vec![NotificationChannel::Ubidots {
            http: reqwest::Client::new(),
            device_url: ubidots_device_url("t", "d"),
        }]);
        router.broadcast("moisture 42.0%").await;
    }

    #[tokio::test]
    async fn moisture_publish_skips_text_channels() {
        // MQTT with a dropped eventloop would fail a publish; readings must
        // never be routed there.
        let (client, el) = test_mqtt();
        drop(el);
        let router = NotificationRouter::new(vec![NotificationChannel::Mqtt {
            client,
            topic: "garden/watering".into(),
        }]);
        router.publish_moisture(42.0).await;
    }
}
