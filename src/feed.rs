//! Detection feed: payload decoding, the per-message pipeline, and the MQTT
//! receive loop.
//!
//! Messages are handled strictly one at a time. A fired alert blocks the
//! loop for the cooldown pause, after which the session is torn down and a
//! fresh one is opened so the broker-side backlog is discarded.

use anyhow::{anyhow, Context, Result};
use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, QoS, RecvTimeoutError};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::Dispatch;
use crate::gate::{CooldownGate, GateDecision};
use crate::tracker::ObjectTracker;
use crate::transport::{MqttEndpoint, TlsConfig};
use crate::{BoundingBox, DetectionRecord, ObjectId};

const RECV_POLL: Duration = Duration::from_millis(500);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

// -------------------- Decoding --------------------

#[derive(Debug, Deserialize)]
struct RawDetectionMessage {
    // Required key; `null` means an empty frame.
    #[serde(deserialize_with = "null_as_empty")]
    objects: Vec<RawObject>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<RawObject>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Vec<RawObject>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    oid: Value,
    x0: Option<f64>,
    y0: Option<f64>,
    x1: Option<f64>,
    y1: Option<f64>,
}

/// Decode one feed payload into the records of class `object_class`.
///
/// The class must match exactly. An empty result means the message carries nothing of interest. Errors
/// are confined to this one message.
pub fn decode_batch(payload: &[u8], object_class: &str) -> Result<Vec<DetectionRecord>> {
    let message: RawDetectionMessage =
        serde_json::from_slice(payload).context("parse detection JSON")?;

    message
        .objects
        .into_iter()
        .filter(|obj| obj.kind == object_class)
        .map(|obj| {
            let object_id = match &obj.oid {
                Value::String(s) if !s.is_empty() => ObjectId::new(s.as_str()),
                Value::Number(n) => ObjectId::new(n.to_string()),
                other => return Err(anyhow!("detection has invalid oid: {}", other)),
            };
            let coord = |v: Option<f64>, name: &str| {
                v.ok_or_else(|| anyhow!("detection {} missing {}", object_id, name))
            };
            let bounding_box = BoundingBox::new(
                coord(obj.x0, "x0")?,
                coord(obj.y0, "y0")?,
                coord(obj.x1, "x1")?,
                coord(obj.y1, "y1")?,
            );
            Ok(DetectionRecord {
                object_id,
                object_class: obj.kind,
                bounding_box,
            })
        })
        .collect()
}

// -------------------- Pipeline --------------------

/// What the receive loop must do after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedAction {
    Continue,
    /// Drop the current session and open a fresh one.
    Reconnect,
}

/// Tracker plus gate for one room, fed one payload at a time.
pub struct Pipeline<D> {
    tracker: ObjectTracker,
    gate: CooldownGate<D>,
    object_class: String,
}

impl<D: Dispatch> Pipeline<D> {
    pub fn new(tracker: ObjectTracker, gate: CooldownGate<D>, object_class: &str) -> Self {
        Self {
            tracker,
            gate,
            object_class: object_class.to_string(),
        }
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn gate(&self) -> &CooldownGate<D> {
        &self.gate
    }

    pub fn handle_payload(&mut self, payload: &[u8]) -> Result<FeedAction> {
        let batch = decode_batch(payload, &self.object_class)?;
        if batch.is_empty() {
            return Ok(FeedAction::Continue);
        }
        log::debug!("{} {} detection(s) in message", batch.len(), self.object_class);

        let event = self.tracker.observe(&batch);
        match self.gate.handle_event(event) {
            GateDecision::Fired(_) => Ok(FeedAction::Reconnect),
            GateDecision::Idle | GateDecision::Suppressed => Ok(FeedAction::Continue),
        }
    }
}

// -------------------- MQTT loop --------------------

#[derive(Clone, Debug)]
pub struct FeedSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsConfig,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub reconnect_delay: Duration,
}

enum SessionEnd {
    Reset,
    TransportFailed,
    Shutdown,
}

/// Run the feed until `shutdown` is set. Transport failures are retried
/// forever; only configuration errors are returned.
pub fn run_feed<D: Dispatch>(
    settings: &FeedSettings,
    pipeline: &mut Pipeline<D>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (client, mut connection) = connect_mqtt(settings)?;
        if let Err(e) = client.subscribe(settings.topic.as_str(), QoS::AtMostOnce) {
            log::error!("MQTT subscribe failed: {}. Reconnecting...", e);
            wait_or_shutdown(settings.reconnect_delay, &shutdown);
            continue;
        }

        let end = run_session(&mut connection, pipeline, &shutdown);
        let _ = client.disconnect();
        match end {
            SessionEnd::Reset => {
                log::info!("resetting MQTT session to drop queued detections");
            }
            SessionEnd::TransportFailed => {
                wait_or_shutdown(settings.reconnect_delay, &shutdown);
            }
            SessionEnd::Shutdown => {
                log::info!("feed stopped");
                return Ok(());
            }
        }
    }
}

fn run_session<D: Dispatch>(
    connection: &mut Connection,
    pipeline: &mut Pipeline<D>,
    shutdown: &AtomicBool,
) -> SessionEnd {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return SessionEnd::Shutdown;
        }
        match connection.recv_timeout(RECV_POLL) {
            Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                log::info!("connected to MQTT broker ({:?})", ack.code);
            }
            Ok(Ok(Event::Incoming(Incoming::SubAck(_)))) => {
                log::info!("subscribed to detection feed");
            }
            Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                match pipeline.handle_payload(&publish.payload) {
                    Ok(FeedAction::Continue) => {}
                    Ok(FeedAction::Reconnect) => return SessionEnd::Reset,
                    Err(e) => log::warn!("skipping message on {}: {:#}", publish.topic, e),
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                log::error!("MQTT connection error: {}. Reconnecting...", e);
                return SessionEnd::TransportFailed;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("MQTT connection closed. Reconnecting...");
                return SessionEnd::TransportFailed;
            }
        }
    }
}

fn connect_mqtt(settings: &FeedSettings) -> Result<(Client, Connection)> {
    let endpoint = &settings.endpoint;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    options.set_transport(settings.tls.build_transport(endpoint)?);

    let (client, connection) = Client::new(options, 10);
    log::info!(
        "opening MQTT session to {} (auth: {}), topic {}",
        endpoint,
        settings.username.is_some(),
        settings.topic
    );
    Ok((client, connection))
}

fn wait_or_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < delay && !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(step);
        waited += step;
    }
}
