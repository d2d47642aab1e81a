//! presence_alertd - watch one room's detection feed and alert on movement.
//!
//! 1. Loads the settings file and the room mapping table
//! 2. Subscribes to the bound sensor's raw detection topic
//! 3. Tracks person bounding boxes and fires on movement
//! 4. Captures a snapshot, opens the popup page and sends an XMPP message
//! 5. Pauses, then reconnects so stale detections are dropped

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use presence_alert::feed::{run_feed, FeedSettings};
use presence_alert::notify::{MessageStep, XmppNotifier};
use presence_alert::popup::{PopupConfig, PopupServer, PopupStep};
use presence_alert::snapshot::SnapshotStep;
use presence_alert::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, TlsConfig, TlsMaterials,
};
use presence_alert::{
    AlertConfig, AlertDispatcher, CooldownGate, ObjectTracker, Pipeline, RoomTable,
    SnapshotClient,
};

const DEFAULT_CONFIG_PATH: &str = "presence.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Room presence alerting from camera detections")]
struct Args {
    /// Settings file (TOML). Without it, `presence.toml` is used when present;
    /// otherwise every setting comes from PRESENCE_* variables.
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Room mapping table (CSV). Only the first data row is watched.
    #[arg(long, env = "PRESENCE_ROOMS", default_value = "rooms.csv")]
    rooms: PathBuf,

    /// Allow a non-loopback MQTT broker, e.g. the camera broker on the LAN.
    #[arg(long, env = "PRESENCE_ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// Do not serve the popup page locally; the popup URL is opened as is.
    #[arg(long)]
    no_popup_server: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_PATH);
        default.exists().then(|| default.to_path_buf())
    });
    let cfg = AlertConfig::load(config_path.as_deref())?;
    let rooms = RoomTable::load(&args.rooms)?;
    for ignored in rooms.ignored() {
        log::warn!(
            "ignoring room '{}' (sensor {}): only the first row is watched",
            ignored.room_name,
            ignored.sensor_id
        );
    }
    let binding = rooms.active().clone();

    let endpoint = parse_mqtt_endpoint(&cfg.mqtt.broker, cfg.mqtt.use_tls)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&endpoint, &cfg.mqtt.broker)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    let tls = TlsConfig {
        materials: TlsMaterials::load(
            cfg.mqtt.tls_ca_path.as_deref(),
            cfg.mqtt.tls_client_cert_path.as_deref(),
            cfg.mqtt.tls_client_key_path.as_deref(),
        )?,
    };
    let feed = FeedSettings {
        endpoint,
        tls,
        client_id: cfg.mqtt.client_id.clone(),
        username: cfg.mqtt.username.clone(),
        password: cfg.mqtt.password.clone(),
        topic: cfg.mqtt.topic_for(&binding),
        reconnect_delay: cfg.mqtt.reconnect_delay,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let snapshots = SnapshotClient::new(
        &cfg.capture.api_base,
        &cfg.capture.api_key,
        cfg.capture.poll,
        cfg.capture.request_timeout,
    )
    .with_shutdown(shutdown.clone());
    // The popup page embeds the snapshot, so it opens once capture is done.
    let dispatcher = AlertDispatcher::new()
        .with_step(SnapshotStep::new(
            snapshots,
            &cfg.capture.network_id,
            cfg.capture.snapshot_path.clone(),
        ))
        .then_step(PopupStep::new(&cfg.popup.url, cfg.popup.browser.clone()))
        .with_step(MessageStep::new(XmppNotifier::new(cfg.xmpp.clone())))
        .with_shutdown(shutdown.clone());

    let tracker = ObjectTracker::new(cfg.motion.sensitivity)
        .with_eviction(cfg.motion.evict_after_batches);
    let gate = CooldownGate::new(dispatcher, binding.clone(), cfg.motion.pause)
        .with_shutdown(shutdown.clone());
    let mut pipeline = Pipeline::new(tracker, gate, &cfg.motion.object_class);

    let popup = if cfg.popup.serve && !args.no_popup_server {
        let handle = PopupServer::new(PopupConfig {
            addr: cfg.popup.addr.clone(),
            binding: binding.clone(),
            snapshot_path: cfg.capture.snapshot_path.clone(),
        })
        .spawn()?;
        log::info!("popup page served on http://{}", handle.addr);
        Some(handle)
    } else {
        None
    };

    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    log::info!("presence_alertd starting");
    log::info!("  room: {} (sensor {})", binding.room_name, binding.sensor_id);
    log::info!("  MQTT broker: {} topic {}", feed.endpoint, feed.topic);
    log::info!(
        "  sensitivity {} pause {}s class '{}'",
        cfg.motion.sensitivity,
        cfg.motion.pause.as_secs(),
        cfg.motion.object_class
    );

    let result = run_feed(&feed, &mut pipeline, shutdown);
    if let Some(handle) = popup {
        handle.stop()?;
    }
    log::info!("presence_alertd stopped");
    result
}
