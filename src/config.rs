use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::snapshot::{PollPolicy, DEFAULT_API_BASE};
use crate::RoomBinding;

const DEFAULT_SNAPSHOT_PATH: &str = "static/img/snapshot.jpg";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "presence_alert";
const DEFAULT_TOPIC_TEMPLATE: &str = "/merakimv/{sensor}/raw_detections";
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_XMPP_PORT: u16 = 5222;
const DEFAULT_XMPP_RESOURCE: &str = "presence-alert";
const DEFAULT_SENSITIVITY: f64 = 0.05;
const DEFAULT_PAUSE_SECS: u64 = 30;
const DEFAULT_OBJECT_CLASS: &str = "person";
const DEFAULT_POPUP_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_POPUP_ADDR: &str = "127.0.0.1:5000";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertConfigFile {
    capture: Option<CaptureConfigFile>,
    mqtt: Option<MqttConfigFile>,
    xmpp: Option<XmppConfigFile>,
    motion: Option<MotionConfigFile>,
    popup: Option<PopupConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    api_key: Option<String>,
    network_id: Option<String>,
    api_base: Option<String>,
    snapshot_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    /// 0 polls until the image appears.
    max_poll_attempts: Option<u32>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    client_id: Option<String>,
    topic_template: Option<String>,
    reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct XmppConfigFile {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
    port: Option<u16>,
    recipient: Option<String>,
    starttls: Option<bool>,
    resource: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    sensitivity: Option<f64>,
    pause_secs: Option<u64>,
    object_class: Option<String>,
    evict_after_batches: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PopupConfigFile {
    url: Option<String>,
    serve: Option<bool>,
    addr: Option<String>,
    browser: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub capture: CaptureSettings,
    pub mqtt: MqttSettings,
    pub xmpp: XmppSettings,
    pub motion: MotionSettings,
    pub popup: PopupSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub api_key: String,
    pub network_id: String,
    pub api_base: String,
    pub snapshot_path: PathBuf,
    pub poll: PollPolicy,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub client_id: String,
    pub topic_template: String,
    pub reconnect_delay: Duration,
}

impl MqttSettings {
    /// Detection topic for the bound sensor.
    pub fn topic_for(&self, binding: &RoomBinding) -> String {
        self.topic_template.replace("{sensor}", &binding.sensor_id)
    }
}

#[derive(Debug, Clone)]
pub struct XmppSettings {
    pub jid: String,
    pub password: String,
    /// Host to connect to; defaults to the JID's domain.
    pub server: Option<String>,
    pub port: u16,
    pub recipient: String,
    pub starttls: bool,
    pub resource: String,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub sensitivity: f64,
    pub pause: Duration,
    pub object_class: String,
    pub evict_after_batches: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PopupSettings {
    pub url: String,
    pub serve: bool,
    pub addr: String,
    pub browser: Option<String>,
}

impl AlertConfig {
    /// Read the settings file (if any), apply `PRESENCE_*` overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => AlertConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse settings from TOML text without environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: AlertConfigFile = toml::from_str(raw).context("invalid settings")?;
        let mut cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AlertConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let xmpp = file.xmpp.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let popup = file.popup.unwrap_or_default();

        let max_attempts = capture
            .max_poll_attempts
            .unwrap_or(DEFAULT_MAX_POLL_ATTEMPTS);
        Self {
            capture: CaptureSettings {
                api_key: capture.api_key.unwrap_or_default(),
                network_id: capture.network_id.unwrap_or_default(),
                api_base: capture
                    .api_base
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
                snapshot_path: capture
                    .snapshot_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
                poll: PollPolicy {
                    interval: Duration::from_millis(
                        capture.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                    ),
                    max_attempts: (max_attempts > 0).then_some(max_attempts),
                },
                request_timeout: Duration::from_secs(
                    capture
                        .request_timeout_secs
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                ),
            },
            mqtt: MqttSettings {
                broker: mqtt
                    .broker
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_template: mqtt
                    .topic_template
                    .unwrap_or_else(|| DEFAULT_TOPIC_TEMPLATE.to_string()),
                reconnect_delay: Duration::from_secs(
                    mqtt.reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
            },
            xmpp: XmppSettings {
                jid: xmpp.jid.unwrap_or_default(),
                password: xmpp.password.unwrap_or_default(),
                server: xmpp.server,
                port: xmpp.port.unwrap_or(DEFAULT_XMPP_PORT),
                recipient: xmpp.recipient.unwrap_or_default(),
                starttls: xmpp.starttls.unwrap_or(true),
                resource: xmpp
                    .resource
                    .unwrap_or_else(|| DEFAULT_XMPP_RESOURCE.to_string()),
            },
            motion: MotionSettings {
                sensitivity: motion.sensitivity.unwrap_or(DEFAULT_SENSITIVITY),
                pause: Duration::from_secs(motion.pause_secs.unwrap_or(DEFAULT_PAUSE_SECS)),
                object_class: motion
                    .object_class
                    .unwrap_or_else(|| DEFAULT_OBJECT_CLASS.to_string()),
                evict_after_batches: motion.evict_after_batches,
            },
            popup: PopupSettings {
                url: popup.url.unwrap_or_else(|| DEFAULT_POPUP_URL.to_string()),
                serve: popup.serve.unwrap_or(true),
                addr: popup.addr.unwrap_or_else(|| DEFAULT_POPUP_ADDR.to_string()),
                browser: popup.browser,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        override_string("PRESENCE_API_KEY", &mut self.capture.api_key);
        override_string("PRESENCE_NETWORK_ID", &mut self.capture.network_id);
        override_string("PRESENCE_MQTT_BROKER", &mut self.mqtt.broker);
        override_string("PRESENCE_XMPP_JID", &mut self.xmpp.jid);
        override_string("PRESENCE_XMPP_PASSWORD", &mut self.xmpp.password);
        override_string("PRESENCE_XMPP_RECIPIENT", &mut self.xmpp.recipient);
        if let Ok(user) = std::env::var("PRESENCE_MQTT_USERNAME") {
            if !user.trim().is_empty() {
                self.mqtt.username = Some(user);
            }
        }
        if let Ok(pass) = std::env::var("PRESENCE_MQTT_PASSWORD") {
            if !pass.is_empty() {
                self.mqtt.password = Some(pass);
            }
        }
        if let Ok(path) = std::env::var("PRESENCE_SNAPSHOT_PATH") {
            if !path.trim().is_empty() {
                self.capture.snapshot_path = PathBuf::from(path);
            }
        }
        if let Ok(value) = std::env::var("PRESENCE_SENSITIVITY") {
            self.motion.sensitivity = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_SENSITIVITY must be a number"))?;
        }
        if let Ok(value) = std::env::var("PRESENCE_PAUSE_SECS") {
            let seconds: u64 = value.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_PAUSE_SECS must be an integer number of seconds")
            })?;
            self.motion.pause = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        require("capture.api_key", &self.capture.api_key)?;
        require("capture.network_id", &self.capture.network_id)?;
        require("xmpp.jid", &self.xmpp.jid)?;
        require("xmpp.password", &self.xmpp.password)?;
        require("xmpp.recipient", &self.xmpp.recipient)?;

        if !(self.motion.sensitivity > 0.0 && self.motion.sensitivity <= 1.0) {
            return Err(anyhow!(
                "motion.sensitivity must be in (0, 1], got {}",
                self.motion.sensitivity
            ));
        }
        if self.motion.object_class.trim().is_empty() {
            return Err(anyhow!("motion.object_class must not be empty"));
        }
        self.motion.object_class = self.motion.object_class.trim().to_lowercase();

        if !self.mqtt.topic_template.contains("{sensor}") {
            return Err(anyhow!(
                "mqtt.topic_template must contain {{sensor}}: {}",
                self.mqtt.topic_template
            ));
        }
        crate::transport::parse_mqtt_endpoint(&self.mqtt.broker, self.mqtt.use_tls)
            .context("mqtt.broker")?;

        if self.xmpp.port == 0 {
            return Err(anyhow!("xmpp.port must be greater than zero"));
        }
        if !self.xmpp.jid.contains('@') {
            return Err(anyhow!("xmpp.jid must look like user@domain: {}", self.xmpp.jid));
        }

        url::Url::parse(&self.capture.api_base).context("capture.api_base")?;
        url::Url::parse(&self.popup.url).context("popup.url")?;
        if self.capture.poll.interval.is_zero() {
            return Err(anyhow!("capture.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AlertConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn require(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} is required", key));
    }
    Ok(())
}

// -------------------- Room mapping --------------------

/// Sensor to room mapping from a CSV document with a header row.
///
/// Columns are `sensor_id,room_name,call_address`; the legacy headers
/// `Meraki_SN,Room_Name,Jabber_Room_SIP` are accepted too. Only the first
/// row is active.
#[derive(Debug, Clone)]
pub struct RoomTable {
    rooms: Vec<RoomBinding>,
}

impl RoomTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read room table {}: {}", path.display(), e))?;
        Self::parse(&raw).with_context(|| format!("invalid room table {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw
            .lines()
            .map(|line| line.trim_start_matches('\u{feff}').trim())
            .filter(|line| !line.is_empty());
        let header = lines.next().ok_or_else(|| anyhow!("missing header row"))?;
        let columns = split_csv_row(header);
        let sensor_col = column_index(&columns, &["sensor_id", "meraki_sn"])?;
        let room_col = column_index(&columns, &["room_name"])?;
        let call_col = column_index(&columns, &["call_address", "jabber_room_sip"])?;

        let mut rooms = Vec::new();
        for (row_no, line) in lines.enumerate() {
            let fields = split_csv_row(line);
            let field = |idx: usize, name: &str| -> Result<String> {
                fields
                    .get(idx)
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| anyhow!("row {}: missing {}", row_no + 1, name))
            };
            rooms.push(RoomBinding {
                sensor_id: field(sensor_col, "sensor_id")?,
                room_name: field(room_col, "room_name")?,
                call_address: field(call_col, "call_address")?,
            });
        }
        if rooms.is_empty() {
            return Err(anyhow!("no room rows"));
        }
        Ok(Self { rooms })
    }

    /// The monitored room.
    pub fn active(&self) -> &RoomBinding {
        &self.rooms[0]
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn ignored(&self) -> &[RoomBinding] {
        &self.rooms[1..]
    }
}

fn column_index(columns: &[String], names: &[&str]) -> Result<usize> {
    columns
        .iter()
        .position(|c| names.iter().any(|n| c.trim().eq_ignore_ascii_case(n)))
        .ok_or_else(|| anyhow!("missing column {}", names[0]))
}

/// Split one CSV row, honouring double quotes and `""` escapes.
fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
