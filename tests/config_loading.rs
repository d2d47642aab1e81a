use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use presence_alert::{AlertConfig, RoomTable};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_API_KEY",
        "PRESENCE_NETWORK_ID",
        "PRESENCE_MQTT_BROKER",
        "PRESENCE_MQTT_USERNAME",
        "PRESENCE_MQTT_PASSWORD",
        "PRESENCE_XMPP_JID",
        "PRESENCE_XMPP_PASSWORD",
        "PRESENCE_XMPP_RECIPIENT",
        "PRESENCE_SNAPSHOT_PATH",
        "PRESENCE_SENSITIVITY",
        "PRESENCE_PAUSE_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

#[test]
fn loads_settings_file_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        r#"
        [capture]
        api_key = "file-key"
        network_id = "N_24329156"
        snapshot_path = "/var/lib/presence/snapshot.jpg"
        poll_interval_ms = 500
        max_poll_attempts = 0

        [mqtt]
        broker = "mqtt://10.0.0.8:1883"
        username = "camera"
        topic_template = "cams/{sensor}/detections"

        [xmpp]
        jid = "alerts@chat.example.com"
        password = "from-file"
        recipient = "nurse@chat.example.com"
        starttls = false

        [motion]
        sensitivity = 0.1
        pause_secs = 45
        object_class = "Person"
        evict_after_batches = 600

        [popup]
        serve = false
        browser = "firefox --new-window"
        "#,
    );

    std::env::set_var("PRESENCE_API_KEY", "env-key");
    std::env::set_var("PRESENCE_XMPP_PASSWORD", "from-env");
    std::env::set_var("PRESENCE_PAUSE_SECS", "10");

    let cfg = AlertConfig::load(Some(file.path())).expect("load config");
    clear_env();

    assert_eq!(cfg.capture.api_key, "env-key");
    assert_eq!(cfg.capture.network_id, "N_24329156");
    assert_eq!(
        cfg.capture.snapshot_path,
        PathBuf::from("/var/lib/presence/snapshot.jpg")
    );
    assert_eq!(cfg.capture.poll.interval, Duration::from_millis(500));
    assert_eq!(cfg.capture.poll.max_attempts, None);

    assert_eq!(cfg.mqtt.broker, "mqtt://10.0.0.8:1883");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("camera"));
    assert_eq!(cfg.mqtt.password, None);

    assert_eq!(cfg.xmpp.password, "from-env");
    assert!(!cfg.xmpp.starttls);
    assert_eq!(cfg.xmpp.port, 5222);

    assert!((cfg.motion.sensitivity - 0.1).abs() < f64::EPSILON);
    assert_eq!(cfg.motion.pause, Duration::from_secs(10));
    assert_eq!(cfg.motion.object_class, "person");
    assert_eq!(cfg.motion.evict_after_batches, Some(600));

    assert!(!cfg.popup.serve);
    assert_eq!(cfg.popup.browser.as_deref(), Some("firefox --new-window"));

    let rooms = RoomTable::parse("sensor_id,room_name,call_address\nQ2GV-ABCD,101,room101@x\n")
        .expect("rooms");
    assert_eq!(cfg.mqtt.topic_for(rooms.active()), "cams/Q2GV-ABCD/detections");
}

#[test]
fn env_alone_is_enough_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_API_KEY", "k");
    std::env::set_var("PRESENCE_NETWORK_ID", "N_1");
    std::env::set_var("PRESENCE_XMPP_JID", "alerts@example.com");
    std::env::set_var("PRESENCE_XMPP_PASSWORD", "p");
    std::env::set_var("PRESENCE_XMPP_RECIPIENT", "nurse@example.com");
    std::env::set_var("PRESENCE_SENSITIVITY", "0.2");

    let cfg = AlertConfig::load(None).expect("load config");
    clear_env();

    assert_eq!(cfg.mqtt.broker, "127.0.0.1:1883");
    assert!(cfg.xmpp.starttls);
    assert!((cfg.motion.sensitivity - 0.2).abs() < f64::EPSILON);
    assert_eq!(cfg.motion.pause, Duration::from_secs(30));
    assert_eq!(cfg.capture.poll.max_attempts, Some(30));
    assert!(cfg.popup.serve);
}

#[test]
fn missing_credentials_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = AlertConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("capture.api_key"));
}

#[test]
fn invalid_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        r#"
        [capture]
        api_key = "k"
        network_id = "N_1"
        [xmpp]
        jid = "alerts@example.com"
        password = "p"
        recipient = "nurse@example.com"
        "#,
    );
    std::env::set_var("PRESENCE_SENSITIVITY", "lots");
    let err = AlertConfig::load(Some(file.path())).unwrap_err();
    clear_env();
    assert!(err.to_string().contains("PRESENCE_SENSITIVITY"));

    std::env::set_var("PRESENCE_SENSITIVITY", "1.5");
    let err = AlertConfig::load(Some(file.path())).unwrap_err();
    clear_env();
    assert!(err.to_string().contains("sensitivity"));
}

#[test]
fn unknown_sections_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp("[cameras]\nfront = \"x\"\n");
    let err = AlertConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));
}

#[test]
fn room_table_with_legacy_headers_watches_first_row() {
    let file = write_temp(
        "Meraki_SN,Room_Name,Jabber_Room_SIP\n\
         Q2GV-ABCD,\"Ward 3, Bed 2\",ward3@example.com\n\
         Q2GV-EFGH,Ward 4,ward4@example.com\n",
    );
    let rooms = RoomTable::load(file.path()).expect("room table");
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms.active().sensor_id, "Q2GV-ABCD");
    assert_eq!(rooms.active().room_name, "Ward 3, Bed 2");
    assert_eq!(rooms.ignored().len(), 1);
    assert_eq!(rooms.ignored()[0].room_name, "Ward 4");
}

#[test]
fn room_table_without_rows_is_rejected() {
    let file = write_temp("sensor_id,room_name,call_address\n");
    assert!(RoomTable::load(file.path()).is_err());
    assert!(RoomTable::load(&file.path().with_extension("missing")).is_err());
}
