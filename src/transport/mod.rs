//! MQTT transport plumbing for the detection feed.
//!
//! Broker address parsing, the loopback guard, and TLS transport selection.

mod tls;

pub use tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsConfig, TlsMaterials};
