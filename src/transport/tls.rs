//! Broker endpoint parsing and TLS transport for the detection feed.
//!
//! Camera brokers are usually plain MQTT on the local network; TLS is
//! enabled by the `mqtts://`/`ssl://` scheme or the `use_tls` setting.
//! - CA verification: custom CA path or webpki roots
//! - Client certificates: mutual TLS when both cert and key are given

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// TLS certificate materials for the broker connection.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes.
    /// When None, webpki root certificates are used.
    pub ca: Option<Vec<u8>>,

    /// Client certificate and key for mutual TLS, (cert, key).
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Load TLS materials from file paths. Client cert and key go together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

/// Broker endpoint with TLS flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub materials: TlsMaterials,
}

impl TlsConfig {
    /// Build a rumqttc Transport for `endpoint`.
    ///
    /// # Errors
    /// - If TLS materials are provided but TLS is disabled
    /// - If client certificates are provided without a CA
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.materials.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled.\n\
                     Set mqtt.use_tls or use an mqtts:// broker address."
                ));
            }
            return Ok(Transport::tcp());
        }

        if !self.materials.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }

        let ca = self.materials.ca.clone().ok_or_else(|| {
            anyhow!(
                "MQTT TLS CA certificate is required when providing client certificates.\n\
                 Set mqtt.tls_ca_path or remove the client cert configuration."
            )
        })?;

        Ok(Transport::tls(ca, self.materials.client_auth.clone(), None))
    }
}

/// Parse a broker address.
///
/// Supports formats:
/// - `host:port` (plain TCP or TLS based on tls_override)
/// - `mqtt://host:port`, `tcp://host:port` (plain TCP)
/// - `mqtts://host:port`, `ssl://host:port` (TLS)
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Reject non-loopback brokers unless remote access was opted into.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker is not loopback: {} (use --allow-remote-mqtt for a camera broker on the LAN)",
        original
    ))
}
