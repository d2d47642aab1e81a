//! Snapshot capture client.
//!
//! Capture is asynchronous on the camera backend: a POST creates a snapshot
//! job and returns the URL where the image will appear. That URL is polled
//! until it serves the image, which is then written over the configured
//! snapshot file.

use anyhow::Result;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::dispatch::AlertStep;
use crate::RoomBinding;

pub const API_KEY_HEADER: &str = "X-Cisco-Meraki-API-Key";
pub const DEFAULT_API_BASE: &str = "https://api.meraki.com/api/v0";
const MAX_SNAPSHOT_BYTES: u64 = 20 * 1024 * 1024;
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum CaptureError {
    /// The backend rejected the snapshot job, or could not be reached.
    Request(String),
    /// The job response could not be understood.
    BadResponse(String),
    /// The image never became available within the poll budget.
    NotReady { attempts: u32 },
    /// Polling stopped because the process is shutting down.
    Interrupted { attempts: u32 },
    Io(std::io::Error),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Request(msg) => write!(f, "snapshot request failed: {}", msg),
            CaptureError::BadResponse(msg) => write!(f, "snapshot response invalid: {}", msg),
            CaptureError::NotReady { attempts } => {
                write!(f, "snapshot not ready after {} attempts", attempts)
            }
            CaptureError::Interrupted { attempts } => {
                write!(f, "snapshot polling interrupted after {} attempts", attempts)
            }
            CaptureError::Io(e) => write!(f, "snapshot io error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Io(e)
    }
}

/// How long to keep fetching a snapshot URL that is not ready yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls forever.
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: Some(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotJob {
    url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub path: PathBuf,
    pub bytes: usize,
    pub attempts: u32,
}

pub struct SnapshotClient {
    agent: ureq::Agent,
    api_base: String,
    api_key: String,
    poll: PollPolicy,
    max_image_bytes: u64,
    shutdown: Option<Arc<AtomicBool>>,
}

impl SnapshotClient {
    pub fn new(api_base: &str, api_key: &str, poll: PollPolicy, request_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(request_timeout).build();
        Self {
            agent,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            poll,
            max_image_bytes: MAX_SNAPSHOT_BYTES,
            shutdown: None,
        }
    }

    /// Largest image accepted; bigger bodies are rejected.
    pub fn with_max_image_bytes(mut self, limit: u64) -> Self {
        self.max_image_bytes = limit;
        self
    }

    /// Stop polling once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn job_endpoint(&self, sensor_id: &str, network_id: &str) -> String {
        format!(
            "{}/networks/{}/cameras/{}/snapshot",
            self.api_base, network_id, sensor_id
        )
    }

    pub fn capture_and_save(
        &self,
        sensor_id: &str,
        network_id: &str,
        destination: &Path,
    ) -> std::result::Result<SavedSnapshot, CaptureError> {
        let image_url = self.request_job(sensor_id, network_id)?;
        log::debug!("snapshot job accepted, image at {}", image_url);
        let (bytes, attempts) = self.fetch_when_ready(&image_url)?;
        write_replacing(destination, &bytes)?;
        log::info!(
            "snapshot saved to {} ({} bytes, {} attempts)",
            destination.display(),
            bytes.len(),
            attempts
        );
        Ok(SavedSnapshot {
            path: destination.to_path_buf(),
            bytes: bytes.len(),
            attempts,
        })
    }

    /// Create a snapshot job and return the (whitespace-stripped) image URL.
    pub fn request_job(
        &self,
        sensor_id: &str,
        network_id: &str,
    ) -> std::result::Result<String, CaptureError> {
        let endpoint = self.job_endpoint(sensor_id, network_id);
        let response = self
            .agent
            .post(&endpoint)
            .set(API_KEY_HEADER, &self.api_key)
            .set("Content-Type", "application/json")
            .send_string("{}")
            .map_err(|e| match e {
                ureq::Error::Status(code, response) => CaptureError::Request(format!(
                    "HTTP {} from {}: {}",
                    code,
                    endpoint,
                    response.into_string().unwrap_or_default().trim()
                )),
                ureq::Error::Transport(t) => CaptureError::Request(t.to_string()),
            })?;

        let body = response.into_string()?;
        let job: SnapshotJob = serde_json::from_str(&body)
            .map_err(|e| CaptureError::BadResponse(format!("job body: {}", e)))?;
        let url = strip_whitespace(&job.url);
        Url::parse(&url)
            .map_err(|e| CaptureError::BadResponse(format!("image url '{}': {}", url, e)))?;
        Ok(url)
    }

    /// Fetch `url` until it answers 200. Returns the body and attempt count.
    pub fn fetch_when_ready(&self, url: &str) -> std::result::Result<(Vec<u8>, u32), CaptureError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.agent.get(url).call() {
                Ok(response) if response.status() == 200 => {
                    let mut bytes = Vec::new();
                    response
                        .into_reader()
                        .take(self.max_image_bytes.saturating_add(1))
                        .read_to_end(&mut bytes)?;
                    if bytes.len() as u64 > self.max_image_bytes {
                        return Err(CaptureError::BadResponse(format!(
                            "image larger than {} bytes",
                            self.max_image_bytes
                        )));
                    }
                    return Ok((bytes, attempts));
                }
                Ok(response) => {
                    log::debug!("snapshot not ready (HTTP {})", response.status());
                }
                Err(ureq::Error::Status(code, _)) => {
                    log::debug!("snapshot not ready (HTTP {})", code);
                }
                Err(ureq::Error::Transport(t)) => {
                    log::debug!("snapshot fetch failed, retrying: {}", t);
                }
            }

            if let Some(max) = self.poll.max_attempts {
                if attempts >= max {
                    return Err(CaptureError::NotReady { attempts });
                }
            }
            if !self.sleep_unless_shutdown(self.poll.interval) {
                log::info!("snapshot polling stopped for shutdown");
                return Err(CaptureError::Interrupted { attempts });
            }
        }
    }

    /// Sleep for `delay` in short slices. Returns false if shutdown was
    /// requested before or during the sleep.
    fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

fn strip_whitespace(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Overwrite `path` with `bytes` through a sibling temp file.
fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("part");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Alert step: capture a snapshot of the room's sensor.
pub struct SnapshotStep {
    client: SnapshotClient,
    network_id: String,
    destination: PathBuf,
}

impl SnapshotStep {
    pub fn new(client: SnapshotClient, network_id: &str, destination: PathBuf) -> Self {
        Self {
            client,
            network_id: network_id.to_string(),
            destination,
        }
    }
}

impl AlertStep for SnapshotStep {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn run(&self, binding: &RoomBinding) -> Result<()> {
        self.client
            .capture_and_save(&binding.sensor_id, &self.network_id, &self.destination)?;
        Ok(())
    }
}
