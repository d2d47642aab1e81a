//! Local visual alert.
//!
//! `PopupServer` serves the alert page on a loopback address: the room name,
//! a `sip:` call link and the latest snapshot. `PopupStep` opens that page
//! with the platform opener when motion is detected.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::dispatch::AlertStep;
use crate::escape_xml;
use crate::RoomBinding;

const MAX_REQUEST_BYTES: usize = 8192;
pub const SNAPSHOT_ROUTE: &str = "/static/img/snapshot.jpg";

#[derive(Clone, Debug)]
pub struct PopupConfig {
    pub addr: String,
    pub binding: RoomBinding,
    pub snapshot_path: PathBuf,
}

#[derive(Debug)]
pub struct PopupHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PopupHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("popup server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct PopupServer {
    cfg: PopupConfig,
}

impl PopupServer {
    pub fn new(cfg: PopupConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<PopupHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid popup address '{}'", self.cfg.addr))?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "popup server must bind a loopback address, got '{}'",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_popup(listener, cfg, shutdown_thread) {
                log::error!("popup server stopped: {}", err);
            }
        });

        Ok(PopupHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_popup(listener: TcpListener, cfg: PopupConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg) {
                    log::warn!("popup request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &PopupConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        return write_response(&mut stream, 405, "text/plain", b"method not allowed");
    }
    match request.path.as_str() {
        "/" => {
            let page = render_page(&cfg.binding);
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        SNAPSHOT_ROUTE => match std::fs::read(&cfg.snapshot_path) {
            Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
            Err(_) => write_response(&mut stream, 404, "text/plain", b"no snapshot yet"),
        },
        "/health" => {
            write_response(&mut stream, 200, "application/json", br#"{"status":"ok"}"#)
        }
        _ => write_response(&mut stream, 404, "text/plain", b"not found"),
    }
}

/// Alert page for `binding`.
pub fn render_page(binding: &RoomBinding) -> String {
    let room = escape_xml(&binding.room_name);
    let sip = escape_xml(&binding.call_address);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Movement detected: {room}</title>\n</head>\n<body>\n\
         <h1>Movement detected in {room}</h1>\n\
         <p><a href=\"sip:{sip}\">Call {room} ({sip})</a></p>\n\
         <img src=\"{img}\" alt=\"Snapshot of {room}\" style=\"max-width:100%\">\n\
         </body>\n</html>\n",
        room = room,
        sip = sip,
        img = SNAPSHOT_ROUTE
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line,
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

// -------------------- Opening the page --------------------

/// Command line that opens `url`: the configured browser, or the platform
/// default opener.
pub fn opener_command(url: &str, browser: Option<&str>) -> (String, Vec<String>) {
    if let Some(browser) = browser {
        let mut parts = browser.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            let mut args: Vec<String> = parts.collect();
            args.push(url.to_string());
            return (program, args);
        }
    }
    if cfg!(target_os = "macos") {
        ("open".to_string(), vec![url.to_string()])
    } else if cfg!(target_os = "windows") {
        (
            "cmd".to_string(),
            vec!["/C".to_string(), "start".to_string(), String::new(), url.to_string()],
        )
    } else {
        ("xdg-open".to_string(), vec![url.to_string()])
    }
}

/// Alert step: open the popup page.
pub struct PopupStep {
    url: String,
    browser: Option<String>,
}

impl PopupStep {
    pub fn new(url: &str, browser: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            browser,
        }
    }
}

impl AlertStep for PopupStep {
    fn name(&self) -> &'static str {
        "popup"
    }

    fn run(&self, _binding: &RoomBinding) -> Result<()> {
        let (program, args) = opener_command(&self.url, self.browser.as_deref());
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to launch '{}'", program))?;
        if !status.success() {
            return Err(anyhow!("'{}' exited with {}", program, status));
        }
        log::info!("popup opened at {}", self.url);
        Ok(())
    }
}
