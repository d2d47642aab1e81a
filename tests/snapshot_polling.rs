use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use presence_alert::dispatch::Dispatch;
use presence_alert::popup::{PopupConfig, PopupServer, SNAPSHOT_ROUTE};
use presence_alert::snapshot::{SnapshotStep, API_KEY_HEADER};
use presence_alert::{
    AlertDispatcher, AlertStep, CaptureError, CooldownGate, FeedAction, ObjectTracker, Pipeline,
    PollPolicy, RoomBinding, SnapshotClient,
};

const IMAGE: &[u8] = b"\xff\xd8\xff\xe0fresh-jpeg";

#[derive(Clone)]
struct Request {
    line: String,
    headers: Vec<(String, String)>,
    body: String,
}

fn read_request(stream: &mut TcpStream) -> Request {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).unwrap();
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((k, v)) = header.split_once(':') {
            headers.push((k.trim().to_lowercase(), v.trim().to_string()));
        }
    }
    let len = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).unwrap();
    Request {
        line: line.trim_end().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
}

/// Fake camera API. The job answers `job_status`; the image URL answers
/// 503 `not_ready` times and then the image.
fn spawn_camera_api(
    job_status: &'static str,
    not_ready: usize,
) -> (SocketAddr, Arc<Mutex<Vec<Request>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_thread = seen.clone();
    std::thread::spawn(move || {
        let mut image_requests = 0usize;
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            let request = read_request(&mut stream);
            seen_thread.lock().unwrap().push(request.clone());
            let job_path = "POST /api/v0/networks/N_1/cameras/Q2GV-ABCD/snapshot";
            if request.line.starts_with(job_path) {
                if job_status.starts_with("200") {
                    let body = format!(
                        r#"{{"url": " http://{}/image/ab cd.jpg\n", "expiry": "in 5 minutes"}}"#,
                        addr
                    );
                    respond(&mut stream, job_status, "application/json", body.as_bytes());
                } else {
                    let body = br#"{"errors":["invalid network"]}"#;
                    respond(&mut stream, job_status, "application/json", body);
                }
            } else if request.line.starts_with("GET /image/abcd.jpg") {
                image_requests += 1;
                if image_requests <= not_ready {
                    respond(&mut stream, "503 Service Unavailable", "text/plain", b"pending");
                } else {
                    respond(&mut stream, "200 OK", "image/jpeg", IMAGE);
                }
            } else {
                respond(&mut stream, "404 Not Found", "text/plain", b"");
            }
        }
    });
    (addr, seen)
}

fn client(addr: SocketAddr, max_attempts: Option<u32>) -> SnapshotClient {
    SnapshotClient::new(
        &format!("http://{}/api/v0/", addr),
        "secret-key",
        PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts,
        },
        Duration::from_secs(5),
    )
}

#[test]
fn polls_until_ready_and_replaces_previous_snapshot() {
    let (addr, seen) = spawn_camera_api("200 OK", 2);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("static/img/snapshot.jpg");
    std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
    std::fs::write(&destination, b"an older and longer snapshot body").unwrap();

    let saved = client(addr, Some(10))
        .capture_and_save("Q2GV-ABCD", "N_1", &destination)
        .unwrap();

    assert_eq!(saved.attempts, 3);
    assert_eq!(saved.bytes, IMAGE.len());
    assert_eq!(std::fs::read(&destination).unwrap(), IMAGE);

    let seen = seen.lock().unwrap();
    let job = &seen[0];
    assert!(job.line.starts_with("POST "));
    assert_eq!(job.body, "{}");
    let key = job
        .headers
        .iter()
        .find(|(k, _)| *k == API_KEY_HEADER.to_lowercase())
        .map(|(_, v)| v.as_str());
    assert_eq!(key, Some("secret-key"));
    assert!(job
        .headers
        .iter()
        .any(|(k, v)| k == "content-type" && v == "application/json"));
    assert_eq!(seen.len(), 4);
}

#[test]
fn creates_missing_snapshot_directory() {
    let (addr, _seen) = spawn_camera_api("200 OK", 0);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("nested/dir/snapshot.jpg");

    let saved = client(addr, Some(3))
        .capture_and_save("Q2GV-ABCD", "N_1", &destination)
        .unwrap();
    assert_eq!(saved.attempts, 1);
    assert_eq!(std::fs::read(&destination).unwrap(), IMAGE);
}

#[test]
fn bounded_polling_gives_up_without_touching_the_file() {
    let (addr, _seen) = spawn_camera_api("200 OK", usize::MAX);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("snapshot.jpg");
    std::fs::write(&destination, b"previous").unwrap();

    let err = client(addr, Some(3))
        .capture_and_save("Q2GV-ABCD", "N_1", &destination)
        .unwrap_err();
    assert!(matches!(err, CaptureError::NotReady { attempts: 3 }));
    assert_eq!(std::fs::read(&destination).unwrap(), b"previous");
}

#[test]
fn rejected_job_is_a_request_error() {
    let (addr, _seen) = spawn_camera_api("400 Bad Request", 0);
    let dir = tempfile::tempdir().unwrap();

    let err = client(addr, Some(3))
        .capture_and_save("Q2GV-ABCD", "N_1", &dir.path().join("snapshot.jpg"))
        .unwrap_err();
    match err {
        CaptureError::Request(msg) => assert!(msg.contains("400")),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn unreachable_api_is_a_request_error() {
    let unused = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = client(unused, Some(1))
        .capture_and_save("Q2GV-ABCD", "N_1", &dir.path().join("snapshot.jpg"))
        .unwrap_err();
    assert!(matches!(err, CaptureError::Request(_)));
}

#[test]
fn oversized_image_is_rejected_and_not_saved() {
    let (addr, _seen) = spawn_camera_api("200 OK", 0);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("snapshot.jpg");
    std::fs::write(&destination, b"previous").unwrap();

    let err = client(addr, Some(3))
        .with_max_image_bytes(4)
        .capture_and_save("Q2GV-ABCD", "N_1", &destination)
        .unwrap_err();
    assert!(matches!(err, CaptureError::BadResponse(_)));
    assert_eq!(std::fs::read(&destination).unwrap(), b"previous");
}

#[test]
fn image_exactly_at_the_limit_is_accepted() {
    let (addr, _seen) = spawn_camera_api("200 OK", 0);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("snapshot.jpg");

    let saved = client(addr, Some(3))
        .with_max_image_bytes(IMAGE.len() as u64)
        .capture_and_save("Q2GV-ABCD", "N_1", &destination)
        .unwrap();
    assert_eq!(saved.bytes, IMAGE.len());
}

#[test]
fn shutdown_interrupts_unbounded_polling() {
    let (addr, _seen) = spawn_camera_api("200 OK", usize::MAX);
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(AtomicBool::new(true));

    let err = client(addr, None)
        .with_shutdown(shutdown)
        .capture_and_save("Q2GV-ABCD", "N_1", &dir.path().join("snapshot.jpg"))
        .unwrap_err();
    assert!(matches!(err, CaptureError::Interrupted { attempts: 1 }));
}

fn room() -> RoomBinding {
    RoomBinding {
        sensor_id: "Q2GV-ABCD".to_string(),
        room_name: "101".to_string(),
        call_address: "room101@example.com".to_string(),
    }
}

fn person_message(x1: f64) -> Vec<u8> {
    format!(
        r#"{{"objects": [{{"oid": 1, "type": "person", "x0": 0.1, "y0": 0.1, "x1": {}, "y1": 0.2}}]}}"#,
        x1
    )
    .into_bytes()
}

#[test]
fn trigger_during_shutdown_does_not_wait_for_pending_snapshot() {
    let (addr, _seen) = spawn_camera_api("200 OK", usize::MAX);
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(AtomicBool::new(true));

    let snapshots = client(addr, None).with_shutdown(shutdown.clone());
    let dispatcher = AlertDispatcher::new()
        .with_step(SnapshotStep::new(
            snapshots,
            "N_1",
            dir.path().join("snapshot.jpg"),
        ))
        .with_shutdown(shutdown.clone());
    let gate = CooldownGate::new(dispatcher, room(), Duration::from_secs(30))
        .with_shutdown(shutdown);
    let mut pipeline = Pipeline::new(ObjectTracker::new(0.05), gate, "person");
    pipeline.handle_payload(&person_message(0.20)).unwrap();

    let start = Instant::now();
    let action = pipeline.handle_payload(&person_message(0.27)).unwrap();
    assert_eq!(action, FeedAction::Reconnect);
    assert!(start.elapsed() < Duration::from_secs(3));
}

/// Reads the snapshot the way the popup page does, through the popup server.
struct PageViewer {
    url: String,
    seen: Arc<Mutex<Vec<u8>>>,
}

impl AlertStep for PageViewer {
    fn name(&self) -> &'static str {
        "popup"
    }

    fn run(&self, _binding: &RoomBinding) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        ureq::get(&self.url)
            .call()?
            .into_reader()
            .read_to_end(&mut bytes)?;
        *self.seen.lock().unwrap() = bytes;
        Ok(())
    }
}

#[test]
fn popup_after_snapshot_shows_the_new_image() {
    let (addr, _seen) = spawn_camera_api("200 OK", 2);
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("static/img/snapshot.jpg");
    std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
    std::fs::write(&destination, b"last alert's image").unwrap();

    let popup = PopupServer::new(PopupConfig {
        addr: "127.0.0.1:0".to_string(),
        binding: room(),
        snapshot_path: destination.clone(),
    })
    .spawn()
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = AlertDispatcher::new()
        .with_step(SnapshotStep::new(
            client(addr, Some(10)),
            "N_1",
            destination.clone(),
        ))
        .then_step(PageViewer {
            url: format!("http://{}{}", popup.addr, SNAPSHOT_ROUTE),
            seen: seen.clone(),
        });

    let report = dispatcher.dispatch(&room());
    popup.stop().unwrap();

    assert!(report.all_succeeded());
    assert_eq!(*seen.lock().unwrap(), IMAGE);
}
