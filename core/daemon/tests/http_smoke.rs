use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use posture_daemon_protocol::{
    AnalyzeResponse, ErrorBody, PostureStatus, ReportsResponse, SessionSummary,
};
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_addr() -> Option<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").ok()?;
    listener.local_addr().ok()
}

fn spawn_daemon(home: &Path, addr: SocketAddr, config: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_posture-daemon"))
        .env("HOME", home)
        .arg("--config")
        .arg(config)
        .arg("--bind")
        .arg(addr.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn posture-daemon")
}

fn wait_for_listener(addr: SocketAddr, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon at {}", addr);
}

fn send(addr: SocketAddr, method: &str, path: &str, user_id: Option<&str>, body: &[u8]) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("Failed to connect to daemon");
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    if let Some(user_id) = user_id {
        head.push_str(&format!("User-ID: {}\r\n", user_id));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).expect("write head");
    stream.write_all(body).expect("write body");
    stream.flush().ok();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .expect("status code");
    (status, raw[split + 4..].to_vec())
}

fn centered_frame() -> Vec<u8> {
    let mut frame = RgbImage::new(640, 480);
    for y in 160..320 {
        for x in 280..360 {
            frame.put_pixel(x, y, Rgb([224, 172, 140]));
        }
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(frame)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode frame");
    bytes
}

#[test]
fn daemon_http_analyze_summary_and_reports_smoke() {
    let Some(addr) = free_addr() else {
        eprintln!("Skipping daemon_http smoke test: cannot bind loopback");
        return;
    };
    let home = TempDir::new().expect("Failed to create temp HOME");
    let config_path = home.path().join("daemon.toml");
    std::fs::write(
        &config_path,
        format!(
            "[tracking]\nflush_interval_secs = 2\n\n[store]\ndb_path = \"{}\"\n",
            home.path().join("reports.db").display()
        ),
    )
    .expect("write config");

    let child = spawn_daemon(home.path(), addr, &config_path);
    let _guard = DaemonGuard { child };
    wait_for_listener(addr, Duration::from_secs(5));

    let (status, body) = send(addr, "GET", "/session_summary", None, b"");
    assert_eq!(status, 400);
    let error: ErrorBody = serde_json::from_slice(&body).expect("error body");
    assert_eq!(error.error, "Missing User-ID");

    let (status, body) = send(addr, "GET", "/session_summary", Some("fresh"), b"");
    assert_eq!(status, 200);
    let summary: SessionSummary = serde_json::from_slice(&body).expect("summary body");
    assert_eq!(summary, SessionSummary::default());

    let (status, body) = send(addr, "POST", "/analyze", Some("u1"), b"not an image");
    assert_eq!(status, 500);
    let error: ErrorBody = serde_json::from_slice(&body).expect("error body");
    assert!(!error.error.is_empty());

    let frame = centered_frame();
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut persisted = None;
    while Instant::now() < deadline {
        let (status, body) = send(addr, "POST", "/analyze", Some("u1"), &frame);
        assert_eq!(status, 200);
        let analysis: AnalyzeResponse = serde_json::from_slice(&body).expect("analyze body");
        assert_eq!(analysis.status(), Some(PostureStatus::Good));
        assert!(!analysis.alarm);

        let (status, body) = send(addr, "GET", "/reports", Some("u1"), b"");
        assert_eq!(status, 200);
        let reports: ReportsResponse = serde_json::from_slice(&body).expect("reports body");
        if let Some(report) = reports.reports.into_iter().find(|report| report.good > 0.0) {
            persisted = Some(report);
            break;
        }
        sleep(Duration::from_millis(300));
    }

    let report = persisted.expect("flush persisted good-posture time");
    assert_eq!(report.bad, 0.0);
    assert_eq!(report.alarms, 0);

    let (status, _) = send(addr, "GET", "/health", None, b"");
    assert_eq!(status, 200);
}
