//! The hphls setting against a local stand-in for the management API that
//! applies updates only after a few reads, like the real server does.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use streamcheck::api::types::paths;
use streamcheck::cases::hphls::apply_hls_ctx;
use streamcheck::cases::Harness;
use streamcheck::config::HarnessConfig;
use streamcheck::{HarnessError, RunContext};

#[derive(Default)]
struct Settings {
    no_hls_ctx: bool,
    /// Value written by the last update and the reads left before it shows.
    pending: Option<(bool, u32)>,
    lag: u32,
    updates: Vec<bool>,
}

impl Settings {
    fn query(&mut self) -> bool {
        if let Some((value, left)) = self.pending {
            if left == 0 {
                self.no_hls_ctx = value;
                self.pending = None;
            } else {
                self.pending = Some((value, left - 1));
            }
        }
        self.no_hls_ctx
    }

    fn update(&mut self, value: bool) {
        self.updates.push(value);
        self.pending = Some((value, self.lag));
    }
}

async fn serve(settings: Arc<Mutex<Settings>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle(stream, Arc::clone(&settings)));
        }
    });
    addr
}

async fn handle(mut stream: TcpStream, settings: Arc<Mutex<Settings>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body: Value = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);

    let reply = {
        let mut settings = settings.lock().unwrap();
        if path == paths::HPHLS_QUERY {
            json!({"code": 0, "data": {"noHlsCtx": settings.query()}})
        } else if path == paths::HPHLS_UPDATE {
            settings.update(body["noHlsCtx"].as_bool().unwrap_or(false));
            json!({"code": 0, "data": null})
        } else {
            json!({"code": 404})
        }
    }
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.len(),
        reply
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn harness(addr: SocketAddr, attempts: u32) -> Harness {
    let mut config = HarnessConfig::default();
    config.endpoints.api = format!("http://{}", addr);
    config.suite.settle_attempts = attempts;
    config.suite.settle_interval_ms = 10;
    Harness::new(config).unwrap()
}

#[tokio::test]
async fn test_flag_is_polled_until_applied_then_restored() {
    let settings = Arc::new(Mutex::new(Settings {
        lag: 3,
        ..Default::default()
    }));
    let addr = serve(Arc::clone(&settings)).await;
    let harness = harness(addr, 10);
    let ctx = RunContext::background().with_timeout(Duration::from_secs(10));

    let restore = apply_hls_ctx(&harness, &ctx, true).await.unwrap();
    assert!(settings.lock().unwrap().no_hls_ctx);

    restore.run().await.unwrap();
    let settings = settings.lock().unwrap();
    assert_eq!(settings.updates, vec![true, false]);
    assert_eq!(settings.pending, Some((false, 3)));
}

#[tokio::test]
async fn test_flag_that_never_applies_fails_and_restores() {
    let settings = Arc::new(Mutex::new(Settings {
        lag: 100,
        ..Default::default()
    }));
    let addr = serve(Arc::clone(&settings)).await;
    let harness = harness(addr, 3);
    let ctx = RunContext::background().with_timeout(Duration::from_secs(10));

    let err = apply_hls_ctx(&harness, &ctx, true).await.unwrap_err();
    assert!(matches!(err, HarnessError::Assertion(_)), "got {:?}", err);
    assert!(err.to_string().starts_with("invalid response"));

    // The dropped guard puts the original value back in the background.
    for _ in 0..100 {
        if settings.lock().unwrap().updates.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(settings.lock().unwrap().updates, vec![true, false]);
}
