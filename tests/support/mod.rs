//! Shared mock-server helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-looking payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}

/// Failure key for requests without a `Range` header.
const FULL_BODY: (u64, u64) = (u64::MAX, u64::MAX);

/// Parses `bytes=start-end` into an inclusive pair.
fn parse_range(header: &str) -> Option<(u64, u64)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Serves a fixed body, honouring `Range` headers (or not) and failing chosen
/// ranges a given number of times.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    honour_ranges: bool,
    failures: Arc<Mutex<HashMap<(u64, u64), usize>>>,
    fail_status: u16,
    retry_after: Option<String>,
    ranges_seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            honour_ranges: true,
            failures: Arc::new(Mutex::new(HashMap::new())),
            fail_status: 500,
            retry_after: None,
            ranges_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ignore `Range` and always answer 200 with the whole body.
    pub fn without_ranges(mut self) -> Self {
        self.honour_ranges = false;
        self
    }

    /// Fail requests for exactly `[start, end]` the next `times` times.
    pub fn fail_range(self, start: u64, end: u64, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((start, end), times);
        self
    }

    /// Fail requests without a `Range` header the next `times` times.
    pub fn fail_full(self, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(FULL_BODY, times);
        self
    }

    /// Status used for injected failures.
    pub fn fail_status(mut self, status: u16) -> Self {
        self.fail_status = status;
        self
    }

    /// `Retry-After` value sent with injected failures.
    pub fn retry_after(mut self, value: &str) -> Self {
        self.retry_after = Some(value.to_string());
        self
    }

    /// Every `Range` header received on GET, in arrival order.
    pub fn ranges_seen(&self) -> Vec<Option<String>> {
        self.ranges_seen.lock().unwrap().clone()
    }

    /// Number of GETs for exactly `[start, end]`.
    pub fn hits_for(&self, start: u64, end: u64) -> usize {
        let wanted = format!("bytes={start}-{end}");
        self.ranges_seen()
            .iter()
            .filter(|r| r.as_deref() == Some(wanted.as_str()))
            .count()
    }

    /// Mounts HEAD and GET handlers for `route` on `server`.
    pub async fn mount(&self, server: &MockServer, route: &str) {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", self.body.len().to_string().as_str()),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn take_failure(&self, key: (u64, u64)) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        self.ranges_seen.lock().unwrap().push(range.clone());

        let parsed = range.as_deref().and_then(parse_range);
        if self.take_failure(parsed.unwrap_or(FULL_BODY)) {
            let failure = ResponseTemplate::new(self.fail_status);
            return match &self.retry_after {
                Some(value) => failure.insert_header("Retry-After", value.as_str()),
                None => failure,
            };
        }

        let Some((start, end)) = parsed else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.as_slice());
        };

        if !self.honour_ranges {
            return ResponseTemplate::new(200).set_body_bytes(self.body.as_slice());
        }

        let total = self.body.len() as u64;
        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}").as_str());
        }
        let end = end.min(total - 1);
        let slice = &self.body[usize::try_from(start).unwrap()..=usize::try_from(end).unwrap()];
        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{total}").as_str(),
            )
            .set_body_bytes(slice)
    }
}

/// Starts a server serving `responder` at `/file` and returns it with the URL.
pub async fn serve(responder: &RangeResponder) -> (MockServer, String) {
    let server = MockServer::start().await;
    responder.mount(&server, "/file").await;
    let url = format!("{}/file", server.uri());
    (server, url)
}

/// Serves `body` over raw HTTP/1.1, one byte every `interval`.
///
/// `Range` is ignored, so transfers fall back to a single stream. With
/// `stall_after`, the body goes silent once that many bytes were sent.
pub async fn serve_trickle(body: Vec<u8>, interval: Duration, stall_after: Option<usize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let _ = trickle(socket, &body, interval, stall_after).await;
            });
        }
    });
    format!("http://{addr}/trickle")
}

async fn trickle(
    socket: TcpStream,
    body: &[u8],
    interval: Duration,
    stall_after: Option<usize>,
) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
    }

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    write.write_all(head.as_bytes()).await?;
    write.flush().await?;
    if request_line.starts_with("HEAD") {
        return Ok(());
    }

    for (sent, byte) in body.iter().enumerate() {
        if stall_after == Some(sent) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(interval).await;
        write.write_all(std::slice::from_ref(byte)).await?;
        write.flush().await?;
    }
    Ok(())
}
