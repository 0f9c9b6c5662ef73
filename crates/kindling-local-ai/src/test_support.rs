//! Helpers shared by the unit tests: mock binaries and a canned HTTP server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Write an executable `/bin/sh` script named like the real server binary.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(crate::paths::SERVER_BINARY_NAME);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A port nothing is listening on right now.
pub(crate) fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// A request as seen by the fake server.
#[derive(Debug, Clone)]
pub(crate) struct FakeRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl FakeRequest {
    pub fn is_streaming(&self) -> bool {
        self.body.replace(' ', "").contains("\"stream\":true")
    }
}

/// A canned answer.
#[derive(Debug, Clone)]
pub(crate) enum FakeResponse {
    Status { code: u16, body: String },
    Json { code: u16, body: serde_json::Value },
    /// Raw SSE events, each written as its own chunk.
    Sse(Vec<String>),
}

impl FakeResponse {
    pub fn status(code: u16, body: &str) -> Self {
        FakeResponse::Status {
            code,
            body: body.to_string(),
        }
    }

    pub fn json(code: u16, body: serde_json::Value) -> Self {
        FakeResponse::Json { code, body }
    }

    pub fn sse(events: Vec<String>) -> Self {
        FakeResponse::Sse(events)
    }
}

type Router = Arc<dyn Fn(&FakeRequest) -> FakeResponse + Send + Sync>;

/// Minimal HTTP/1.1 server answering every request through a router.
pub(crate) struct FakeLlamaServer {
    port: u16,
    requests: Arc<Mutex<Vec<FakeRequest>>>,
    accept_loop: JoinHandle<()>,
}

impl FakeLlamaServer {
    /// Answer every request with `response`.
    pub async fn start(response: FakeResponse) -> Self {
        Self::start_with(move |_| response.clone()).await
    }

    /// Answer through `router` on an ephemeral port.
    pub async fn start_with<F>(router: F) -> Self
    where
        F: Fn(&FakeRequest) -> FakeResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        Self::serve(listener, Arc::new(router))
    }

    /// Answer through `router` on a fixed port.
    pub async fn start_on<F>(port: u16, router: F) -> Self
    where
        F: Fn(&FakeRequest) -> FakeResponse + Send + Sync + 'static,
    {
        let mut attempts = 0;
        let listener = loop {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => break listener,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("cannot bind fake server on {}: {}", port, e),
            }
        };
        Self::serve(listener, Arc::new(router))
    }

    /// Behaves like a llama-server that has `models` loaded and answers the
    /// first `loading_canaries` non-streaming completions with 503.
    pub async fn llama_on(port: u16, models: &[&str], loading_canaries: usize) -> Self {
        Self::start_on(port, llama_router(models, loading_canaries)).await
    }

    pub async fn llama(models: &[&str], loading_canaries: usize) -> Self {
        Self::start_with(llama_router(models, loading_canaries)).await
    }

    fn serve(listener: TcpListener, router: Router) -> Self {
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let router = router.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, router, log).await;
                });
            }
        });
        Self {
            port,
            requests,
            accept_loop,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Paths of the requests received so far.
    pub fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }
}

impl Drop for FakeLlamaServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn llama_router(
    models: &[&str],
    loading_canaries: usize,
) -> impl Fn(&FakeRequest) -> FakeResponse + Send + Sync + 'static {
    let data: Vec<serde_json::Value> = models
        .iter()
        .map(|id| serde_json::json!({"id": id, "object": "model"}))
        .collect();
    let canaries = AtomicUsize::new(0);
    move |request| match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/v1/models") => FakeResponse::json(
            200,
            serde_json::json!({"object": "list", "data": data.clone()}),
        ),
        ("POST", "/v1/chat/completions") if request.is_streaming() => FakeResponse::sse(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"<think>x</think>Hi\"}}]}\n\n"
                .to_string(),
            "data: [DONE]\n\n".to_string(),
        ]),
        ("POST", "/v1/chat/completions") => {
            if canaries.fetch_add(1, Ordering::SeqCst) < loading_canaries {
                FakeResponse::json(
                    503,
                    serde_json::json!({"error": {"code": 503, "message": "Loading model"}}),
                )
            } else {
                FakeResponse::json(
                    200,
                    serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]}),
                )
            }
        }
        _ => FakeResponse::status(404, "not found"),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    router: Router,
    log: Arc<Mutex<Vec<FakeRequest>>>,
) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;
    log.lock().unwrap().push(request.clone());

    match router(&request) {
        FakeResponse::Status { code, body } => {
            write_response(&mut stream, code, "text/plain", &body).await?;
        }
        FakeResponse::Json { code, body } => {
            write_response(&mut stream, code, "application/json", &body.to_string()).await?;
        }
        FakeResponse::Sse(events) => {
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                )
                .await?;
            for event in events {
                stream.write_all(event.as_bytes()).await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
    stream.shutdown().await
}

async fn write_response(
    stream: &mut TcpStream,
    code: u16,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} Fake\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<FakeRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).into_owned();

    Ok(FakeRequest { method, path, body })
}
