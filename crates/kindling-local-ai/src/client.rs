//! HTTP client for llama-server's OpenAI-compatible API.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LocalAIError;
use crate::think_filter::{strip_think_blocks, ThinkTagFilter};
use crate::DEFAULT_PORT;

/// Timeout for the short probe requests (`/v1/models`, canary).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout shared by every request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest silence tolerated between two chunks of a streaming response.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Whole-request timeout for non-streaming completions.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for communicating with llama-server.
#[derive(Clone)]
pub struct LlamaCppClient {
    client: reqwest::Client,
    base_url: String,
}

/// Chat message in OpenAI format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// OpenAI-compatible chat completion request.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One `data:` payload of a streaming response.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl LlamaCppClient {
    /// Create a new client with default URL (localhost:11435).
    pub fn new() -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", DEFAULT_PORT))
    }

    /// Create a new client with a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a new client with a custom port on localhost.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", port))
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Identifiers of the models the server reports via `/v1/models`.
    pub async fn list_models(&self) -> Result<Vec<String>, LocalAIError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(LocalAIError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LocalAIError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(LocalAIError::from_transport)?;
        let list: ModelList = serde_json::from_str(&body)
            .map_err(|e| LocalAIError::InvalidResponse(format!("model list: {}", e)))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Send a one-token completion and return the HTTP status.
    ///
    /// llama-server answers 503 while the model is still loading even though
    /// `/v1/models` may already list it.
    pub async fn canary(&self) -> Result<u16, LocalAIError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let messages = [ChatMessage::user("hi")];
        let request = ChatCompletionRequest {
            messages: &messages,
            max_tokens: Some(1),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(LocalAIError::from_transport)?;
        Ok(response.status().as_u16())
    }

    /// Stream a chat completion.
    ///
    /// Visible text is handed to `on_partial` in arrival order with reasoning
    /// blocks removed. Returns the accumulated visible response.
    pub async fn stream_chat<F>(
        &self,
        messages: &[ChatMessage],
        mut on_partial: F,
    ) -> Result<String, LocalAIError>
    where
        F: FnMut(&str) + Send,
    {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            messages,
            max_tokens: None,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(LocalAIError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LocalAIError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut session = StreamingChatSession::new();
        let mut decoder = SseLineDecoder::new();
        let mut stream = response.bytes_stream();

        'read: loop {
            let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(LocalAIError::RequestFailed(e.to_string())),
                Ok(None) => break,
                Err(_) => {
                    return Err(LocalAIError::RequestFailed(format!(
                        "no data for {}s",
                        STREAM_IDLE_TIMEOUT.as_secs()
                    )))
                }
            };

            for line in decoder.push(&chunk) {
                if session.handle_line(&line, &mut on_partial)? == LineOutcome::Done {
                    break 'read;
                }
            }
        }

        if let Some(line) = decoder.finish() {
            session.handle_line(&line, &mut on_partial)?;
        }
        session.finish(&mut on_partial)
    }

    /// Non-streaming completion with reasoning blocks removed.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LocalAIError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            messages,
            max_tokens: None,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(COMPLETION_TIMEOUT)
            .send()
            .await
            .map_err(LocalAIError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LocalAIError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(LocalAIError::from_transport)?;
        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| LocalAIError::InvalidResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| strip_think_blocks(&content))
            .ok_or(LocalAIError::NoData)
    }
}

impl Default for LlamaCppClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Continue,
    Done,
}

/// Per-request state of one streaming completion.
struct StreamingChatSession {
    full_response: String,
    filter: ThinkTagFilter,
    data_events: usize,
}

impl StreamingChatSession {
    fn new() -> Self {
        Self {
            full_response: String::new(),
            filter: ThinkTagFilter::new(),
            data_events: 0,
        }
    }

    fn handle_line<F: FnMut(&str)>(
        &mut self,
        line: &str,
        on_partial: &mut F,
    ) -> Result<LineOutcome, LocalAIError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(LineOutcome::Continue);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(LineOutcome::Continue);
        }
        if data == "[DONE]" {
            return Ok(LineOutcome::Done);
        }

        let chunk: ChatChunk = serde_json::from_str(data).map_err(|e| {
            warn!("Unparseable stream event: {}", data);
            LocalAIError::InvalidResponse(e.to_string())
        })?;
        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(LocalAIError::RequestFailed(message));
        }

        self.data_events += 1;
        let content = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content);
        if let Some(content) = content {
            let visible = self.filter.push(&content);
            self.emit(&visible, on_partial);
        }
        Ok(LineOutcome::Continue)
    }

    fn emit<F: FnMut(&str)>(&mut self, visible: &str, on_partial: &mut F) {
        if !visible.is_empty() {
            on_partial(visible);
            self.full_response.push_str(visible);
        }
    }

    fn finish<F: FnMut(&str)>(mut self, on_partial: &mut F) -> Result<String, LocalAIError> {
        if self.data_events == 0 {
            return Err(LocalAIError::NoData);
        }
        let tail = self.filter.finish();
        self.emit(&tail, on_partial);
        debug!(
            "Stream finished: {} events, {} chars",
            self.data_events,
            self.full_response.len()
        );
        Ok(self.full_response)
    }
}

/// Splits a byte stream into text lines.
///
/// Lines are cut on raw `\n` bytes before decoding, so a multi-byte UTF-8
/// character split across two network chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// The unterminated last line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeLlamaServer, FakeResponse};

    #[test]
    fn test_default_url() {
        let client = LlamaCppClient::new();
        assert_eq!(client.base_url(), "http://127.0.0.1:11435");
    }

    #[test]
    fn test_custom_url() {
        let client = LlamaCppClient::with_url("http://192.168.1.100:8080/");
        assert_eq!(client.base_url(), "http://192.168.1.100:8080");
    }

    #[test]
    fn test_custom_port() {
        let client = LlamaCppClient::with_port(9000);
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_decoder_joins_split_utf8() {
        let text = "data: héllo\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte 'é'.
        let split = text.find('é').unwrap() + 1;
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec!["data: héllo"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_handles_crlf_and_tail() {
        let mut decoder = SseLineDecoder::new();
        let lines = decoder.push(b"data: a\r\n\r\ndata: b");
        assert_eq!(lines, vec!["data: a", ""]);
        assert_eq!(decoder.finish().as_deref(), Some("data: b"));
    }

    fn sse(deltas: &[&str]) -> Vec<String> {
        let mut events: Vec<String> = deltas
            .iter()
            .map(|d| {
                let chunk = serde_json::json!({"choices": [{"delta": {"content": d}}]});
                format!("data: {}\n\n", chunk)
            })
            .collect();
        events.push("data: [DONE]\n\n".to_string());
        events
    }

    #[tokio::test]
    async fn test_stream_chat_filters_think_blocks_across_chunks() {
        let server = FakeLlamaServer::start(FakeResponse::sse(sse(&[
            "Hello <thi",
            "nk>secret</think>",
            " world",
        ])))
        .await;
        let client = LlamaCppClient::with_url(server.base_url());

        let mut partials = Vec::new();
        let full = client
            .stream_chat(&[ChatMessage::user("hi")], |p| partials.push(p.to_string()))
            .await
            .unwrap();

        assert_eq!(full, "Hello  world");
        assert_eq!(partials.concat(), full);
        assert!(partials.iter().all(|p| !p.contains("secret")));
    }

    #[tokio::test]
    async fn test_stream_chat_ignores_comments_and_stops_at_done() {
        let mut events = vec![": keep-alive\n\n".to_string(), "event: ping\n\n".to_string()];
        events.extend(sse(&["one", " two"]));
        events.extend(sse(&["never seen"]));
        let server = FakeLlamaServer::start(FakeResponse::sse(events)).await;
        let client = LlamaCppClient::with_url(server.base_url());

        let full = client
            .stream_chat(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap();
        assert_eq!(full, "one two");
    }

    #[tokio::test]
    async fn test_stream_without_events_is_no_data() {
        let server = FakeLlamaServer::start(FakeResponse::sse(vec![])).await;
        let client = LlamaCppClient::with_url(server.base_url());
        let err = client
            .stream_chat(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAIError::NoData));
    }

    #[tokio::test]
    async fn test_http_error_carries_status_and_body() {
        let server = FakeLlamaServer::start(FakeResponse::status(500, "boom")).await;
        let client = LlamaCppClient::with_url(server.base_url());
        let err = client
            .stream_chat(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap_err();
        match err {
            LocalAIError::HttpStatus { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_event_is_invalid_response() {
        let server =
            FakeLlamaServer::start(FakeResponse::sse(vec!["data: {not json\n\n".to_string()]))
                .await;
        let client = LlamaCppClient::with_url(server.base_url());
        let err = client
            .stream_chat(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAIError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_request_failed() {
        let port = crate::test_support::unused_port();
        let client = LlamaCppClient::with_port(port);
        let err = client
            .stream_chat(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAIError::RequestFailed(_)));
    }

    #[tokio::test]
    async fn test_complete_strips_reasoning() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "<think>hmm</think>42"}}]
        });
        let server = FakeLlamaServer::start(FakeResponse::json(200, body)).await;
        let client = LlamaCppClient::with_url(server.base_url());
        let answer = client.complete(&[ChatMessage::user("6*7?")]).await.unwrap();
        assert_eq!(answer, "42");
    }

    #[tokio::test]
    async fn test_list_models() {
        let body = serde_json::json!({"object": "list", "data": [{"id": "qwen-7b"}]});
        let server = FakeLlamaServer::start(FakeResponse::json(200, body)).await;
        let client = LlamaCppClient::with_url(server.base_url());
        assert_eq!(client.list_models().await.unwrap(), vec!["qwen-7b"]);
    }
}
