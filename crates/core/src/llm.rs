use crate::error::GenerationError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";
pub const DEFAULT_TEMPERATURE: f32 = 0.5;

const STREAM_CAPACITY: usize = 32;
const BACKEND: &str = "chat-completions";

#[derive(Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub api_key: String,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound for one generation, connection and streaming included.
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            api_key: api_key.into(),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("api_key", &"<redacted>")
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Text fragments of one generation, in order.
///
/// Ends when the model finishes. Dropping it stops the producer.
pub struct FragmentStream {
    receiver: mpsc::Receiver<Result<String, GenerationError>>,
}

impl FragmentStream {
    pub fn channel(
        capacity: usize,
    ) -> (mpsc::Sender<Result<String, GenerationError>>, FragmentStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, FragmentStream { receiver })
    }

    pub async fn next(&mut self) -> Option<Result<String, GenerationError>> {
        self.receiver.recv().await
    }

    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Start a fresh generation for `prompt`.
    async fn stream_generate(&self, prompt: &str) -> Result<FragmentStream, GenerationError>;
}

/// Streaming client for an OpenAI-compatible chat-completions API.
pub struct GroqClient {
    client: Client,
    endpoint: Url,
    config: LlmConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl GroqClient {
    pub fn new(config: LlmConfig) -> Result<Self, GenerationError> {
        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        ))?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            config,
        })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    async fn send_once(&self, prompt: &str) -> Result<Response, GenerationError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.config.api_key)
            .header("accept", "text/event-stream")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let details = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::Authentication {
                backend: BACKEND.to_string(),
                details,
            },
            StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited {
                backend: BACKEND.to_string(),
                details,
            },
            _ => GenerationError::Backend {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                details,
            },
        })
    }

    async fn connect(&self, prompt: &str) -> Result<Response, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.send_once(prompt).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts = self.config.max_retries + 1,
                        ?delay,
                        %error,
                        "chat request failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl ChatModel for GroqClient {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn stream_generate(&self, prompt: &str) -> Result<FragmentStream, GenerationError> {
        let limit = self.config.request_timeout;
        let deadline = Instant::now() + limit;
        info!(model = %self.config.model, prompt_chars = prompt.len(), "starting generation");

        let response = timeout_at(deadline, self.connect(prompt))
            .await
            .map_err(|_| GenerationError::Timeout(limit))??;

        let (sender, stream) = FragmentStream::channel(STREAM_CAPACITY);
        tokio::spawn(pump_events(response, sender, deadline, limit));
        Ok(stream)
    }
}

async fn pump_events(
    response: Response,
    sender: mpsc::Sender<Result<String, GenerationError>>,
    deadline: Instant,
    limit: Duration,
) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut finished = false;

    loop {
        let next = match timeout_at(deadline, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = sender.send(Err(GenerationError::Timeout(limit))).await;
                return;
            }
        };

        let (events, body_done) = match next {
            Some(Ok(bytes)) => (decoder.push(&bytes), false),
            Some(Err(error)) => {
                let _ = sender.send(Err(GenerationError::Stream(error.to_string()))).await;
                return;
            }
            None => (decoder.finish(), true),
        };

        for event in events {
            let data = match event {
                SseEvent::Done => return,
                SseEvent::Data(data) => data,
            };

            match decode_chunk(&data) {
                Ok(delta) => {
                    finished |= delta.finished;
                    if let Some(fragment) = delta.content.filter(|text| !text.is_empty()) {
                        if sender.send(Ok(fragment)).await.is_err() {
                            debug!("generation consumer went away, closing stream");
                            return;
                        }
                    }
                }
                Err(error) => {
                    let _ = sender.send(Err(error)).await;
                    return;
                }
            }
        }

        if body_done {
            if !finished {
                let _ = sender
                    .send(Err(GenerationError::Stream(
                        "connection closed before the model finished".to_string(),
                    )))
                    .await;
            }
            return;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Line decoder for `text/event-stream` bodies carrying one JSON object per
/// `data:` line.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else if data.is_empty() {
        None
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

#[derive(Debug, Default, PartialEq)]
struct Delta {
    content: Option<String>,
    finished: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamFailure>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamFailure {
    message: String,
}

fn decode_chunk(data: &str) -> Result<Delta, GenerationError> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(failure) = chunk.error {
        return Err(GenerationError::Stream(failure.message));
    }

    let mut delta = Delta::default();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            delta.content.get_or_insert_with(String::new).push_str(&content);
        }
        delta.finished |= choice.finish_reason.is_some();
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;
    use tokio::net::TcpListener;

    fn sse(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"content": fragment}, "finish_reason": null}],
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str(
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        );
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_string(),
            retry_base_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            ..LlmConfig::new("test-key")
        }
    }

    #[test]
    fn decoder_reassembles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(
            decoder.push(b":1}\r\n\r\n: keep-alive\n"),
            vec![SseEvent::Data("{\"a\":1}".to_string())]
        );
        assert_eq!(decoder.push(b"event: x\ndata: [DONE]\n"), vec![SseEvent::Done]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_flushes_a_trailing_line_without_newline() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![SseEvent::Done]);
    }

    #[test]
    fn chunks_decode_content_and_finish_reason() -> Result<(), GenerationError> {
        let delta = decode_chunk(r#"{"choices":[{"delta":{"content":"Aspirin"},"finish_reason":null}]}"#)?;
        assert_eq!(
            delta,
            Delta {
                content: Some("Aspirin".to_string()),
                finished: false
            }
        );

        let last = decode_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"x_groq":{"usage":{}}}"#)?;
        assert_eq!(
            last,
            Delta {
                content: None,
                finished: true
            }
        );

        let failure = decode_chunk(r#"{"error":{"message":"overloaded"}}"#);
        assert!(matches!(failure, Err(GenerationError::Stream(message)) if message == "overloaded"));
        Ok(())
    }

    #[test]
    fn retry_delay_doubles() {
        let config = LlmConfig {
            retry_base_delay: Duration::from_millis(500),
            ..LlmConfig::new("k")
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let rendered = format!("{:?}", LlmConfig::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn transient_errors_are_classified() {
        let rate = GenerationError::RateLimited {
            backend: BACKEND.to_string(),
            details: String::new(),
        };
        let auth = GenerationError::Authentication {
            backend: BACKEND.to_string(),
            details: String::new(),
        };
        let server = GenerationError::Backend {
            backend: BACKEND.to_string(),
            status: 502,
            details: String::new(),
        };
        let client = GenerationError::Backend {
            backend: BACKEND.to_string(),
            status: 400,
            details: String::new(),
        };
        assert!(rate.is_transient());
        assert!(server.is_transient());
        assert!(!auth.is_transient());
        assert!(!client.is_transient());
    }

    #[tokio::test]
    async fn streams_fragments_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let server = serve_once(vec![(
            200,
            "text/event-stream",
            sse(&["Aspirin ", "thins the ", "blood."]),
        )])
        .await?;
        let client = GroqClient::new(config(&server.base_url))?;

        let mut stream = client.stream_generate("What does aspirin do?").await?;
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment?);
        }

        assert_eq!(fragments, vec!["Aspirin ", "thins the ", "blood."]);
        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("POST /chat/completions"));
        assert!(requests[0].to_lowercase().contains("authorization: bearer test-key"));
        assert!(requests[0].contains(r#""stream":true"#));
        assert!(requests[0].contains(r#""temperature":0.5"#));
        assert!(requests[0].contains(DEFAULT_LLM_MODEL));
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_is_retried() -> Result<(), Box<dyn std::error::Error>> {
        let server = serve_once(vec![
            (429, "application/json", r#"{"error":{"message":"slow down"}}"#.to_string()),
            (200, "text/event-stream", sse(&["ok"])),
        ])
        .await?;
        let client = GroqClient::new(config(&server.base_url))?;

        let answer = client.stream_generate("q").await?.collect_text().await?;

        assert_eq!(answer, "ok");
        assert_eq!(server.requests().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() -> Result<(), Box<dyn std::error::Error>> {
        let server = serve_once(vec![
            (401, "application/json", r#"{"error":{"message":"bad key"}}"#.to_string()),
            (200, "text/event-stream", sse(&["unreachable"])),
        ])
        .await?;
        let client = GroqClient::new(config(&server.base_url))?;

        let result = client.stream_generate("q").await;

        assert!(matches!(result, Err(GenerationError::Authentication { .. })));
        assert_eq!(server.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retries_give_up_after_the_limit() -> Result<(), Box<dyn std::error::Error>> {
        let server = serve_once(vec![
            (500, "text/plain", "boom".to_string()),
            (500, "text/plain", "boom".to_string()),
        ])
        .await?;
        let client = GroqClient::new(LlmConfig {
            max_retries: 1,
            ..config(&server.base_url)
        })?;

        let result = client.stream_generate("q").await;

        assert!(matches!(result, Err(GenerationError::Backend { status: 500, .. })));
        assert_eq!(server.requests().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn stream_without_completion_reports_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n".to_string();
        let server = serve_once(vec![(200, "text/event-stream", body)]).await?;
        let client = GroqClient::new(config(&server.base_url))?;

        let mut stream = client.stream_generate("q").await?;

        assert_eq!(stream.next().await.transpose()?, Some("partial".to_string()));
        assert!(matches!(stream.next().await, Some(Err(GenerationError::Stream(_)))));
        assert!(stream.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn silent_server_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(10)).await;
                drop(socket);
            }
        });
        let client = GroqClient::new(LlmConfig {
            request_timeout: Duration::from_millis(100),
            ..config(&format!("http://{addr}"))
        })?;

        let result = client.stream_generate("q").await;

        assert!(matches!(result, Err(GenerationError::Timeout(_))));
        Ok(())
    }
}
