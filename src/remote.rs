//! Client for an OpenAI-compatible `/v1/chat/completions` server (for example
//! llama.cpp's `server`).

mod transport;
mod wire;

pub use transport::{HttpReply, HttpTransport, UreqTransport};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{RemoteConfig, RemoteDispatch};
use crate::prompting::{chat_messages, PromptRequest};

use self::wire::{ChatCompletionRequest, ChatCompletionResponse};

const CONNECTION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed after {attempts} attempts, last status {status}: {body}")]
    RetriesExhausted {
        attempts: u32,
        status: u16,
        body: String,
    },

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    #[error(
        "cannot connect to completion server at {0}. Please ensure the server is running, e.g. ./server -m /path/to/model.gguf -c 4096 --host 0.0.0.0 --port 8080"
    )]
    Unreachable(String),
}

/// Rate limiting and transient unavailability.
pub fn is_retryable(status: u16) -> bool {
    matches!(status, 429 | 503 | 504)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `base_delay * n`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub struct RemoteCompletionClient {
    base_url: String,
    timeout: Duration,
    temperature: f32,
    retry: RetryPolicy,
    dispatch: RemoteDispatch,
    transport: Box<dyn HttpTransport>,
    sleep: Sleeper,
}

impl RemoteCompletionClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self::with_transport(config, Box::new(UreqTransport), Arc::new(thread::sleep))
    }

    pub fn with_transport(
        config: &RemoteConfig,
        transport: Box<dyn HttpTransport>,
        sleep: Sleeper,
    ) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            temperature: config.temperature,
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base_delay: Duration::from_millis(config.base_delay_ms),
            },
            dispatch: config.dispatch,
            transport,
            sleep,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn test_connection(&self) -> Result<(), RemoteError> {
        let url = format!("{}/v1/models", self.base_url);
        match self.transport.get(&url, CONNECTION_CHECK_TIMEOUT) {
            Ok(reply) if reply.status == 200 => Ok(()),
            Ok(reply) => {
                debug!(status = reply.status, "connection check rejected");
                Err(RemoteError::Unreachable(self.base_url.clone()))
            }
            Err(e) => {
                debug!(error = %e, "connection check failed");
                Err(RemoteError::Unreachable(self.base_url.clone()))
            }
        }
    }

    pub(crate) fn request_body(
        &self,
        request: &PromptRequest,
        model: &str,
        max_tokens: usize,
    ) -> serde_json::Value {
        let body = ChatCompletionRequest {
            model,
            messages: chat_messages(request),
            max_tokens,
            temperature: self.temperature,
            stream: false,
        };
        // Plain strings and numbers; serialization cannot fail.
        serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
    }

    pub fn complete_one(
        &self,
        request: &PromptRequest,
        model: &str,
        max_tokens: usize,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.request_body(request, model, max_tokens);

        let mut attempt = 1;
        loop {
            let reply = self.transport.post_json(&url, &body, self.timeout)?;

            if reply.status == 200 {
                let parsed: ChatCompletionResponse = serde_json::from_str(&reply.body)
                    .map_err(|e| RemoteError::MalformedResponse(e.to_string()))?;
                return parsed.into_text().ok_or_else(|| {
                    RemoteError::MalformedResponse("no choices[0].message.content".to_string())
                });
            }

            if !is_retryable(reply.status) {
                return Err(RemoteError::Status {
                    status: reply.status,
                    body: reply.body,
                });
            }

            if attempt >= self.retry.max_attempts {
                return Err(RemoteError::RetriesExhausted {
                    attempts: self.retry.max_attempts,
                    status: reply.status,
                    body: reply.body,
                });
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                agent = %request.name,
                status = reply.status,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "transient server response, retrying"
            );
            (self.sleep)(delay);
            attempt += 1;
        }
    }

    /// One outcome per request, in request order.
    pub fn complete_batch(
        &self,
        requests: &[PromptRequest],
        model: &str,
        max_tokens: usize,
    ) -> Vec<Result<String, RemoteError>> {
        match self.dispatch {
            RemoteDispatch::Sequential => requests
                .iter()
                .map(|r| self.complete_one(r, model, max_tokens))
                .collect(),
            RemoteDispatch::Concurrent => thread::scope(|scope| {
                let handles: Vec<_> = requests
                    .iter()
                    .map(|r| scope.spawn(move || self.complete_one(r, model, max_tokens)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().unwrap_or_else(|_| {
                            Err(RemoteError::Transport("request thread panicked".to_string()))
                        })
                    })
                    .collect()
            }),
        }
    }
}
