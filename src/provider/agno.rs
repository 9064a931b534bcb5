//! Agno agent server client.
//!
//! Runs are form-encoded POSTs to `{base}/{agents|teams|workflows}/{id}/runs`.
//! With `stream=true` the server answers with server-sent events:
//! `RunStarted`, `RunResponse` (content delta), `RunCompleted` (full
//! content), and `RunError`/`RunFailed`.

use crate::error::ProviderError;
use crate::provider::traits::{AgentClient, DeltaSink, ProviderReply, ProviderRequest};
use crate::storage::AgentProvider;
use futures::StreamExt as _;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AgnoClient {
    http: reqwest::Client,
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    /// Used when the instance does not name an agent.
    default_agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl AgnoClient {
    pub fn new(http: reqwest::Client, provider: &AgentProvider) -> Self {
        let default_agent_id = ["agentId", "agent_id"]
            .iter()
            .find_map(|key| provider.schema_config.get(key))
            .and_then(|value| value.as_str())
            .map(str::to_string);

        Self {
            http,
            provider_id: provider.id.to_string(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key: provider.api_key.clone(),
            default_agent_id,
        }
    }

    fn runs_url(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        let agent_id = request
            .agent_id
            .as_deref()
            .or(self.default_agent_id.as_deref())
            .ok_or_else(|| {
                ProviderError::Unavailable(format!("provider {} has no agent id configured", self.provider_id))
            })?;
        Ok(format!(
            "{}/{}/{}/runs",
            self.base_url,
            request.agent_type.endpoint(),
            agent_id
        ))
    }

    async fn post_run(&self, request: &ProviderRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = self.runs_url(request)?;
        let form = [
            ("message", request.text.as_str()),
            ("stream", if stream { "true" } else { "false" }),
            ("session_id", request.session_id.as_str()),
            ("user_id", request.sender_id.as_str()),
        ];

        let mut builder = self.http.post(&url).timeout(request.timeout).form(&form);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| self.map_http(error, request))?;

        let status = response.status();
        if !status.is_success() {
            let context = format!("running {url}");
            let message = match status.as_u16() {
                401 => format!("authentication failed: {context}"),
                404 => format!("not found: {context}"),
                429 => format!("rate limited: {context}"),
                code if code >= 500 => format!("server error: {context}"),
                _ => format!("request failed: {context}"),
            };
            return Err(ProviderError::Request {
                status: Some(status.as_u16()),
                message,
            });
        }
        Ok(response)
    }

    fn map_http(&self, error: reqwest::Error, request: &ProviderRequest) -> ProviderError {
        ProviderError::from_http(error, &self.provider_id, request.timeout_ms())
    }
}

impl AgentClient for AgnoClient {
    async fn run(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let response = self.post_run(request, false).await?;
        let run: RunResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;

        if run.status.as_deref().is_some_and(|status| status.eq_ignore_ascii_case("failed")) {
            return Err(ProviderError::Request {
                status: None,
                message: format!("agent run {} failed", run.run_id.as_deref().unwrap_or("?")),
            });
        }

        Ok(ProviderReply {
            run_id: run.run_id,
            session_id: run.session_id,
            ..ProviderReply::from_content(run.content)
        })
    }

    async fn run_streaming(&self, request: &ProviderRequest, sink: DeltaSink) -> Result<ProviderReply, ProviderError> {
        let response = self.post_run(request, true).await?;
        let mut body = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut streamed = String::new();
        let mut run_id = None;
        let mut session_id = None;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|error| {
                if error.is_timeout() {
                    self.map_http(error, request)
                } else {
                    ProviderError::Stream(error.to_string())
                }
            })?;
            for event in parser.push(&chunk) {
                let payload: StreamPayload = match serde_json::from_str(&event.data) {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::debug!(%error, event = %event.name, "skipping malformed stream event");
                        continue;
                    }
                };

                match event.name.as_str() {
                    "RunStarted" => {
                        run_id = payload.run_id.or(run_id);
                        session_id = payload.session_id.or(session_id);
                    }
                    "RunResponse" => {
                        if let Some(delta) = payload.content.filter(|delta| !delta.is_empty()) {
                            streamed.push_str(&delta);
                            // A closed sink only stops forwarding; the run still completes.
                            let _ = sink.send(delta).await;
                        }
                    }
                    "RunCompleted" => {
                        let content = payload.content.filter(|content| !content.is_empty()).unwrap_or(streamed);
                        return Ok(ProviderReply {
                            run_id: payload.run_id.or(run_id),
                            session_id,
                            ..ProviderReply::from_content(Some(content))
                        });
                    }
                    "RunError" | "RunFailed" => {
                        return Err(ProviderError::Stream(
                            payload.error.unwrap_or_else(|| "run failed".to_string()),
                        ));
                    }
                    other => tracing::trace!(event = other, "ignoring stream event"),
                }
            }
        }

        Err(ProviderError::Stream("stream ended before RunCompleted".into()))
    }

    async fn send(&self, request: &ProviderRequest) -> Result<Option<String>, ProviderError> {
        let client = self.clone();
        let request = request.clone();
        tokio::spawn(async move {
            if let Err(error) = client.run(&request).await {
                tracing::error!(
                    %error,
                    provider_id = %client.provider_id,
                    trace_id = %request.trace_id,
                    "fire-and-forget agno run failed"
                );
            }
        });
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental server-sent-events parser; tolerates events and UTF-8
/// sequences split across chunks.
#[derive(Debug, Default)]
struct SseParser {
    pending: Vec<u8>,
    buffer: String,
    event: String,
    data: String,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.len(),
            // Incomplete trailing sequence: keep it for the next chunk.
            Err(error) if error.error_len().is_none() => error.valid_up_to(),
            Err(_) => {
                let lossy = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                self.buffer.push_str(&lossy);
                return self.drain_lines();
            }
        };
        let complete: Vec<u8> = self.pending.drain(..valid).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&complete));
        self.drain_lines()
    }

    fn drain_lines(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(name) = line.strip_prefix("event:") {
                self.event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            } else if line.is_empty() {
                if !self.event.is_empty() && !self.data.is_empty() {
                    events.push(SseEvent {
                        name: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data),
                    });
                } else {
                    self.event.clear();
                    self.data.clear();
                }
            }
        }
        events
    }
}
