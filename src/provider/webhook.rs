//! Webhook provider: POSTs the trigger as JSON to a user-supplied URL.
//!
//! Round-trip replies are `{"reply": "..."}`, `{"parts": [...]}`, or a plain
//! text body. Fire-and-forget posts in the background and acknowledges at once;
//! the agent replies later through the platform's send API.

use crate::error::ProviderError;
use crate::provider::traits::{AgentClient, ProviderReply, ProviderRequest};
use crate::storage::AgentProvider;
use crate::{ChannelType, EventKind};
use serde::{Deserialize, Serialize};

/// Where the agent should send asynchronous replies.
const REPLY_ENDPOINT: &str = "POST /api/v2/messages/send";

#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    provider_id: String,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    event: EventInfo<'a>,
    instance: InstanceInfo<'a>,
    chat: ChatInfo<'a>,
    sender: SenderInfo<'a>,
    content: ContentInfo<'a>,
    trace_id: &'a str,
    reply_endpoint: &'static str,
}

#[derive(Debug, Serialize)]
struct EventInfo<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: EventKind,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceInfo<'a> {
    id: &'a str,
    channel_type: ChannelType,
}

#[derive(Debug, Serialize)]
struct ChatInfo<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct SenderInfo<'a> {
    id: &'a str,
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ContentInfo<'a> {
    text: &'a str,
    emoji: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    parts: Option<Vec<String>>,
}

impl WebhookClient {
    pub fn new(http: reqwest::Client, provider: &AgentProvider) -> Self {
        Self {
            http,
            provider_id: provider.id.to_string(),
            url: provider.base_url.clone(),
            api_key: provider.api_key.clone(),
        }
    }

    async fn post(&self, request: &ProviderRequest) -> Result<Option<WebhookResponse>, ProviderError> {
        let payload = WebhookPayload {
            event: EventInfo {
                id: &request.event_id,
                kind: request.event_kind,
                timestamp: request.timestamp,
            },
            instance: InstanceInfo {
                id: &request.instance_id,
                channel_type: request.channel_type,
            },
            chat: ChatInfo { id: &request.chat_id },
            sender: SenderInfo {
                id: &request.sender_id,
                name: request.sender_name.as_deref(),
            },
            content: ContentInfo {
                text: &request.text,
                emoji: request.emoji.as_deref(),
            },
            trace_id: &request.trace_id,
            reply_endpoint: REPLY_ENDPOINT,
        };

        let mut builder = self
            .http
            .post(&self.url)
            .header("X-Omni-Provider", "webhook")
            .timeout(request.timeout)
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let map_http = |error: reqwest::Error| ProviderError::from_http(error, &self.provider_id, request.timeout_ms());
        let response = builder.send().await.map_err(map_http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Request {
                status: Some(status.as_u16()),
                message: format!("webhook returned {status}"),
            });
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let body = response.text().await.map_err(map_http)?;

        if is_json {
            if body.trim().is_empty() {
                return Ok(None);
            }
            return serde_json::from_str(&body)
                .map(Some)
                .map_err(|error| ProviderError::InvalidResponse(error.to_string()));
        }

        let text = body.trim();
        Ok((!text.is_empty()).then(|| WebhookResponse {
            reply: Some(text.to_string()),
            parts: None,
        }))
    }
}

impl AgentClient for WebhookClient {
    async fn run(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let response = self.post(request).await?.unwrap_or_default();
        let parts = match (response.parts, response.reply) {
            (Some(parts), _) => parts,
            (None, Some(reply)) => vec![reply],
            (None, None) => Vec::new(),
        };
        Ok(ProviderReply {
            parts: parts.into_iter().filter(|part| !part.trim().is_empty()).collect(),
            run_id: Some(request.trace_id.clone()),
            session_id: None,
        })
    }

    async fn send(&self, request: &ProviderRequest) -> Result<Option<String>, ProviderError> {
        let client = self.clone();
        let request = request.clone();
        let trace_id = request.trace_id.clone();
        tokio::spawn(async move {
            if let Err(error) = client.post(&request).await {
                tracing::error!(
                    %error,
                    provider_id = %client.provider_id,
                    trace_id = %request.trace_id,
                    "fire-and-forget webhook failed"
                );
            }
        });
        Ok(Some(trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AgentType, ProviderMode};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use std::time::Duration;

    fn provider(url: String) -> AgentProvider {
        AgentProvider {
            id: "prov-hook".into(),
            name: "hook".into(),
            schema: "webhook".into(),
            mode: ProviderMode::RoundTrip,
            can_stream_response: false,
            base_url: url,
            api_key: Some("secret".into()),
            timeout_ms: None,
            is_active: true,
            schema_config: serde_json::Value::Null,
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            trace_id: "trc_1".into(),
            event_id: "evt_1".into(),
            event_kind: EventKind::MessageReceived,
            timestamp: chrono::Utc::now(),
            instance_id: "inst-1".into(),
            channel_type: ChannelType::Telegram,
            chat_id: "chat-1".into(),
            sender_id: "user-1".into(),
            sender_name: Some("Ana".into()),
            text: "[Ana]: hello".into(),
            emoji: None,
            session_id: "user-1:chat-1".into(),
            agent_id: None,
            agent_type: AgentType::Agent,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn posts_payload_and_reads_reply() {
        let server = MockServer::start();
        let hook = server.mock(|when, then| {
            when.method(POST)
                .path("/hook")
                .header("authorization", "Bearer secret")
                .header("x-omni-provider", "webhook")
                .body_includes("\"traceId\":\"trc_1\"")
                .body_includes("\"channelType\":\"telegram\"")
                .body_includes("\"type\":\"message.received\"")
                .body_includes("[Ana]: hello");
            then.status(200).header("content-type", "application/json").json_body(json!({"reply": "hi Ana"}));
        });

        let client = WebhookClient::new(reqwest::Client::new(), &provider(server.url("/hook")));
        let reply = client.run(&request()).await.expect("webhook call should succeed");

        hook.assert_calls(1);
        assert_eq!(reply.parts, vec!["hi Ana".to_string()]);
        assert_eq!(reply.run_id.as_deref(), Some("trc_1"));
    }

    #[tokio::test]
    async fn parts_and_plain_text_replies() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/parts");
            then.status(200).header("content-type", "application/json").json_body(json!({"parts": ["one", "two"]}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/text");
            then.status(200).header("content-type", "text/plain").body("  plain reply \n");
        });
        server.mock(|when, then| {
            when.method(POST).path("/empty");
            then.status(200).header("content-type", "application/json").json_body(json!({}));
        });

        let http = reqwest::Client::new();
        let parts = WebhookClient::new(http.clone(), &provider(server.url("/parts")))
            .run(&request())
            .await
            .expect("parts reply");
        assert_eq!(parts.parts, vec!["one".to_string(), "two".to_string()]);

        let text = WebhookClient::new(http.clone(), &provider(server.url("/text")))
            .run(&request())
            .await
            .expect("text reply");
        assert_eq!(text.parts, vec!["plain reply".to_string()]);

        let empty = WebhookClient::new(http, &provider(server.url("/empty")))
            .run(&request())
            .await
            .expect("empty reply");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_a_request_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(502);
        });

        let client = WebhookClient::new(reqwest::Client::new(), &provider(server.url("/hook")));
        let error = client.run(&request()).await.expect_err("502 must fail");
        assert!(matches!(error, ProviderError::Request { status: Some(502), .. }));
    }

    #[tokio::test]
    async fn fire_and_forget_acknowledges_with_trace_id() {
        let server = MockServer::start();
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(202);
        });

        let client = WebhookClient::new(reqwest::Client::new(), &provider(server.url("/hook")));
        let run_id = client.send(&request()).await.expect("send should acknowledge");
        assert_eq!(run_id.as_deref(), Some("trc_1"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        hook.assert_calls(1);
    }
}
