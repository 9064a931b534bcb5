//! Connector that writes outbound traffic to stdout as JSON lines.

use crate::error::Result;
use crate::messaging::traits::{Messaging, OutboundMessage};
use crate::{ChannelType, InstanceId};
use anyhow::Context as _;
use serde::Serialize;
use std::io::Write as _;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Message {
        channel: ChannelType,
        instance_id: &'a str,
        #[serde(flatten)]
        message: &'a OutboundMessage,
    },
    Typing {
        channel: ChannelType,
        instance_id: &'a str,
        chat_id: &'a str,
        duration_ms: u64,
    },
}

/// Prints every send so a replayed event stream can be inspected.
#[derive(Debug, Clone)]
pub struct StdoutAdapter {
    name: String,
    channel: ChannelType,
}

impl StdoutAdapter {
    pub fn new(channel: ChannelType) -> Self {
        Self {
            name: format!("stdout:{channel}"),
            channel,
        }
    }

    fn emit(&self, line: &Line<'_>) -> Result<()> {
        let encoded = encode(line)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{encoded}")?;
        Ok(())
    }
}

fn encode(line: &Line<'_>) -> Result<String> {
    Ok(serde_json::to_string(line).context("failed to encode outbound line")?)
}

impl Messaging for StdoutAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> ChannelType {
        self.channel
    }

    async fn send_message(&self, instance_id: &InstanceId, message: OutboundMessage) -> Result<()> {
        self.emit(&Line::Message {
            channel: self.channel,
            instance_id,
            message: &message,
        })
    }

    async fn send_typing(&self, instance_id: &InstanceId, chat_id: &str, duration_ms: u64) -> Result<()> {
        self.emit(&Line::Typing {
            channel: self.channel,
            instance_id,
            chat_id,
            duration_ms,
        })
    }
}
