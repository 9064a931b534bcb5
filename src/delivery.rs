//! Response delivery: split finished replies to the channel limit and pace the sends.

use crate::InstanceId;
use crate::config::SplitDelayConfig;
use crate::error::DeliveryError;
use crate::messaging::{MessagingDyn, OutboundContent, OutboundMessage};
use tokio::sync::{mpsc, oneshot};

/// Share of the limit, measured from the end, searched for a word boundary.
const WORD_BOUNDARY_WINDOW: f64 = 0.2;

/// Split `text` into chunks of at most `max_len` bytes.
///
/// Prefers the last paragraph break, then the last line break, then a space
/// in the trailing fifth of the window, and hard-cuts on a char boundary
/// otherwise. Nothing is trimmed, so the chunks concatenate back to `text`.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(4);
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut safe_max = max_len;
        while !remaining.is_char_boundary(safe_max) {
            safe_max -= 1;
        }
        let window = &remaining[..safe_max];
        let word_floor = safe_max - (safe_max as f64 * WORD_BOUNDARY_WINDOW) as usize;

        let split_at = window
            .rfind("\n\n")
            .map(|index| index + 2)
            .or_else(|| window.rfind('\n').map(|index| index + 1))
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, ch)| ch.is_whitespace())
                    .filter(|(index, _)| *index >= word_floor)
                    .map(|(index, ch)| index + ch.len_utf8())
            })
            .unwrap_or(safe_max);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    chunks
}

/// Split every provider part against the limit, dropping blank parts.
pub fn chunk_parts(parts: &[String], max_len: usize) -> Vec<String> {
    parts
        .iter()
        .filter(|part| !part.trim().is_empty())
        .flat_map(|part| split_message(part, max_len))
        .collect()
}

/// Sends chunks to one chat in order, showing typing between them.
pub struct PacedSender<'a> {
    pub connector: &'a dyn MessagingDyn,
    pub instance_id: &'a InstanceId,
    pub chat_id: &'a str,
    pub split_delay: SplitDelayConfig,
    pub typing_duration_ms: u64,
}

impl PacedSender<'_> {
    /// Deliver `chunks` strictly in order. Stops at the first failed send and
    /// returns how many chunks reached the connector.
    pub async fn send_all(&self, chunks: Vec<String>) -> Result<usize, DeliveryError> {
        let mut sent = 0;
        for chunk in chunks {
            if sent > 0 {
                self.typing(self.typing_duration_ms).await;
                tokio::time::sleep(self.split_delay.delay_for(chunk.chars().count())).await;
            }
            self.connector
                .send_message(self.instance_id, OutboundMessage::text(self.chat_id, chunk))
                .await
                .map_err(|error| DeliveryError::SendFailed {
                    chat_id: self.chat_id.to_string(),
                    message: error.to_string(),
                })?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Forward deltas to a progressively rendering connector until `deltas`
    /// closes, then close the reply according to `completed`. A run that did
    /// not complete is aborted so the connector can retract the partial reply;
    /// it never receives `StreamEnd`. Returns the number of deltas forwarded.
    pub async fn stream(
        &self,
        mut deltas: mpsc::Receiver<String>,
        completed: oneshot::Receiver<bool>,
    ) -> Result<usize, DeliveryError> {
        let mut forwarded = 0;
        while let Some(delta) = deltas.recv().await {
            if delta.is_empty() {
                continue;
            }
            if forwarded == 0 {
                self.send_content(OutboundContent::StreamStart).await?;
            }
            self.send_content(OutboundContent::StreamChunk(delta)).await?;
            forwarded += 1;
        }
        if forwarded == 0 {
            return Ok(0);
        }

        // A dropped sender means the run never reported success.
        if completed.await.unwrap_or(false) {
            self.send_content(OutboundContent::StreamEnd).await?;
        } else {
            tracing::debug!(
                instance_id = %self.instance_id,
                chat_id = %self.chat_id,
                forwarded,
                "run failed mid-stream, aborting partial reply"
            );
            self.send_content(OutboundContent::StreamAbort).await?;
        }
        Ok(forwarded)
    }

    /// Set the typing indicator. Failures never fail a delivery.
    pub async fn typing(&self, duration_ms: u64) {
        if let Err(error) = self
            .connector
            .send_typing(self.instance_id, self.chat_id, duration_ms)
            .await
        {
            tracing::debug!(
                %error,
                instance_id = %self.instance_id,
                chat_id = %self.chat_id,
                "typing indicator failed"
            );
        }
    }

    async fn send_content(&self, content: OutboundContent) -> Result<(), DeliveryError> {
        let message = OutboundMessage {
            to: self.chat_id.to_string(),
            content,
        };
        self.connector
            .send_message(self.instance_id, message)
            .await
            .map_err(|error| DeliveryError::SendFailed {
                chat_id: self.chat_id.to_string(),
                message: error.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelType;
    use crate::error::Result;
    use crate::messaging::Messaging;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Typing(u64),
        Send(OutboundContent),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(Instant, Call)>>>,
        fail_after: Option<usize>,
    }

    impl Messaging for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn channel_type(&self) -> ChannelType {
            ChannelType::Telegram
        }

        async fn send_message(&self, _instance_id: &InstanceId, message: OutboundMessage) -> Result<()> {
            let mut calls = self.calls.lock();
            let sends = calls.iter().filter(|(_, call)| matches!(call, Call::Send(_))).count();
            if self.fail_after.is_some_and(|limit| sends >= limit) {
                return Err(anyhow::anyhow!("connector offline").into());
            }
            calls.push((Instant::now(), Call::Send(message.content)));
            Ok(())
        }

        async fn send_typing(&self, _instance_id: &InstanceId, _chat_id: &str, duration_ms: u64) -> Result<()> {
            self.calls.lock().push((Instant::now(), Call::Typing(duration_ms)));
            Ok(())
        }
    }

    fn split_delay() -> SplitDelayConfig {
        SplitDelayConfig {
            min_delay_ms: 300,
            max_delay_ms: 1_000,
            per_char_ms: 10,
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 2000), vec!["hello".to_string()]);
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = split_message(&text, 40);
        assert_eq!(chunks, vec![format!("{}\n\n", "a".repeat(30)), "b".repeat(30)]);
    }

    #[test]
    fn breaks_on_words_near_the_limit() {
        let text = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod tempor";
        let chunks = split_message(text, 20);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 20));
        assert_eq!(chunks.concat(), text);
        assert_eq!(chunks[0], "lorem ipsum dolor ");
    }

    #[test]
    fn hard_cut_when_no_boundary() {
        let text = "x".repeat(45);
        let chunks = split_message(&text, 20);
        assert_eq!(chunks.iter().map(String::len).collect::<Vec<_>>(), vec![20, 20, 5]);
    }

    #[test]
    fn multibyte_text_concatenates_exactly() {
        let text = "héllo wörld 🎉 ".repeat(40);
        for limit in [7, 13, 50, 101] {
            let chunks = split_message(&text, limit);
            assert!(chunks.iter().all(|chunk| chunk.len() <= limit), "limit {limit}");
            assert_eq!(chunks.concat(), text, "limit {limit}");
        }
    }

    #[test]
    fn parts_are_resplit_and_blank_parts_dropped() {
        let parts = vec!["a".repeat(25), "   ".to_string(), "short".to_string()];
        let chunks = chunk_parts(&parts, 10);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last().map(String::as_str), Some("short"));
    }

    #[tokio::test(start_paused = true)]
    async fn paces_chunks_with_typing_in_order() {
        let recorder = Recorder::default();
        let instance_id: InstanceId = "inst-1".into();
        let sender = PacedSender {
            connector: &recorder,
            instance_id: &instance_id,
            chat_id: "chat-1",
            split_delay: split_delay(),
            typing_duration_ms: 5_000,
        };

        let start = Instant::now();
        let sent = sender
            .send_all(vec!["first".into(), "x".repeat(50), "y".repeat(500)])
            .await
            .expect("delivery should succeed");
        assert_eq!(sent, 3);

        let calls = recorder.calls.lock().clone();
        let kinds: Vec<_> = calls.iter().map(|(_, call)| call.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Call::Send(OutboundContent::Text("first".into())),
                Call::Typing(5_000),
                Call::Send(OutboundContent::Text("x".repeat(50))),
                Call::Typing(5_000),
                Call::Send(OutboundContent::Text("y".repeat(500))),
            ]
        );
        // 50 chars * 10ms = 500ms, 500 chars clamps to 1000ms.
        assert_eq!(calls[0].0 - start, Duration::ZERO);
        assert_eq!(calls[2].0 - start, Duration::from_millis(500));
        assert_eq!(calls[4].0 - start, Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_failed_send() {
        let recorder = Recorder {
            fail_after: Some(1),
            ..Recorder::default()
        };
        let instance_id: InstanceId = "inst-1".into();
        let sender = PacedSender {
            connector: &recorder,
            instance_id: &instance_id,
            chat_id: "chat-1",
            split_delay: split_delay(),
            typing_duration_ms: 5_000,
        };

        let error = sender
            .send_all(vec!["one".into(), "two".into(), "three".into()])
            .await
            .expect_err("second send should fail");
        assert!(matches!(error, DeliveryError::SendFailed { .. }));
        let sends = recorder
            .calls
            .lock()
            .iter()
            .filter(|(_, call)| matches!(call, Call::Send(_)))
            .count();
        assert_eq!(sends, 1);
    }

    #[tokio::test]
    async fn streams_deltas_between_start_and_end() {
        let recorder = Recorder::default();
        let instance_id: InstanceId = "inst-1".into();
        let sender = PacedSender {
            connector: &recorder,
            instance_id: &instance_id,
            chat_id: "chat-1",
            split_delay: split_delay(),
            typing_duration_ms: 5_000,
        };

        let (tx, rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();
        for delta in ["Hel", "", "lo"] {
            tx.send(delta.to_string()).await.expect("channel open");
        }
        drop(tx);
        done_tx.send(true).expect("receiver alive");

        assert_eq!(sender.stream(rx, done_rx).await.expect("stream should succeed"), 2);
        let kinds: Vec<_> = recorder.calls.lock().iter().map(|(_, call)| call.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Call::Send(OutboundContent::StreamStart),
                Call::Send(OutboundContent::StreamChunk("Hel".into())),
                Call::Send(OutboundContent::StreamChunk("lo".into())),
                Call::Send(OutboundContent::StreamEnd),
            ]
        );
    }

    #[tokio::test]
    async fn failed_run_aborts_partial_stream() {
        let recorder = Recorder::default();
        let instance_id: InstanceId = "inst-1".into();
        let sender = PacedSender {
            connector: &recorder,
            instance_id: &instance_id,
            chat_id: "chat-1",
            split_delay: split_delay(),
            typing_duration_ms: 5_000,
        };

        let (tx, rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel::<bool>();
        tx.send("I will del".to_string()).await.expect("channel open");
        drop(tx);
        drop(done_tx);

        assert_eq!(sender.stream(rx, done_rx).await.expect("stream should succeed"), 1);
        let kinds: Vec<_> = recorder.calls.lock().iter().map(|(_, call)| call.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Call::Send(OutboundContent::StreamStart),
                Call::Send(OutboundContent::StreamChunk("I will del".into())),
                Call::Send(OutboundContent::StreamAbort),
            ]
        );
    }

    #[tokio::test]
    async fn run_without_deltas_sends_nothing() {
        let recorder = Recorder::default();
        let instance_id: InstanceId = "inst-1".into();
        let sender = PacedSender {
            connector: &recorder,
            instance_id: &instance_id,
            chat_id: "chat-1",
            split_delay: split_delay(),
            typing_duration_ms: 5_000,
        };

        let (tx, rx) = mpsc::channel::<String>(8);
        let (done_tx, done_rx) = oneshot::channel();
        drop(tx);
        done_tx.send(false).expect("receiver alive");

        assert_eq!(sender.stream(rx, done_rx).await.expect("stream should succeed"), 0);
        assert!(recorder.calls.lock().is_empty());
    }
}
