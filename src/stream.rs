use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use memchr::memchr;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chat::{ChatMessage, ChatRole};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(120);

/// One decoded unit of the streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Error(String),
    Done,
}

/// A `{role, content}` pair as the backend expects it.
#[derive(Serialize, Debug, Clone)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ApiMessage],
}

/// Payload of one `data:` line. Field priority when several are present:
/// error, then content, then done.
#[derive(Deserialize)]
struct StreamRecord {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

/// Reply shape of the non-streaming backend variant.
#[derive(Deserialize, Debug)]
pub struct CompletedMessage {
    #[allow(dead_code)]
    pub role: String,
    pub content: String,
}

/// Build the wire history: composed system instruction first, then every
/// finished message in order. The in-flight streaming placeholder (if the
/// caller already created one) is never sent.
pub fn wire_messages(system_prompt: &str, history: &[ChatMessage]) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ApiMessage {
        role: ChatRole::System.as_str().to_string(),
        content: system_prompt.to_string(),
    });
    for msg in history.iter().filter(|m| !m.streaming) {
        messages.push(ApiMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        });
    }
    messages
}

/// Incremental decoder for the line-oriented `data: <json>` stream.
///
/// Chunks are buffered as raw bytes and only decoded once a newline closes a
/// line, so a multi-byte UTF-8 character split across chunk boundaries is
/// reassembled before any text handling. After a terminal event (`Done` or
/// `Error`) the decoder ignores everything else.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one transport chunk, appending any decoded events to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let event = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(line) => parse_line(line),
                Err(e) => {
                    warn!("skipping non-UTF-8 stream line: {e}");
                    None
                }
            };
            self.buffer.drain(..=newline_pos);

            if let Some(event) = event {
                let terminal = !matches!(event, StreamEvent::Delta(_));
                out.push(event);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    return;
                }
            }
        }
    }
}

/// Decode one complete line into an event. Lines that are empty after
/// trimming, lack the `data: ` prefix, or fail to parse are discarded.
fn parse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.trim().strip_prefix("data: ")?;
    let record: StreamRecord = match serde_json::from_str(payload) {
        Ok(record) => record,
        Err(e) => {
            debug!("skipping malformed stream line: {e}");
            return None;
        }
    };

    if let Some(message) = record.error {
        Some(StreamEvent::Error(message))
    } else if let Some(content) = record.content {
        Some(StreamEvent::Delta(content))
    } else if record.done == Some(true) {
        Some(StreamEvent::Done)
    } else {
        None
    }
}

/// HTTP client for the study backend.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Open the streamed chat request. A non-success status is a failure
    /// before any events exist.
    async fn send_chat(&self, messages: &[ApiMessage]) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.chat_url())
            .json(&ChatRequest { messages })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("backend returned {status}"));
        }
        Ok(response)
    }

    /// Non-streaming backend variant: one JSON `{role, content}` object once
    /// the full answer is ready.
    pub async fn complete(&self, messages: &[ApiMessage]) -> Result<CompletedMessage> {
        let response = self
            .client
            .post(self.chat_url())
            .timeout(COMPLETE_TIMEOUT)
            .json(&ChatRequest { messages })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("backend returned {status}"));
        }
        Ok(response.json().await?)
    }
}

pub struct StreamParams {
    pub client: BackendClient,
    pub messages: Vec<ApiMessage>,
    pub stream_id: u64,
    /// Buffer the whole reply, then replay it with small randomized pauses.
    pub paced: bool,
}

/// Spawns stream tasks and tags every event with the id of the stream that
/// produced it, so the event loop can drop events from an aborted stream.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamEvent, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamEvent, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_stream(&self, params: StreamParams) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                messages,
                stream_id,
                paced,
            } = params;

            let response = match client.send_chat(&messages).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("chat request failed: {e:#}");
                    let _ = tx.send((StreamEvent::Error(e.to_string()), stream_id));
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut events = Vec::new();
            let mut held_back: Vec<String> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("transport failed mid-stream: {e}");
                        let _ = tx.send((StreamEvent::Error(e.to_string()), stream_id));
                        return;
                    }
                };

                decoder.feed(&bytes, &mut events);
                for event in events.drain(..) {
                    match event {
                        StreamEvent::Delta(text) if paced => held_back.push(text),
                        StreamEvent::Delta(text) => {
                            let _ = tx.send((StreamEvent::Delta(text), stream_id));
                        }
                        StreamEvent::Error(message) => {
                            let _ = tx.send((StreamEvent::Error(message), stream_id));
                            return;
                        }
                        StreamEvent::Done => {
                            finish(&tx, stream_id, paced, held_back).await;
                            return;
                        }
                    }
                }
            }

            // Transport closed without a done marker; not an error here.
            finish(&tx, stream_id, paced, held_back).await;
        })
    }

    /// Non-streaming variant: fetch the completed reply and deliver it as a
    /// single delta so the consumer has one code path.
    pub fn spawn_complete(&self, params: StreamParams) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                messages,
                stream_id,
                ..
            } = params;
            match client.complete(&messages).await {
                Ok(completed) => {
                    let _ = tx.send((StreamEvent::Delta(completed.content), stream_id));
                    let _ = tx.send((StreamEvent::Done, stream_id));
                }
                Err(e) => {
                    warn!("chat request failed: {e:#}");
                    let _ = tx.send((StreamEvent::Error(e.to_string()), stream_id));
                }
            }
        })
    }
}

/// Replay any held-back fragments (paced mode), then signal completion.
async fn finish(
    tx: &mpsc::UnboundedSender<(StreamEvent, u64)>,
    stream_id: u64,
    paced: bool,
    held_back: Vec<String>,
) {
    if paced {
        for fragment in held_back {
            tokio::time::sleep(reveal_pause()).await;
            if tx.send((StreamEvent::Delta(fragment), stream_id)).is_err() {
                return;
            }
        }
    }
    let _ = tx.send((StreamEvent::Done, stream_id));
}

/// Randomized 20-79 ms pause between paced reveals.
fn reveal_pause() -> Duration {
    let mut buf = [0u8; 2];
    let jitter = match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from(u16::from_le_bytes(buf)) % 60,
        Err(_) => 30,
    };
    Duration::from_millis(20 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Conversation;
    use crate::persona::Persona;

    fn feed_all(decoder: &mut SseDecoder, chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk, &mut events);
        }
        events
    }

    #[test]
    fn decodes_fragments_in_order_then_done() {
        let mut decoder = SseDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[
                b"data: {\"content\":\"\\u05e9\\u05dc\\u05d5\\u05dd\"}\n".as_slice(),
                "data: {\"content\":\" עולם\"}\n".as_bytes(),
                b"data: {\"done\":true}\n".as_slice(),
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("שלום".to_string()),
                StreamEvent::Delta(" עולם".to_string()),
                StreamEvent::Done,
            ]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let line = "data: {\"content\":\"שלום\"}\n".as_bytes();
        // Split inside the first Hebrew letter's two-byte sequence.
        let split = line.iter().position(|&b| b >= 0x80).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        decoder.feed(&line[..split], &mut events);
        assert!(events.is_empty(), "no event before the line is complete");

        decoder.feed(&line[split..], &mut events);
        assert_eq!(events, vec![StreamEvent::Delta("שלום".to_string())]);
    }

    #[test]
    fn malformed_line_is_skipped_without_dropping_neighbors() {
        let mut decoder = SseDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[
                b"data: {\"content\":\"first\"}\n".as_slice(),
                b"data: {not json}\n".as_slice(),
                b"data: {\"content\":\"second\"}\n".as_slice(),
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("first".to_string()),
                StreamEvent::Delta("second".to_string()),
            ]
        );
        assert!(!decoder.is_finished());
    }

    #[test]
    fn lines_without_data_prefix_are_ignored() {
        let mut decoder = SseDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[
                b"event: ping\n".as_slice(),
                b"\n".as_slice(),
                b"   \n".as_slice(),
                // Missing the space after the colon: not the protocol shape.
                b"data:{\"content\":\"x\"}\n".as_slice(),
                b"data: {\"content\":\"kept\"}\n".as_slice(),
            ],
        );
        assert_eq!(events, vec![StreamEvent::Delta("kept".to_string())]);
    }

    #[test]
    fn partial_line_is_retained_between_chunks() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        decoder.feed(b"data: {\"cont", &mut events);
        assert!(events.is_empty());
        decoder.feed(b"ent\":\"a\"}\n", &mut events);
        assert_eq!(events, vec![StreamEvent::Delta("a".to_string())]);
    }

    #[test]
    fn error_line_terminates_decoding() {
        let mut decoder = SseDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[
                b"data: {\"content\":\"partial\"}\n".as_slice(),
                b"data: {\"error\":\"model overloaded\"}\n".as_slice(),
                b"data: {\"content\":\"after\"}\n".as_slice(),
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("partial".to_string()),
                StreamEvent::Error("model overloaded".to_string()),
            ]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn bytes_after_done_are_discarded() {
        let mut decoder = SseDecoder::new();
        let events = feed_all(
            &mut decoder,
            &[b"data: {\"done\":true}\ndata: {\"content\":\"late\"}\n".as_slice()],
        );
        assert_eq!(events, vec![StreamEvent::Done]);

        let mut more = Vec::new();
        decoder.feed(b"data: {\"content\":\"later\"}\n", &mut more);
        assert!(more.is_empty());
    }

    #[test]
    fn error_field_wins_over_content_in_one_record() {
        assert_eq!(
            parse_line("data: {\"content\":\"x\",\"error\":\"boom\"}"),
            Some(StreamEvent::Error("boom".to_string()))
        );
    }

    #[test]
    fn wire_messages_start_with_system_and_skip_placeholder() {
        let mut conv = Conversation::new();
        conv.push_user("Why does the mishna open with the evening Shema?".to_string());
        conv.push_assistant("Because the day begins at nightfall.".to_string(), None);
        conv.push_user("Says who?".to_string());
        conv.begin_streaming(Persona::Chavruta);

        let wire = wire_messages("be a chavruta", conv.messages());
        let roles: Vec<&str> = wire.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(wire[0].content, "be a chavruta");
        assert_eq!(wire[3].content, "Says who?");
    }

    #[tokio::test]
    async fn non_success_status_fails_before_any_events() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let client = BackendClient::new(&format!("http://{addr}")).unwrap();
        let (service, mut rx) = ChatStreamService::new();
        let handle = service.spawn_stream(StreamParams {
            client,
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream_id: 3,
            paced: false,
        });

        let (event, stream_id) = rx.recv().await.unwrap();
        assert_eq!(stream_id, 3);
        assert!(matches!(event, StreamEvent::Error(_)), "got {event:?}");

        // The task ends without emitting anything else for this stream.
        handle.await.unwrap();
        drop(service);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn paced_replay_preserves_order_and_ends_with_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let held_back = vec!["In ".to_string(), "the ".to_string(), "beginning".to_string()];
        finish(&tx, 5, true, held_back).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some((event, stream_id)) = rx.recv().await {
            assert_eq!(stream_id, 5);
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("In ".to_string()),
                StreamEvent::Delta("the ".to_string()),
                StreamEvent::Delta("beginning".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn reveal_pause_stays_within_bounds() {
        for _ in 0..32 {
            let pause = reveal_pause();
            assert!(pause >= Duration::from_millis(20));
            assert!(pause < Duration::from_millis(80));
        }
    }
}
