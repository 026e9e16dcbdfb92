//! Relays the model server's token stream to the client.
//!
//! Upstream speaks newline-delimited JSON (`{"response": "...", "done":
//! false}` per line). The relay reassembles logical lines across network
//! reads, forwards content fragments in arrival order, attaches detected
//! proposals to the chunk that triggered detection, and closes with
//! exactly one terminal marker whether the upstream finished, broke, or
//! just went away.

use futures::{SinkExt, StreamExt, channel::mpsc};
use serde::Deserialize;

use taskpilot_proto::{ChatRole, ChatTurn, StreamChunk, StreamFailure};

use crate::extract::{MIN_DETECT_CONTENT_LEN, extract_proposals};

/// One upstream line. Unknown fields are ignored; lines that do not
/// parse at all are skipped silently.
#[derive(Debug, Deserialize)]
struct UpstreamLine {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

/// Push state machine for one streamed response. Feed it raw upstream
/// bytes; it returns the chunks to forward, in order, never re-ordered.
#[derive(Default)]
pub struct RelayState {
    buffer: String,
    full_content: String,
    proposals_detected: bool,
    terminated: bool,
}

impl RelayState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read. Partial trailing lines are carried forward
    /// until the next read completes them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        if self.terminated {
            return Vec::new();
        }
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.handle_line(line.trim(), &mut out);
            if self.terminated {
                break;
            }
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamChunk>) {
        if line.is_empty() {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<UpstreamLine>(line) else {
            return;
        };
        if let Some(fragment) = parsed.response {
            if !fragment.is_empty() {
                self.full_content.push_str(&fragment);
                let mut chunk = StreamChunk::content(fragment);
                if !self.proposals_detected && self.full_content.len() > MIN_DETECT_CONTENT_LEN {
                    let proposals = extract_proposals(&self.full_content);
                    if !proposals.is_empty() {
                        self.proposals_detected = true;
                        tracing::info!(
                            count = proposals.len(),
                            "detected change proposals in model output"
                        );
                        chunk.proposals = Some(proposals);
                    }
                }
                out.push(chunk);
            }
        }
        if parsed.done {
            self.terminated = true;
            out.push(StreamChunk::terminal());
        }
    }

    /// The upstream body ended. Emits the terminal marker if the
    /// upstream never sent its own done signal.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        vec![StreamChunk::terminal()]
    }

    /// The upstream connection failed mid-stream. Emits a single
    /// error-bearing terminal event.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamChunk> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        vec![StreamChunk {
            error: Some(StreamFailure {
                message: message.into(),
                code: "upstream_error".to_string(),
            }),
            done: true,
            ..StreamChunk::default()
        }]
    }
}

/// The instruction block prepended to every model prompt. The tag
/// formats here are what the extractor recognizes on the way back.
const SYSTEM_PROMPT: &str = r#"You are a task management assistant. You can help create, update and delete tasks and subtasks.

PROPOSAL INSTRUCTIONS:
When the user asks for changes to their tasks, emit proposals in the following format.

To create a task:
PROPOSAL_CREATE_TASK: {"name": "Task name", "description": "Description", "priority": "low|medium|high", "due_date": "YYYY-MM-DD", "status": "pending|in_progress|done"}

To update a task:
PROPOSAL_UPDATE_TASK: {"id": 123, "name": "New name", "description": "New description", "priority": "low|medium|high", "due_date": "YYYY-MM-DD", "status": "pending|in_progress|done"}

To delete a task:
PROPOSAL_DELETE_TASK: {"id": 123}

To create a subtask:
PROPOSAL_CREATE_SUBTASK: {"name": "Subtask name", "description": "Description", "priority": "low|medium|high", "due_date": "YYYY-MM-DD", "status": "pending|in_progress|done", "parent_id": 123}

To update a subtask:
PROPOSAL_UPDATE_SUBTASK: {"id": 456, "name": "New name", "description": "New description", "priority": "low|medium|high", "due_date": "YYYY-MM-DD", "status": "pending|in_progress|done", "parent_id": 123}

To delete a subtask:
PROPOSAL_DELETE_SUBTASK: {"id": 456}

IMPORTANT: Only emit proposals when the user asks for specific changes. Answer other questions normally."#;

/// Flatten the conversation into the completion-style prompt the model
/// server expects.
#[must_use]
pub fn build_prompt(messages: &[ChatTurn]) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT);
    prompt.push_str("\n\n");
    for turn in messages {
        let role = match turn.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

/// Drive the upstream body through a [`RelayState`] and into the NDJSON
/// response channel. Stops early if the client hangs up.
pub async fn pump_upstream(
    upstream: reqwest::Response,
    mut tx: mpsc::Sender<Result<axum::body::Bytes, std::convert::Infallible>>,
) {
    let mut relay = RelayState::new();
    let mut body = upstream.bytes_stream();
    while let Some(next) = body.next().await {
        let chunks = match next {
            Ok(bytes) => relay.push(&bytes),
            Err(error) => {
                tracing::warn!(reason = %error, "model stream failed mid-response");
                let chunks = relay.fail(error.to_string());
                forward_chunks(&mut tx, chunks).await;
                return;
            }
        };
        if !forward_chunks(&mut tx, chunks).await {
            tracing::debug!("chat client went away; dropping model stream");
            return;
        }
        if relay.terminated {
            return;
        }
    }
    forward_chunks(&mut tx, relay.finish()).await;
}

/// Returns false once the receiving side is gone.
async fn forward_chunks(
    tx: &mut mpsc::Sender<Result<axum::body::Bytes, std::convert::Infallible>>,
    chunks: Vec<StreamChunk>,
) -> bool {
    for chunk in chunks {
        let Ok(mut line) = serde_json::to_string(&chunk) else {
            continue;
        };
        line.push('\n');
        if tx.send(Ok(line.into())).await.is_err() {
            return false;
        }
    }
    true
}
