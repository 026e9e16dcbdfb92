use std::{sync::Arc, time::Duration};

use futures::StreamExt;

use taskpilot_proto::{ChatMessage, ChatRequest, ChatRole, ChatTurn, StreamChunk};

use crate::{
    cancel::CancelToken,
    error::{ChatError, ChatErrorCode},
    transport::{ChatTransport, ProposalSink},
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone)]
pub struct ChatSessionOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ChatSessionOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Where the session currently sits in its
/// `idle -> sending -> streaming -> {success | failed}` cycle. Success
/// folds back into `Idle`; `Failed` holds until the next send or
/// `clear_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Sending,
    Streaming,
    Failed,
}

/// Client-side chat orchestrator: owns the message history, drives the
/// bounded-retry state machine, and reacts to proposals arriving
/// mid-stream.
///
/// One logical stream at a time: a new send cancels whatever was in
/// flight before appending anything. The message list is only touched
/// from inside the streaming loop or from caller-triggered methods,
/// which the streaming flag keeps mutually exclusive.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    proposals: Arc<dyn ProposalSink>,
    options: ChatSessionOptions,
    messages: Vec<ChatMessage>,
    phase: SessionPhase,
    error: Option<ChatError>,
    retry_count: u32,
    last_prompt: String,
    streaming: bool,
    in_flight: Option<CancelToken>,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        proposals: Arc<dyn ProposalSink>,
        options: ChatSessionOptions,
    ) -> Self {
        Self {
            transport,
            proposals,
            options,
            messages: Vec::new(),
            phase: SessionPhase::Idle,
            error: None,
            retry_count: 0,
            last_prompt: String::new(),
            streaming: false,
            in_flight: None,
        }
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn last_prompt(&self) -> &str {
        &self.last_prompt
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.retry_count = 0;
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.clear_error();
        self.last_prompt.clear();
    }

    /// Cancel the in-flight stream, if any. Safe to call at any time.
    pub fn cancel_request(&mut self) {
        if let Some(token) = &self.in_flight {
            token.cancel();
        }
    }

    /// Send `content` and stream the assistant's reply, retrying
    /// transient failures with growing delay. Returns the terminal
    /// outcome; the same outcome is also readable from the session
    /// state afterwards.
    pub async fn send_message(&mut self, content: &str) -> Result<(), ChatError> {
        self.send_message_with_cancel(content, CancelToken::new())
            .await
    }

    /// Re-issue the last prompt after a final failure. The manual retry
    /// affordance behind the error surfaced to the user.
    pub async fn retry_last_message(&mut self) -> Result<(), ChatError> {
        if self.last_prompt.is_empty() || self.streaming {
            return Ok(());
        }
        let prompt = self.last_prompt.clone();
        self.send_message(&prompt).await
    }

    /// Like [`send_message`], with an explicit cancellation token the
    /// caller keeps a clone of. The token is checked cooperatively at
    /// every suspension point of the streaming loop.
    ///
    /// [`send_message`]: Self::send_message
    pub async fn send_message_with_cancel(
        &mut self,
        content: &str,
        cancel: CancelToken,
    ) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() || self.streaming {
            return Ok(());
        }
        // At most one active stream: anything still in flight is told to
        // stop before this send touches the history.
        self.cancel_request();
        self.in_flight = Some(cancel.clone());
        self.clear_error();
        self.last_prompt = content.to_string();
        self.streaming = true;
        self.phase = SessionPhase::Sending;

        self.messages.push(new_message(ChatRole::User, content));
        let request = ChatRequest {
            messages: self
                .messages
                .iter()
                .map(|message| ChatTurn {
                    role: message.role,
                    content: message.content.clone(),
                })
                .collect(),
        };

        let result = self.run_attempts(&request, &cancel).await;

        self.streaming = false;
        self.in_flight = None;
        match &result {
            Ok(()) => {
                self.phase = SessionPhase::Idle;
            }
            Err(error) => {
                self.phase = SessionPhase::Failed;
                self.error = Some(error.clone());
            }
        }
        result
    }

    async fn run_attempts(
        &mut self,
        request: &ChatRequest,
        cancel: &CancelToken,
    ) -> Result<(), ChatError> {
        let mut attempt: u32 = 0;
        loop {
            self.phase = SessionPhase::Sending;
            self.messages.push(new_message(ChatRole::Assistant, ""));

            match self.stream_once(request, cancel).await {
                Ok(()) => {
                    self.retry_count = 0;
                    return Ok(());
                }
                Err(error) => {
                    // The empty or partially filled placeholder never
                    // survives a failed attempt.
                    self.messages.pop();
                    if error.retryable && attempt < self.options.max_retries {
                        attempt += 1;
                        self.retry_count = attempt;
                        tracing::debug!(
                            attempt,
                            code = error.code.as_str(),
                            "retrying chat request"
                        );
                        tokio::time::sleep(backoff_delay(self.options.retry_delay, attempt)).await;
                        continue;
                    }
                    self.retry_count = 0;
                    return Err(error);
                }
            }
        }
    }

    async fn stream_once(
        &mut self,
        request: &ChatRequest,
        cancel: &CancelToken,
    ) -> Result<(), ChatError> {
        if cancel.is_cancelled() {
            return Err(ChatError::aborted());
        }
        let mut stream = self
            .transport
            .open_stream(request)
            .await
            .map_err(|error| ChatError::classify(&error))?;
        self.phase = SessionPhase::Streaming;

        let mut buffer = String::new();
        while let Some(next) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(ChatError::aborted());
            }
            let bytes = next.map_err(|error| ChatError::classify(&error))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if self.handle_line(line.trim()).await? {
                    return Ok(());
                }
            }
        }
        // Upstream closed without a done marker; what arrived stands.
        Ok(())
    }

    /// Returns true when the terminal marker has been consumed.
    async fn handle_line(&mut self, line: &str) -> Result<bool, ChatError> {
        if line.is_empty() {
            return Ok(false);
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(line) else {
            return Ok(false);
        };
        if let Some(content) = chunk.content {
            if let Some(message) = self.messages.last_mut() {
                message.content.push_str(&content);
            }
        }
        if let Some(proposals) = chunk.proposals {
            for proposal in &proposals {
                if let Err(error) = self.proposals.save(proposal).await {
                    tracing::warn!(
                        proposal_id = %proposal.id,
                        reason = %error,
                        "failed to persist streamed proposal"
                    );
                }
            }
            if let Some(message) = self.messages.last_mut() {
                message.proposed_changes.extend(proposals);
            }
        }
        if let Some(failure) = chunk.error {
            return Err(ChatError::new(ChatErrorCode::UnknownError, failure.message));
        }
        Ok(chunk.done)
    }
}

/// Retry delay grows linearly with the attempt number.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}

fn new_message(role: ChatRole, content: &str) -> ChatMessage {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let suffix = match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };
    ChatMessage {
        id: format!("{timestamp}-{suffix}"),
        role,
        content: content.to_string(),
        timestamp,
        proposed_changes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::Mutex;

    use taskpilot_proto::{Proposal, ProposalEntity, ProposalKind};

    use crate::transport::{ChatByteStream, ChatTransport, ProposalSink, TransportError};

    use super::*;

    enum Script {
        Fail(TransportError),
        Stream(Vec<Result<Vec<u8>, TransportError>>),
    }

    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(
            &self,
            _request: &ChatRequest,
        ) -> Result<ChatByteStream, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .unwrap_or(Script::Fail(TransportError::Network(
                    "script exhausted".to_string(),
                )));
            match script {
                Script::Fail(error) => Err(error),
                Script::Stream(reads) => Ok(futures::stream::iter(reads).boxed()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<Proposal>>,
    }

    #[async_trait]
    impl ProposalSink for RecordingSink {
        async fn save(&self, proposal: &Proposal) -> Result<(), TransportError> {
            self.saved.lock().await.push(proposal.clone());
            Ok(())
        }
    }

    fn options(max_retries: u32) -> ChatSessionOptions {
        ChatSessionOptions {
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn session(
        transport: Arc<ScriptedTransport>,
        sink: Arc<RecordingSink>,
        max_retries: u32,
    ) -> ChatSession {
        ChatSession::new(transport, sink, options(max_retries))
    }

    fn reads(lines: &[&str]) -> Script {
        Script::Stream(lines.iter().map(|line| Ok(line.as_bytes().to_vec())).collect())
    }

    #[tokio::test]
    async fn a_successful_stream_fills_the_assistant_message() -> Result<()> {
        // Lines arrive cut mid-token to exercise reassembly.
        let transport = ScriptedTransport::new(vec![reads(&[
            "{\"content\":\"Hel",
            "lo\"}\n{\"content\":\" there\"}\n",
            "{\"done\":true}\n",
        ])]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        session.send_message("hi").await?;

        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.error().is_none());
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[1].content, "Hello there");
        assert_eq!(transport.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn streamed_proposals_are_persisted_and_attached() -> Result<()> {
        let proposal_line = "{\"content\":\"done\",\"proposals\":[{\"id\":\"proposal_9\",\
                             \"kind\":\"create\",\"entity\":\"task\",\
                             \"payload\":{\"name\":\"X\"},\
                             \"description\":\"Proposal to create task\"}]}\n";
        let transport =
            ScriptedTransport::new(vec![reads(&[proposal_line, "{\"done\":true}\n"])]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport, sink.clone(), 3);

        session.send_message("make a task").await?;

        let saved = sink.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, "proposal_9");
        assert_eq!(saved[0].kind, ProposalKind::Create);
        assert_eq!(saved[0].entity, ProposalEntity::Task);

        let assistant = &session.messages()[1];
        assert_eq!(assistant.proposed_changes.len(), 1);
        assert_eq!(assistant.proposed_changes[0].id, "proposal_9");
        Ok(())
    }

    #[tokio::test]
    async fn network_failures_retry_up_to_the_bound_then_settle_failed() -> Result<()> {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::Network("refused".to_string())),
            Script::Fail(TransportError::Network("refused".to_string())),
            Script::Fail(TransportError::Network("refused".to_string())),
            Script::Fail(TransportError::Network("refused".to_string())),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        let Err(error) = session.send_message("hi").await else {
            bail!("expected the send to fail");
        };

        // Initial attempt plus exactly three retries.
        assert_eq!(transport.calls(), 4);
        assert_eq!(error.code, ChatErrorCode::NetworkError);
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(session.retry_count(), 0);
        // The failed placeholder is gone; only the user message remains.
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, ChatRole::User);
        // The prompt is kept for the manual retry affordance.
        assert_eq!(session.last_prompt(), "hi");
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() -> Result<()> {
        let transport = ScriptedTransport::new(vec![Script::Fail(TransportError::Status {
            status: 400,
            message: "bad request".to_string(),
        })]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        let Err(error) = session.send_message("hi").await else {
            bail!("expected the send to fail");
        };

        assert_eq!(transport.calls(), 1);
        assert_eq!(error.code, ChatErrorCode::ClientError);
        assert!(!error.retryable);
        Ok(())
    }

    #[tokio::test]
    async fn a_cancelled_stream_aborts_without_retrying() -> Result<()> {
        let transport = ScriptedTransport::new(vec![reads(&["{\"content\":\"hi\"}\n"])]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        let token = CancelToken::new();
        token.cancel();
        let Err(error) = session.send_message_with_cancel("hi", token).await else {
            bail!("expected the cancelled send to fail");
        };

        assert_eq!(error.code, ChatErrorCode::Aborted);
        assert!(!error.retryable);
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(session.messages().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn an_error_chunk_mid_stream_discards_the_partial_message() -> Result<()> {
        let transport = ScriptedTransport::new(vec![reads(&[
            "{\"content\":\"par\"}\n",
            "{\"error\":{\"message\":\"model went away\",\"code\":\"upstream_error\"},\"done\":true}\n",
        ])]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 0);

        let Err(error) = session.send_message("hi").await else {
            bail!("expected the errored stream to fail");
        };

        assert_eq!(error.code, ChatErrorCode::UnknownError);
        assert_eq!(transport.calls(), 1);
        assert_eq!(session.messages().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() -> Result<()> {
        let transport = ScriptedTransport::new(vec![reads(&[
            "garbage\n{\"content\":\"ok\"}\n",
            "{\"done\":true}\n",
        ])]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport, sink, 3);

        session.send_message("hi").await?;
        assert_eq!(session.messages()[1].content, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn blank_input_is_ignored() -> Result<()> {
        let transport = ScriptedTransport::new(vec![]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        session.send_message("   ").await?;

        assert!(session.messages().is_empty());
        assert_eq!(transport.calls(), 0);
        assert_eq!(session.phase(), SessionPhase::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn retry_last_message_reissues_the_prompt() -> Result<()> {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::Status {
                status: 400,
                message: "bad".to_string(),
            }),
            reads(&["{\"content\":\"recovered\"}\n", "{\"done\":true}\n"]),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let mut session = session(transport.clone(), sink, 3);

        assert!(session.send_message("try this").await.is_err());
        session.retry_last_message().await?;

        assert_eq!(transport.calls(), 2);
        assert_eq!(session.phase(), SessionPhase::Idle);
        let messages = session.messages();
        // Manual retry appends a fresh user turn, like the first send.
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "recovered");
        Ok(())
    }

    #[test]
    fn backoff_grows_linearly_with_the_attempt_number() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(300));
    }
}
