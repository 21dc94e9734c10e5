//! Multi-turn streaming chat against an engine.
//!
//! A turn goes `Idle → PromptSubmitted → Streaming → Completed`, and
//! `clear_prompt` brings the session back to `Idle` from any state. A collect
//! that hits its deadline or is cancelled leaves the session `Aborted`. The
//! engine is asked for the next chunk of text with `get_next_str` until it
//! answers with a `finished` marker; chunks are appended in arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::api::client::EngineClient;
use crate::api::types::OutputSet;
use crate::error::{BridgeError, Result};
use crate::tensor::{Tensor, TensorMap};

pub const PROMPT_METHOD: &str = "prompt_llm";
pub const NEXT_STR_METHOD: &str = "get_next_str";
pub const CLEAR_METHOD: &str = "clear_prompt";
pub const SET_CONTEXT_METHOD: &str = "set_context";

/// Output carrying the next chunk of generated text.
pub const STR_OUTPUT: &str = "str";
/// Output marking the end of generation.
pub const FINISHED_OUTPUT: &str = "finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PromptSubmitted,
    Streaming,
    Completed,
    /// Collecting stopped early; a chunk may have been handed out and lost.
    Aborted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::PromptSubmitted => write!(f, "prompt submitted"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// One conversation turn, in the shape the engine's `context` input expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(rename = "type")]
    pub role: String,
    pub message: String,
}

impl ChatTurn {
    pub fn user(message: impl Into<String>) -> Self {
        ChatTurn {
            role: "user".to_string(),
            message: message.into(),
        }
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        ChatTurn {
            role: "assistant".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Chunk(String),
    Finished,
}

/// Timing of the polling loops. Durations are milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Wait between submitting a prompt and the first poll.
    #[serde(rename = "initialDelayMs", with = "millis")]
    pub initial_delay: Duration,
    #[serde(rename = "intervalMs", with = "millis")]
    pub interval: Duration,
    /// Upper bound on collecting one reply; `None` waits forever.
    #[serde(rename = "deadlineMs", with = "opt_millis")]
    pub deadline: Option<Duration>,
    /// Wait between readiness checks.
    #[serde(rename = "readyIntervalMs", with = "millis")]
    pub ready_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            initial_delay: Duration::from_millis(500),
            interval: Duration::from_millis(200),
            deadline: Some(Duration::from_secs(120)),
            ready_interval: Duration::from_secs(10),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Caller-side abort switch for a session's polling.
///
/// Once cancelled a token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// A finished reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Non-empty chunks appended.
    pub chunks: usize,
    /// `get_next_str` calls made, including the final one.
    pub polls: usize,
    pub elapsed_ms: f64,
}

pub struct ChatSession {
    client: EngineClient,
    policy: PollPolicy,
    state: SessionState,
    transcript: String,
    chunks: usize,
    polls: usize,
    pending_prompt: Option<String>,
    history: Vec<ChatTurn>,
    cancel: CancelToken,
    started: Option<Instant>,
}

impl ChatSession {
    pub fn new(client: EngineClient, policy: PollPolicy) -> Self {
        ChatSession {
            client,
            policy,
            state: SessionState::Idle,
            transcript: String::new(),
            chunks: 0,
            polls: 0,
            pending_prompt: None,
            history: Vec::new(),
            cancel: CancelToken::new(),
            started: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Text received so far in the current turn.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Completed turns, oldest first.
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Install a fresh token, e.g. after a cancelled turn, and return it.
    pub fn replace_cancel_token(&mut self) -> CancelToken {
        self.cancel = CancelToken::new();
        self.cancel.clone()
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Hand `text` to the engine, which starts generating in the background.
    pub async fn submit_prompt(&mut self, text: &str) -> Result<()> {
        self.expect_state("submit a prompt", &[SessionState::Idle])?;

        let inputs = TensorMap::from([("query".to_string(), Tensor::string("query", text))]);
        self.client
            .invoke::<()>(PROMPT_METHOD, inputs)
            .await?
            .into_result()?;

        self.transcript.clear();
        self.chunks = 0;
        self.polls = 0;
        self.pending_prompt = Some(text.to_string());
        self.started = Some(Instant::now());
        self.state = SessionState::PromptSubmitted;
        tracing::info!("[session] prompt submitted ({} chars)", text.len());
        Ok(())
    }

    /// Ask the engine for the next chunk once.
    pub async fn poll(&mut self) -> Result<PollEvent> {
        self.expect_state(
            "poll for output",
            &[SessionState::PromptSubmitted, SessionState::Streaming],
        )?;

        let outputs: OutputSet = self
            .client
            .invoke(NEXT_STR_METHOD, TensorMap::new())
            .await?
            .into_result()?;
        self.polls += 1;

        if outputs.contains(FINISHED_OUTPUT) {
            self.finish_turn();
            return Ok(PollEvent::Finished);
        }

        let Some(tensor) = outputs.get(STR_OUTPUT) else {
            tracing::warn!(
                "[session] poll {} carried neither `{}` nor `{}`",
                self.polls,
                STR_OUTPUT,
                FINISHED_OUTPUT
            );
            return Err(BridgeError::UnsupportedPayloadType(NEXT_STR_METHOD.to_string()));
        };
        let chunk = tensor
            .as_str()
            .ok_or_else(|| BridgeError::malformed("data.outputs.str", "is not a string scalar"))?;

        self.state = SessionState::Streaming;
        if !chunk.is_empty() {
            self.transcript.push_str(chunk);
            self.chunks += 1;
        }
        Ok(PollEvent::Chunk(chunk.to_string()))
    }

    fn finish_turn(&mut self) {
        self.state = SessionState::Completed;
        if let Some(prompt) = self.pending_prompt.take() {
            self.history.push(ChatTurn::user(prompt));
            self.history.push(ChatTurn::assistant(self.transcript.clone()));
        }
        tracing::info!(
            "[session] reply complete: {} chunks over {} polls",
            self.chunks,
            self.polls
        );
    }

    /// Poll until the engine reports the reply finished.
    ///
    /// Bounded by the policy deadline and by the session's cancel token.
    /// Hitting either drops any in-flight poll, so the session moves to
    /// `Aborted` and only `clear_prompt` is accepted afterwards.
    pub async fn collect(&mut self) -> Result<Completion> {
        self.expect_state(
            "collect a reply",
            &[SessionState::PromptSubmitted, SessionState::Streaming],
        )?;

        let cancel = self.cancel.clone();
        let deadline = self.policy.deadline;
        let stream = self.stream_until_finished();
        let bounded = async move {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, stream).await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::DeadlineExceeded {
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => stream.await,
            }
        };

        let result: Result<()> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            result = bounded => result,
        };
        if let Err(e) = &result {
            if matches!(
                e,
                BridgeError::DeadlineExceeded { .. } | BridgeError::Cancelled
            ) {
                self.state = SessionState::Aborted;
            }
            tracing::warn!("[session] stopped collecting after {} polls: {}", self.polls, e);
        }
        result?;
        Ok(self.completion())
    }

    async fn stream_until_finished(&mut self) -> Result<()> {
        if self.state == SessionState::PromptSubmitted {
            tokio::time::sleep(self.policy.initial_delay).await;
        }
        loop {
            if self.poll().await? == PollEvent::Finished {
                return Ok(());
            }
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    fn completion(&self) -> Completion {
        Completion {
            text: self.transcript.clone(),
            chunks: self.chunks,
            polls: self.polls,
            elapsed_ms: self
                .started
                .map(|t0| t0.elapsed().as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
        }
    }

    /// Submit `text` and wait for the whole reply.
    pub async fn ask(&mut self, text: &str) -> Result<Completion> {
        self.submit_prompt(text).await?;
        self.collect().await
    }

    /// Reset the engine's conversation state and return to `Idle`.
    pub async fn clear_prompt(&mut self) -> Result<()> {
        let inputs = TensorMap::from([(
            "context".to_string(),
            Tensor::json_array("context", Vec::new()),
        )]);
        self.client
            .invoke::<()>(CLEAR_METHOD, inputs)
            .await?
            .into_result()?;

        tracing::debug!("[session] cleared from state {}", self.state);
        self.state = SessionState::Idle;
        self.transcript.clear();
        self.chunks = 0;
        self.polls = 0;
        self.pending_prompt = None;
        self.started = None;
        Ok(())
    }

    /// Replace the engine's conversation context with `turns`.
    pub async fn set_context(&mut self, turns: &[ChatTurn]) -> Result<()> {
        self.expect_state("set the context", &[SessionState::Idle])?;

        let items = turns
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let inputs = TensorMap::from([(
            "context".to_string(),
            Tensor::json_array("context", items),
        )]);
        self.client
            .invoke::<()>(SET_CONTEXT_METHOD, inputs)
            .await?
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::inference::{error_response, ok_response, NativeEngine};
    use crate::orchestration::EngineWorker;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned `get_next_str` answers and logs every call.
    struct ScriptedEngine {
        polls: VecDeque<Value>,
        repeat_last: bool,
        calls: Arc<Mutex<Vec<(String, TensorMap)>>>,
        /// Sleep before answering the n-th `get_next_str` (zero-based).
        slow_poll: Option<(usize, Duration)>,
        served: usize,
    }

    impl NativeEngine for ScriptedEngine {
        fn engine_name(&self) -> &str {
            "scripted"
        }

        fn initialize(&mut self, _config: &EngineConfig) -> Value {
            ok_response(None)
        }

        fn is_ready(&mut self) -> Value {
            ok_response(Some(json!({"isModelReady": true, "version": "s"})))
        }

        fn run_method(&mut self, method: &str, inputs: &TensorMap) -> Value {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), inputs.clone()));
            if method != NEXT_STR_METHOD {
                return ok_response(None);
            }
            if let Some((n, delay)) = self.slow_poll {
                if n == self.served {
                    std::thread::sleep(delay);
                }
            }
            self.served += 1;
            match (self.polls.len(), self.repeat_last) {
                (0, _) => error_response(9, "script exhausted"),
                (1, true) => self.polls[0].clone(),
                _ => self.polls.pop_front().unwrap_or(Value::Null),
            }
        }

        fn add_event(&mut self, _event_json: &str, _event_type: &str) -> Value {
            ok_response(None)
        }
    }

    fn chunk(text: &str) -> Value {
        ok_response(Some(OutputSet::new([Tensor::string(STR_OUTPUT, text)]).to_wire()))
    }

    fn finished() -> Value {
        ok_response(Some(OutputSet::new([Tensor::bool(FINISHED_OUTPUT, true)]).to_wire()))
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::ZERO,
            interval: Duration::ZERO,
            deadline: Some(Duration::from_secs(5)),
            ready_interval: Duration::ZERO,
        }
    }

    type CallLog = Arc<Mutex<Vec<(String, TensorMap)>>>;

    fn session_with(polls: Vec<Value>, repeat_last: bool, policy: PollPolicy) -> (ChatSession, EngineWorker, CallLog) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let worker = EngineWorker::spawn(ScriptedEngine {
            polls: polls.into(),
            repeat_last,
            calls: calls.clone(),
            slow_poll: None,
            served: 0,
        })
        .unwrap();
        let session = ChatSession::new(EngineClient::new(worker.handle()), policy);
        (session, worker, calls)
    }

    fn poll_count(calls: &CallLog) -> usize {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == NEXT_STR_METHOD)
            .count()
    }

    #[tokio::test]
    async fn chunks_concatenate_in_arrival_order() {
        let (mut session, worker, calls) =
            session_with(vec![chunk("Hel"), chunk("lo"), finished()], false, fast_policy());

        let completion = session.ask("greet me").await.unwrap();
        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.polls, 3);
        assert_eq!(completion.chunks, 2);
        assert_eq!(poll_count(&calls), 3);
        assert_eq!(session.state(), SessionState::Completed);

        let (method, inputs) = calls.lock().unwrap()[0].clone();
        assert_eq!(method, PROMPT_METHOD);
        assert_eq!(inputs["query"].as_str(), Some("greet me"));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let (mut session, worker, _) =
            session_with(vec![chunk(""), chunk("a"), finished()], false, fast_policy());
        let completion = session.ask("q").await.unwrap();
        assert_eq!(completion.text, "a");
        assert_eq!(completion.chunks, 1);
        assert_eq!(completion.polls, 3);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn poll_without_str_or_finished_is_unsupported() {
        let other = ok_response(Some(OutputSet::new([Tensor::ints("ids", vec![1])]).to_wire()));
        let (mut session, worker, _) = session_with(vec![other], false, fast_policy());

        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedPayloadType(ref m) if m == NEXT_STR_METHOD));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn poll_without_payload_is_malformed() {
        let (mut session, worker, _) =
            session_with(vec![json!({"status": true})], false, fast_policy());
        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse { ref field, .. } if field == "data"));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn engine_failure_during_poll_is_reported() {
        let (mut session, worker, _) =
            session_with(vec![chunk("a"), error_response(42, "overheated")], false, fast_policy());
        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::EngineReportedFailure(ref e) if e.code == 42));
        assert_eq!(session.transcript(), "a");
        assert_eq!(session.state(), SessionState::Streaming);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn state_transitions_are_enforced() {
        let (mut session, worker, _) = session_with(
            vec![finished(), chunk("again"), finished()],
            false,
            fast_policy(),
        );

        assert!(matches!(
            session.poll().await,
            Err(BridgeError::InvalidState { state: SessionState::Idle, .. })
        ));

        session.ask("first").await.unwrap();
        assert!(matches!(
            session.submit_prompt("too soon").await,
            Err(BridgeError::InvalidState { state: SessionState::Completed, .. })
        ));
        assert!(session.set_context(&[]).await.is_err());

        session.clear_prompt().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        let completion = session.ask("second").await.unwrap();
        assert_eq!(completion.text, "again");
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn history_records_completed_turns() {
        let (mut session, worker, calls) =
            session_with(vec![chunk("Hi"), finished()], false, fast_policy());
        session.ask("hello").await.unwrap();
        assert_eq!(
            session.history(),
            &[ChatTurn::user("hello"), ChatTurn::assistant("Hi")]
        );

        session.clear_prompt().await.unwrap();
        let turns = session.history().to_vec();
        session.set_context(&turns).await.unwrap();

        let (method, inputs) = calls.lock().unwrap().last().cloned().unwrap();
        assert_eq!(method, SET_CONTEXT_METHOD);
        let context = &inputs["context"];
        assert_eq!(context.shape, vec![2]);
        assert_eq!(
            context.as_json().unwrap()[0],
            json!({"type": "user", "message": "hello"})
        );
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn deadline_bounds_a_stream_that_never_finishes() {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            deadline: Some(Duration::from_millis(30)),
            ..fast_policy()
        };
        let (mut session, worker, calls) = session_with(vec![chunk("x")], true, policy);

        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded { timeout_ms: 30 }));
        assert!(poll_count(&calls) >= 1);
        assert!(session.transcript().starts_with('x'));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn collect_after_deadline_is_rejected() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let worker = EngineWorker::spawn(ScriptedEngine {
            polls: vec![chunk("A"), chunk("B"), chunk("C"), finished()].into(),
            repeat_last: false,
            calls: calls.clone(),
            slow_poll: Some((1, Duration::from_millis(80))),
            served: 0,
        })
        .unwrap();
        let policy = PollPolicy {
            deadline: Some(Duration::from_millis(40)),
            ..fast_policy()
        };
        let mut session = ChatSession::new(EngineClient::new(worker.handle()), policy);

        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded { timeout_ms: 40 }));
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(session.transcript(), "A");

        // "B" was handed out while nobody waited for it; resuming would skip it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            session.collect().await,
            Err(BridgeError::InvalidState { state: SessionState::Aborted, .. })
        ));
        assert!(matches!(
            session.poll().await,
            Err(BridgeError::InvalidState { state: SessionState::Aborted, .. })
        ));
        assert!(session.submit_prompt("again").await.is_err());

        session.clear_prompt().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            deadline: None,
            ..fast_policy()
        };
        let (mut session, worker, _) = session_with(vec![chunk("x")], true, policy);

        let token = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = session.ask("q").await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(session.state(), SessionState::Aborted);

        // A cancelled token stays cancelled until replaced.
        session.clear_prompt().await.unwrap();
        session.submit_prompt("q").await.unwrap();
        assert!(matches!(session.collect().await, Err(BridgeError::Cancelled)));
        let fresh = session.replace_cancel_token();
        assert!(!fresh.is_cancelled());
        worker.shutdown().await;
    }

    #[test]
    fn poll_policy_uses_milliseconds() {
        let policy: PollPolicy =
            serde_json::from_str(r#"{"intervalMs": 50, "deadlineMs": null}"#).unwrap();
        assert_eq!(policy.interval, Duration::from_millis(50));
        assert_eq!(policy.deadline, None);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));

        let value = serde_json::to_value(PollPolicy::default()).unwrap();
        assert_eq!(value["deadlineMs"], 120_000);
        assert_eq!(value["readyIntervalMs"], 10_000);
    }
}
