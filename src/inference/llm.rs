use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;

use super::{error_response, ok_response, NativeEngine};
use crate::api::types::{ModelStatus, OutputSet, UserEvent};
use crate::config::EngineConfig;
use crate::session::{
    ChatTurn, CLEAR_METHOD, FINISHED_OUTPUT, NEXT_STR_METHOD, PROMPT_METHOD, SET_CONTEXT_METHOD,
    STR_OUTPUT,
};
use crate::tensor::{Tensor, TensorMap};

pub const ERR_NOT_INITIALIZED: i64 = 1001;
pub const ERR_NOT_READY: i64 = 1002;
pub const ERR_UNKNOWN_METHOD: i64 = 1003;
pub const ERR_BAD_INPUT: i64 = 1004;
pub const ERR_BUSY: i64 = 1005;

/// Produces the assistant reply for a query given the conversation so far.
pub type Responder = Box<dyn FnMut(&str, &[ChatTurn]) -> String + Send>;

/// In-process engine speaking the chat method protocol.
///
/// Replies come from a [`Responder`] (an echo by default) and are streamed
/// back one word per `get_next_str` call, followed by a `finished` marker.
pub struct LoopbackLlm {
    model_id: String,
    version: String,
    initialized: bool,
    session_id: String,
    warmup_remaining: usize,
    context: Vec<ChatTurn>,
    pending: VecDeque<String>,
    generating: bool,
    last_prompt: Option<String>,
    responder: Responder,
    events: Vec<UserEvent>,
    started: Option<Instant>,
}

impl LoopbackLlm {
    pub fn new(model_id: &str) -> Self {
        LoopbackLlm {
            model_id: model_id.to_string(),
            version: "1.0.0".to_string(),
            initialized: false,
            session_id: String::new(),
            warmup_remaining: 0,
            context: Vec::new(),
            pending: VecDeque::new(),
            generating: false,
            last_prompt: None,
            responder: Box::new(|query, _| format!("You said: {query}")),
            events: Vec::new(),
            started: None,
        }
    }

    pub fn with_responder(
        mut self,
        responder: impl FnMut(&str, &[ChatTurn]) -> String + Send + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    /// Report "not ready" for the first `queries` readiness checks.
    pub fn with_warmup(mut self, queries: usize) -> Self {
        self.warmup_remaining = queries;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The last chat-formatted prompt built for generation.
    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    pub fn context(&self) -> &[ChatTurn] {
        &self.context
    }

    pub fn events(&self) -> &[UserEvent] {
        &self.events
    }

    fn prompt(&mut self, inputs: &TensorMap) -> Value {
        let Some(query) = inputs.get("query").and_then(Tensor::as_str) else {
            return error_response(ERR_BAD_INPUT, "prompt_llm needs a string `query` input");
        };
        if self.generating {
            return error_response(ERR_BUSY, "a reply is still being generated");
        }

        let prompt = format_chatml_prompt(&self.context, query);
        let reply = (self.responder)(query, &self.context);
        tracing::debug!(
            "[{}] prompt of {} chars, reply of {} chars",
            self.model_id,
            prompt.len(),
            reply.len()
        );

        self.pending = split_chunks(&reply).into();
        self.generating = true;
        self.last_prompt = Some(prompt);
        self.started = Some(Instant::now());
        self.context.push(ChatTurn::user(query));
        self.context.push(ChatTurn::assistant(reply));
        ok_response(None)
    }

    fn next_str(&mut self) -> Value {
        let output = match self.pending.pop_front() {
            Some(chunk) => Tensor::string(STR_OUTPUT, chunk),
            None => {
                if self.generating {
                    if let Some(t0) = self.started.take() {
                        tracing::debug!(
                            "[{}] generation drained in {:.1}ms",
                            self.model_id,
                            t0.elapsed().as_secs_f64() * 1000.0
                        );
                    }
                }
                self.generating = false;
                Tensor::bool(FINISHED_OUTPUT, true)
            }
        };
        ok_response(Some(OutputSet::new([output]).to_wire()))
    }

    fn clear(&mut self) -> Value {
        self.pending.clear();
        self.generating = false;
        self.started = None;
        self.context.clear();
        ok_response(None)
    }

    fn set_context(&mut self, inputs: &TensorMap) -> Value {
        let Some(items) = inputs.get("context").and_then(Tensor::as_json) else {
            return error_response(ERR_BAD_INPUT, "set_context needs a JSON `context` input");
        };
        match serde_json::from_value::<Vec<ChatTurn>>(items.clone()) {
            Ok(turns) => {
                self.context = turns;
                ok_response(None)
            }
            Err(e) => error_response(ERR_BAD_INPUT, format!("invalid context: {e}")),
        }
    }
}

impl NativeEngine for LoopbackLlm {
    fn engine_name(&self) -> &str {
        "loopback-llm"
    }

    fn initialize(&mut self, config: &EngineConfig) -> Value {
        if let Err(e) = config.validate() {
            return error_response(ERR_BAD_INPUT, e.to_string());
        }
        let mut config = config.clone();
        self.session_id = config.ensure_session_id().to_string();
        self.initialized = true;
        tracing::info!(
            "[{}] initialized for device '{}' (session {})",
            self.model_id,
            config.device_id,
            self.session_id
        );
        ok_response(None)
    }

    fn is_ready(&mut self) -> Value {
        if !self.initialized {
            return error_response(ERR_NOT_INITIALIZED, "engine is not initialized");
        }
        let is_ready = if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            false
        } else {
            true
        };
        let status = ModelStatus {
            is_ready,
            version: self.version.clone(),
        };
        ok_response(Some(status.to_wire()))
    }

    fn run_method(&mut self, method: &str, inputs: &TensorMap) -> Value {
        if !self.initialized {
            return error_response(ERR_NOT_INITIALIZED, "engine is not initialized");
        }
        if self.warmup_remaining > 0 {
            return error_response(ERR_NOT_READY, "model is still loading");
        }
        match method {
            PROMPT_METHOD => self.prompt(inputs),
            NEXT_STR_METHOD => self.next_str(),
            CLEAR_METHOD => self.clear(),
            SET_CONTEXT_METHOD => self.set_context(inputs),
            other => error_response(ERR_UNKNOWN_METHOD, format!("unknown method '{other}'")),
        }
    }

    fn add_event(&mut self, event_json: &str, event_type: &str) -> Value {
        if !self.initialized {
            return error_response(ERR_NOT_INITIALIZED, "engine is not initialized");
        }
        let event = UserEvent {
            event_json: Some(event_json.to_string()),
            event_type: Some(event_type.to_string()),
        };
        let wire = event.to_wire();
        self.events.push(event);
        ok_response(Some(wire))
    }
}

/// Render the conversation plus the new query in ChatML.
pub fn format_chatml_prompt(context: &[ChatTurn], query: &str) -> String {
    let mut prompt = String::new();
    for turn in context {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            turn.role, turn.message
        ));
    }
    prompt.push_str(&format!("<|im_start|>user\n{query}<|im_end|>\n"));
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// Split text into word chunks that concatenate back to the input.
fn split_chunks(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}
