pub mod llm;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::tensor::TensorMap;

/// Request routed to the engine worker thread.
///
/// Every variant carries a oneshot sender for the raw response map.
pub enum EngineRequest {
    Initialize {
        config: EngineConfig,
        response_tx: tokio::sync::oneshot::Sender<Value>,
    },
    IsReady {
        response_tx: tokio::sync::oneshot::Sender<Value>,
    },
    RunMethod {
        method: String,
        inputs: TensorMap,
        response_tx: tokio::sync::oneshot::Sender<Value>,
    },
    AddEvent {
        event_json: String,
        event_type: String,
        response_tx: tokio::sync::oneshot::Sender<Value>,
    },
    /// Shutdown
    Shutdown,
}

impl EngineRequest {
    pub fn label(&self) -> &str {
        match self {
            EngineRequest::Initialize { .. } => "initialize",
            EngineRequest::IsReady { .. } => "is_ready",
            EngineRequest::RunMethod { method, .. } => method,
            EngineRequest::AddEvent { .. } => "add_event",
            EngineRequest::Shutdown => "shutdown",
        }
    }
}

/// The native inference runtime.
///
/// Implementations answer with the raw `{status, error?, data?}` map; the
/// caller decodes it. Calls are made from a single worker thread, one at a
/// time.
pub trait NativeEngine: Send {
    fn engine_name(&self) -> &str;

    fn initialize(&mut self, config: &EngineConfig) -> Value;

    /// Answers with `data: {isModelReady, version}`.
    fn is_ready(&mut self) -> Value;

    fn run_method(&mut self, method: &str, inputs: &TensorMap) -> Value;

    /// Answers with `data: {eventJsonString, eventType}`.
    fn add_event(&mut self, event_json: &str, event_type: &str) -> Value;
}

/// Successful response map with optional data.
pub fn ok_response(data: Option<Value>) -> Value {
    match data {
        Some(data) => serde_json::json!({"status": true, "data": data}),
        None => serde_json::json!({"status": true}),
    }
}

/// Failed response map.
pub fn error_response(code: i64, message: impl Into<String>) -> Value {
    serde_json::json!({
        "status": false,
        "error": {"code": code, "message": message.into()},
    })
}
