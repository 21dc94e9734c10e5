use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};
use crate::tensor::Tensor;

// ============================================================================
// Error
// ============================================================================

/// Error details reported by the engine on a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i64,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_wire(map: &Value) -> Result<Self> {
        let map = map
            .as_object()
            .ok_or_else(|| BridgeError::malformed("error", "is not a map"))?;
        let code = map
            .get("code")
            .and_then(Value::as_i64)
            .ok_or_else(|| BridgeError::malformed("error.code", "is missing or not an integer"))?;
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::malformed("error.message", "is missing or not a string"))?;
        Ok(ErrorInfo {
            code,
            message: message.to_string(),
        })
    }

    pub fn to_wire(&self) -> Value {
        json!({"code": self.code, "message": self.message})
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

// ============================================================================
// Model status
// ============================================================================

/// Point-in-time readiness snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub is_ready: bool,
    pub version: String,
}

impl ModelStatus {
    pub fn from_wire(map: &Value) -> Result<Self> {
        let is_ready = map
            .get("isModelReady")
            .and_then(Value::as_bool)
            .ok_or_else(|| BridgeError::malformed("data.isModelReady", "is missing or not a bool"))?;
        let version = map
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::malformed("data.version", "is missing or not a string"))?;
        Ok(ModelStatus {
            is_ready,
            version: version.to_string(),
        })
    }

    pub fn to_wire(&self) -> Value {
        json!({"isModelReady": self.is_ready, "version": self.version})
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model ready: {}, version: {}", self.is_ready, self.version)
    }
}

// ============================================================================
// User events
// ============================================================================

/// An application event recorded by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub event_json: Option<String>,
    pub event_type: Option<String>,
}

impl UserEvent {
    pub fn from_wire(map: &Value) -> Result<Self> {
        if !map.is_object() {
            return Err(BridgeError::malformed("data", "is not a user event map"));
        }
        Ok(UserEvent {
            event_json: optional_str(map, "eventJsonString")?,
            event_type: optional_str(map, "eventType")?,
        })
    }

    pub fn to_wire(&self) -> Value {
        json!({"eventJsonString": self.event_json, "eventType": self.event_type})
    }
}

fn optional_str(map: &Value, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(BridgeError::malformed(format!("data.{key}"), "is not a string")),
    }
}

// ============================================================================
// Output sets
// ============================================================================

/// Tensors returned by one method invocation, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSet {
    tensors: HashMap<String, Tensor>,
}

impl OutputSet {
    pub fn new(tensors: impl IntoIterator<Item = Tensor>) -> Self {
        OutputSet {
            tensors: tensors.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Decode `{outputs: {name: tensor-map}, size}`; `size` must equal the
    /// number of tensors.
    pub fn from_wire(map: &Value) -> Result<Self> {
        let outputs = map
            .get("outputs")
            .and_then(Value::as_object)
            .ok_or_else(|| BridgeError::malformed("data.outputs", "is missing or not a map"))?;
        let declared = map
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                BridgeError::malformed("data.size", "is missing or not a non-negative integer")
            })?;

        let tensors = outputs
            .iter()
            .map(|(name, value)| Ok((name.clone(), Tensor::from_wire(name, value)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        if declared != tensors.len() as u64 {
            return Err(BridgeError::malformed(
                "data.size",
                format!("declares {declared} outputs but {} were sent", tensors.len()),
            ));
        }

        Ok(OutputSet { tensors })
    }

    pub fn to_wire(&self) -> Value {
        let outputs: serde_json::Map<String, Value> = self
            .tensors
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.to_wire()))
            .collect();
        json!({"outputs": outputs, "size": self.tensors.len()})
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn into_map(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

impl std::fmt::Display for OutputSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "OutputSet ({} outputs):", self.tensors.len())?;
        let mut names: Vec<&String> = self.tensors.keys().collect();
        names.sort();
        for name in names {
            writeln!(f, "    {}", self.tensors[name])?;
        }
        Ok(())
    }
}

// ============================================================================
// Payloads and results
// ============================================================================

/// What the caller expects in the `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Outputs,
    ModelStatus,
    Scalar,
    UserEvent,
    /// Acknowledgement only; `data` is not interpreted.
    Ack,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::Outputs => write!(f, "outputs"),
            PayloadKind::ModelStatus => write!(f, "model status"),
            PayloadKind::Scalar => write!(f, "scalar"),
            PayloadKind::UserEvent => write!(f, "user event"),
            PayloadKind::Ack => write!(f, "acknowledgement"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Outputs(OutputSet),
    ModelStatus(ModelStatus),
    Scalar(i64),
    UserEvent(UserEvent),
}

/// A response decoded field by field, without cross-field checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: bool,
    pub error: Option<ErrorInfo>,
    pub payload: Option<Payload>,
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response - status: {}", self.status)?;
        if let Some(error) = &self.error {
            write!(f, ", {error}")?;
        }
        match &self.payload {
            Some(Payload::Outputs(outputs)) => write!(f, ", data: {} outputs", outputs.len()),
            Some(Payload::ModelStatus(status)) => write!(f, ", data: {status}"),
            Some(Payload::Scalar(n)) => write!(f, ", data: {n}"),
            Some(Payload::UserEvent(event)) => write!(
                f,
                ", data: event type {}",
                event.event_type.as_deref().unwrap_or("<none>")
            ),
            None => Ok(()),
        }
    }
}

/// Either a payload or the engine's error. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(ErrorInfo),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ErrorInfo> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(e) => Some(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Failure(e) => Outcome::Failure(e),
        }
    }

    /// Turn an engine-reported failure into [`BridgeError::EngineReportedFailure`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::Failure(e) => Err(BridgeError::EngineReportedFailure(e)),
        }
    }
}
