//! Decoding of raw engine responses.
//!
//! Every engine call answers with `{status, error?, data?}`. [`decode_response`]
//! reads those fields as they are; [`decode`] additionally requires them to
//! agree with each other and hands back a typed [`Outcome`].

use serde_json::Value;

use super::types::{
    ErrorInfo, ModelStatus, Outcome, OutputSet, Payload, PayloadKind, Response, UserEvent,
};
use crate::error::{BridgeError, Result};

/// Decode `raw`, interpreting `data` as `kind`.
pub fn decode_response(raw: &Value, kind: PayloadKind) -> Result<Response> {
    let status = raw
        .get("status")
        .ok_or_else(|| BridgeError::malformed("status", "is missing"))?
        .as_bool()
        .ok_or_else(|| BridgeError::malformed("status", "is not a bool"))?;

    let error = match raw.get("error") {
        None | Some(Value::Null) => None,
        Some(map) => Some(ErrorInfo::from_wire(map)?),
    };

    let payload = match raw.get("data") {
        None | Some(Value::Null) => None,
        Some(data) => decode_payload(data, kind)?,
    };

    Ok(Response {
        status,
        error,
        payload,
    })
}

fn decode_payload(data: &Value, kind: PayloadKind) -> Result<Option<Payload>> {
    Ok(match kind {
        PayloadKind::Outputs => Some(Payload::Outputs(OutputSet::from_wire(data)?)),
        PayloadKind::ModelStatus => Some(Payload::ModelStatus(ModelStatus::from_wire(data)?)),
        PayloadKind::Scalar => {
            let n = data
                .as_i64()
                .ok_or_else(|| BridgeError::malformed("data", "is not an integer"))?;
            Some(Payload::Scalar(n))
        }
        PayloadKind::UserEvent => Some(Payload::UserEvent(UserEvent::from_wire(data)?)),
        PayloadKind::Ack => None,
    })
}

/// Types that can be produced from a decoded payload.
pub trait FromPayload: Sized {
    const KIND: PayloadKind;

    /// `None` means the payload needed for this type is not there.
    fn from_payload(payload: Option<Payload>) -> Option<Self>;
}

impl FromPayload for OutputSet {
    const KIND: PayloadKind = PayloadKind::Outputs;

    fn from_payload(payload: Option<Payload>) -> Option<Self> {
        match payload {
            Some(Payload::Outputs(outputs)) => Some(outputs),
            _ => None,
        }
    }
}

impl FromPayload for ModelStatus {
    const KIND: PayloadKind = PayloadKind::ModelStatus;

    fn from_payload(payload: Option<Payload>) -> Option<Self> {
        match payload {
            Some(Payload::ModelStatus(status)) => Some(status),
            _ => None,
        }
    }
}

impl FromPayload for i64 {
    const KIND: PayloadKind = PayloadKind::Scalar;

    fn from_payload(payload: Option<Payload>) -> Option<Self> {
        match payload {
            Some(Payload::Scalar(n)) => Some(n),
            _ => None,
        }
    }
}

impl FromPayload for UserEvent {
    const KIND: PayloadKind = PayloadKind::UserEvent;

    fn from_payload(payload: Option<Payload>) -> Option<Self> {
        match payload {
            Some(Payload::UserEvent(event)) => Some(event),
            _ => None,
        }
    }
}

impl FromPayload for () {
    const KIND: PayloadKind = PayloadKind::Ack;

    fn from_payload(_: Option<Payload>) -> Option<Self> {
        Some(())
    }
}

impl Response {
    /// Check that status, error and payload agree and extract `T`.
    pub fn into_outcome<T: FromPayload>(self) -> Result<Outcome<T>> {
        match (self.status, self.error) {
            (true, Some(error)) => Err(BridgeError::malformed(
                "error",
                format!("is present on a successful response ({error})"),
            )),
            (false, None) => Err(BridgeError::malformed(
                "error",
                "is missing on a failed response",
            )),
            (false, Some(error)) => {
                if self.payload.is_some() {
                    tracing::debug!("ignoring data on failed response: {}", error);
                }
                Ok(Outcome::Failure(error))
            }
            (true, None) => T::from_payload(self.payload)
                .map(Outcome::Success)
                .ok_or_else(|| {
                    BridgeError::malformed(
                        "data",
                        format!("is missing on a successful {} response", T::KIND),
                    )
                }),
        }
    }
}

/// Decode `raw` as a `T` result.
pub fn decode<T: FromPayload>(raw: &Value) -> Result<Outcome<T>> {
    decode_response(raw, T::KIND)?.into_outcome()
}
