pub mod api;
pub mod config;
pub mod error;
pub mod inference;
pub mod orchestration;
pub mod session;
pub mod tensor;

pub use api::client::EngineClient;
pub use api::types::{ErrorInfo, ModelStatus, Outcome, OutputSet, UserEvent};
pub use error::{BridgeError, Result};
pub use session::{
    CancelToken, ChatSession, ChatTurn, Completion, PollEvent, PollPolicy, SessionState,
};
pub use tensor::{DataType, Tensor, TensorMap};
