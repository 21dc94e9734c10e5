use std::time::Duration;

use serde_json::Value;

use super::decode::{decode, FromPayload};
use super::types::{ModelStatus, Outcome, UserEvent};
use crate::config::EngineConfig;
use crate::error::{BridgeError, Result};
use crate::orchestration::EngineHandle;
use crate::tensor::TensorMap;

/// Typed calls against an engine worker.
///
/// Engine-reported failures come back as [`Outcome::Failure`]; only transport
/// and decode problems are errors.
#[derive(Clone)]
pub struct EngineClient {
    handle: EngineHandle,
}

impl EngineClient {
    pub fn new(handle: EngineHandle) -> Self {
        EngineClient { handle }
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Validate `config`, assign a session id if it has none, and initialize
    /// the engine with it.
    pub async fn initialize(&self, config: &EngineConfig) -> Result<Outcome<()>> {
        config.validate()?;
        let mut config = config.clone();
        config.ensure_session_id();
        tracing::info!(
            "initializing {} (session {}, online: {})",
            self.handle.engine_name(),
            config.session_id,
            config.online
        );
        let raw = self.handle.initialize(config).await?;
        decode(&raw)
    }

    pub async fn is_ready(&self) -> Result<Outcome<ModelStatus>> {
        let raw = self.handle.is_ready().await?;
        decode(&raw)
    }

    /// Run `method` with `inputs`, decoding the response as `T`.
    pub async fn invoke<T: FromPayload>(&self, method: &str, inputs: TensorMap) -> Result<Outcome<T>> {
        tracing::debug!("invoke {} with {} inputs", method, inputs.len());
        let raw = self.handle.run_method(method, inputs).await?;
        decode(&raw)
    }

    pub async fn add_event(&self, event: &Value, event_type: &str) -> Result<Outcome<UserEvent>> {
        let event_json = serde_json::to_string(event)?;
        let raw = self
            .handle
            .add_event(event_json, event_type.to_string())
            .await?;
        decode(&raw)
    }

    /// Query readiness every `interval` until the model reports ready.
    ///
    /// Failed readiness queries count as "not ready yet".
    pub async fn wait_until_ready(
        &self,
        interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<ModelStatus> {
        let wait = self.poll_ready(interval);

        match deadline {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                BridgeError::DeadlineExceeded {
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => wait.await,
        }
    }

    async fn poll_ready(&self, interval: Duration) -> Result<ModelStatus> {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match self.is_ready().await? {
                Outcome::Success(status) if status.is_ready => {
                    tracing::info!("model ready after {} checks ({})", attempts, status);
                    return Ok(status);
                }
                Outcome::Success(status) => tracing::debug!("not ready yet: {}", status),
                Outcome::Failure(error) => tracing::debug!("readiness check failed: {}", error),
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::OutputSet;
    use crate::inference::llm::{LoopbackLlm, ERR_NOT_INITIALIZED, ERR_UNKNOWN_METHOD};
    use crate::orchestration::EngineWorker;
    use serde_json::json;

    #[tokio::test]
    async fn initialize_rejects_invalid_config_locally() {
        let worker = EngineWorker::spawn(LoopbackLlm::new("t")).unwrap();
        let client = EngineClient::new(worker.handle());
        let config = EngineConfig {
            online: true,
            ..EngineConfig::default()
        };
        assert!(matches!(
            client.initialize(&config).await,
            Err(BridgeError::Config(_))
        ));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn readiness_follows_initialization() {
        let worker = EngineWorker::spawn(LoopbackLlm::new("t").with_warmup(2)).unwrap();
        let client = EngineClient::new(worker.handle());

        let before = client.is_ready().await.unwrap();
        assert_eq!(before.failure().map(|e| e.code), Some(ERR_NOT_INITIALIZED));

        assert!(client.initialize(&EngineConfig::default()).await.unwrap().is_success());
        let status = client
            .wait_until_ready(Duration::from_millis(1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(status.is_ready);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn wait_until_ready_times_out() {
        let worker = EngineWorker::spawn(LoopbackLlm::new("t")).unwrap();
        let client = EngineClient::new(worker.handle());
        // Never initialized, so never ready.
        let err = client
            .wait_until_ready(Duration::from_millis(5), Some(Duration::from_millis(40)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded { timeout_ms: 40 }));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_surfaces_engine_failure_as_data() {
        let worker = EngineWorker::spawn(LoopbackLlm::new("t")).unwrap();
        let client = EngineClient::new(worker.handle());
        client.initialize(&EngineConfig::default()).await.unwrap();

        let outcome = client
            .invoke::<OutputSet>("missing_method", TensorMap::new())
            .await
            .unwrap();
        assert_eq!(outcome.failure().map(|e| e.code), Some(ERR_UNKNOWN_METHOD));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn add_event_serializes_payload() {
        let worker = EngineWorker::spawn(LoopbackLlm::new("t")).unwrap();
        let client = EngineClient::new(worker.handle());
        client.initialize(&EngineConfig::default()).await.unwrap();

        let event = client
            .add_event(&json!({"screen": "chat"}), "open")
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(event.event_json.as_deref(), Some(r#"{"screen":"chat"}"#));
        assert_eq!(event.event_type.as_deref(), Some("open"));
        worker.shutdown().await;
    }
}
