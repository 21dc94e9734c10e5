use std::thread::JoinHandle;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::{BridgeError, Result};
use crate::inference::{EngineRequest, NativeEngine};
use crate::tensor::TensorMap;

/// Depth of the request queue in front of the worker.
pub const REQUEST_QUEUE_DEPTH: usize = 16;

/// Cloneable async front door to an engine owned by a worker thread.
///
/// All clones feed the same queue, so calls reach the engine one at a time
/// in the order they were sent.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    engine_name: String,
}

/// Owns the worker thread for one engine.
pub struct EngineWorker {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Move `engine` onto a dedicated thread and start serving requests.
    pub fn spawn<E: NativeEngine + 'static>(engine: E) -> Result<Self> {
        let engine_name = engine.engine_name().to_string();
        let (tx, rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);

        let thread = std::thread::Builder::new()
            .name(format!("engine-{engine_name}"))
            .spawn(move || serve(engine, rx))?;

        Ok(EngineWorker {
            handle: EngineHandle { tx, engine_name },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Ask the worker to stop and wait for it.
    pub async fn shutdown(mut self) {
        // A closed queue means the worker is already gone.
        let _ = self.handle.tx.send(EngineRequest::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

fn serve<E: NativeEngine>(mut engine: E, mut rx: mpsc::Receiver<EngineRequest>) {
    tracing::info!("[worker] {} started", engine.engine_name());

    while let Some(req) = rx.blocking_recv() {
        let label = req.label().to_string();
        let t0 = Instant::now();

        let (response, response_tx) = match req {
            EngineRequest::Initialize {
                config,
                response_tx,
            } => (engine.initialize(&config), response_tx),
            EngineRequest::IsReady { response_tx } => (engine.is_ready(), response_tx),
            EngineRequest::RunMethod {
                method,
                inputs,
                response_tx,
            } => (engine.run_method(&method, &inputs), response_tx),
            EngineRequest::AddEvent {
                event_json,
                event_type,
                response_tx,
            } => (engine.add_event(&event_json, &event_type), response_tx),
            EngineRequest::Shutdown => break,
        };

        tracing::debug!(
            "[worker] {} answered in {:.2}ms",
            label,
            t0.elapsed().as_secs_f64() * 1000.0
        );
        if response_tx.send(response).is_err() {
            tracing::warn!("[worker] caller of {} went away before the reply", label);
        }
    }

    tracing::info!("[worker] {} stopped", engine.engine_name());
}

impl EngineHandle {
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<Value>) -> EngineRequest,
    ) -> Result<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| BridgeError::WorkerUnavailable)?;
        resp_rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    pub async fn initialize(&self, config: EngineConfig) -> Result<Value> {
        self.call(|response_tx| EngineRequest::Initialize {
            config,
            response_tx,
        })
        .await
    }

    pub async fn is_ready(&self) -> Result<Value> {
        self.call(|response_tx| EngineRequest::IsReady { response_tx })
            .await
    }

    pub async fn run_method(&self, method: &str, inputs: TensorMap) -> Result<Value> {
        self.call(|response_tx| EngineRequest::RunMethod {
            method: method.to_string(),
            inputs,
            response_tx,
        })
        .await
    }

    pub async fn add_event(&self, event_json: String, event_type: String) -> Result<Value> {
        self.call(|response_tx| EngineRequest::AddEvent {
            event_json,
            event_type,
            response_tx,
        })
        .await
    }
}
