//! Engine lifecycle
//!
//! State machine `Empty -> Loading -> Ready -> Generating -> Ready ->
//! Unloading -> Empty`. The caller talks to a cloneable [`Engine`] handle;
//! all device work happens on the background worker thread, and every
//! fatal storage or device error drains back to `Empty` with a single
//! error event on the stream that observed it.

pub mod events;
mod worker;

use std::sync::{Arc, Mutex};

use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::events::{
    EngineState, GenerationEvent, LoadEvent, LoadPhase, LoadProgress,
};
use crate::config::EngineSettings;
use crate::engine::worker::{SessionWorker, WorkerCommand, WorkerInit};
use crate::inference::templates::{apply_chat_template, ChatMessage, TemplateType};
use crate::inference::SamplingParams;
use crate::model::{BundleLoader, ModelConfig, ModelDescriptor};
use crate::quant::QuantMode;
use crate::store::ObjectStore;
use crate::utils::error::{AccelError, Result};

/// Summary of the loaded model for status endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadedModelInfo {
    pub id: String,
    pub name: String,
    pub arch: String,
    pub quant: String,
    pub context_size: usize,
}

struct ActiveSession {
    config: ModelConfig,
    tokenizer: Option<Arc<Tokenizer>>,
    template: TemplateType,
    worker: SessionWorker,
}

struct Shared {
    loader: BundleLoader,
    state: Mutex<EngineState>,
    info: Mutex<Option<LoadedModelInfo>>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    stop: Mutex<Option<CancellationToken>>,
    token_channel_size: usize,
}

/// Cloneable handle to the engine
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(store: ObjectStore, settings: &EngineSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader: BundleLoader::new(
                    store,
                    QuantMode::from_str_lossy(&settings.default_quant),
                ),
                state: Mutex::new(EngineState::Empty),
                info: Mutex::new(None),
                session: tokio::sync::Mutex::new(None),
                stop: Mutex::new(None),
                token_channel_size: settings.token_channel_size,
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    pub fn loaded_model(&self) -> Option<LoadedModelInfo> {
        self.shared.info.lock().expect("info lock poisoned").clone()
    }

    fn set_state(&self, state: EngineState) {
        *self.shared.state.lock().expect("state lock poisoned") = state;
    }

    /// Atomically move `from -> to`; false if someone else got there first
    fn transition_if(&self, from: EngineState, to: EngineState) -> bool {
        let mut state = self.shared.state.lock().expect("state lock poisoned");
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Load a model, streaming progress events.
    ///
    /// Idempotent: loading over a loaded model unloads it first. Rejected
    /// while a load or generation is in flight.
    pub async fn load(
        &self,
        descriptor: ModelDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<LoadEvent>> {
        // Claim the Loading slot, unloading a resident model first
        loop {
            let needs_unload = {
                let mut state = self.shared.state.lock().expect("state lock poisoned");
                match *state {
                    EngineState::Empty => {
                        *state = EngineState::Loading;
                        false
                    }
                    EngineState::Ready => true,
                    EngineState::Generating => {
                        return Err(AccelError::Busy("cannot load while generating".into()))
                    }
                    EngineState::Loading => {
                        return Err(AccelError::Busy("a load is already in flight".into()))
                    }
                    EngineState::Unloading => {
                        return Err(AccelError::Busy("engine is unloading".into()))
                    }
                }
            };
            if !needs_unload {
                break;
            }
            info!("reloading: unloading current model first");
            self.unload().await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_load(descriptor, &tx).await {
                Ok(()) => {
                    engine.transition_if(EngineState::Loading, EngineState::Ready);
                    let _ = tx.send(LoadEvent::Progress(LoadProgress {
                        percent: 100.0,
                        phase: LoadPhase::Done,
                        message: "model ready".into(),
                    }));
                }
                Err(e) => {
                    error!("load failed: {}", e);
                    let _ = tx.send(LoadEvent::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    if engine.transition_if(EngineState::Loading, EngineState::Unloading) {
                        engine.drain_to_empty().await;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn run_load(
        &self,
        descriptor: ModelDescriptor,
        tx: &mpsc::UnboundedSender<LoadEvent>,
    ) -> Result<()> {
        let bundle = self
            .shared
            .loader
            .ensure_bundle(&descriptor, &mut |p| {
                let _ = tx.send(LoadEvent::Progress(p));
            })
            .await?;

        let tokenizer = match &bundle.tokenizer {
            Some(bytes) => Some(Arc::new(Tokenizer::from_bytes(bytes).map_err(|e| {
                AccelError::Unsupported(format!("tokenizer parse failed: {}", e))
            })?)),
            None => {
                warn!("bundle has no tokenizer; generation will be rejected");
                None
            }
        };

        let template = TemplateType::detect(&bundle.config.arch, &descriptor.name);
        let init = WorkerInit {
            bundle_dir: bundle.dir.path().to_path_buf(),
            manifest: bundle.manifest.clone(),
            config: bundle.config.clone(),
            tokenizer: tokenizer.clone(),
        };

        let (worker, init_rx) = SessionWorker::spawn(init, tx.clone());
        init_rx
            .await
            .map_err(|_| AccelError::Device("GPU worker died during setup".into()))??;

        *self.shared.info.lock().expect("info lock poisoned") = Some(LoadedModelInfo {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            arch: bundle.config.arch.clone(),
            quant: bundle.manifest.quant.clone(),
            context_size: bundle.config.max_position_embeddings,
        });
        *self.shared.session.lock().await = Some(ActiveSession {
            config: bundle.config,
            tokenizer,
            template,
            worker,
        });

        Ok(())
    }

    /// Generate a reply to the message history, streaming tokens.
    ///
    /// Serial: a second call while one is in flight is rejected.
    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<mpsc::Receiver<GenerationEvent>> {
        params.validate()?;
        if messages.is_empty() {
            return Err(AccelError::InvalidParameters(
                "message history is empty".into(),
            ));
        }

        // Claim the Generating slot atomically; generation is serial
        {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            match *state {
                EngineState::Ready => *state = EngineState::Generating,
                EngineState::Empty => return Err(AccelError::ModelNotLoaded),
                EngineState::Generating => {
                    return Err(AccelError::Busy(
                        "a generation is already in flight".into(),
                    ))
                }
                _ => return Err(AccelError::Busy("engine is not ready".into())),
            }
        }

        let result = self.start_generation(messages, params).await;
        if result.is_err() {
            // The command never reached the worker; give the slot back
            self.transition_if(EngineState::Generating, EngineState::Ready);
        }
        result
    }

    async fn start_generation(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<mpsc::Receiver<GenerationEvent>> {
        let session_guard = self.shared.session.lock().await;
        let session = session_guard.as_ref().ok_or(AccelError::ModelNotLoaded)?;
        let tokenizer = session.tokenizer.clone().ok_or_else(|| {
            AccelError::Unsupported("loaded bundle has no tokenizer".into())
        })?;

        // Render the history and fold in the template's stop sequences
        let mut params = params;
        for stop_seq in session.template.stop_sequences() {
            if !params.stop_sequences.contains(&stop_seq) {
                params.stop_sequences.push(stop_seq);
            }
        }
        let prompt = apply_chat_template(&messages, session.template);
        let encoding = tokenizer
            .encode(prompt, false)
            .map_err(|e| AccelError::InternalError(format!("tokenization failed: {}", e)))?;
        let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
        let bos = session.config.bos_token_id;
        if tokens.first() != Some(&bos) {
            tokens.insert(0, bos);
        }

        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.shared.token_channel_size);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        *self.shared.stop.lock().expect("stop lock poisoned") = Some(stop.clone());
        session.worker.send(WorkerCommand::Generate {
            tokens,
            params,
            stop,
            events: tx,
            done: done_tx,
        })?;
        drop(session_guard);

        // Watch for completion and settle the state machine. An unload can
        // race the watcher, so every transition is conditional on still
        // owning the Generating slot.
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = done_rx.await;
            *engine.shared.stop.lock().expect("stop lock poisoned") = None;
            match outcome {
                Ok(Ok(_)) => {
                    engine.transition_if(EngineState::Generating, EngineState::Ready);
                }
                Ok(Err(e)) => {
                    if matches!(e, AccelError::Device(_) | AccelError::Storage(_)) {
                        error!("fatal error during generation: {}", e);
                        if engine
                            .transition_if(EngineState::Generating, EngineState::Unloading)
                        {
                            engine.drain_to_empty().await;
                        }
                    } else {
                        warn!("generation failed: {}", e);
                        engine.transition_if(EngineState::Generating, EngineState::Ready);
                    }
                }
                Err(_) => {
                    error!("GPU worker vanished mid-generation");
                    if engine.transition_if(EngineState::Generating, EngineState::Unloading) {
                        engine.drain_to_empty().await;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Request the current generation to stop at the next token boundary.
    ///
    /// Never cancels a kernel mid-flight and never destroys buffers.
    pub fn stop(&self) {
        if let Some(token) = self
            .shared
            .stop
            .lock()
            .expect("stop lock poisoned")
            .as_ref()
        {
            info!("stop requested");
            token.cancel();
        }
    }

    /// Unload the model, waiting for any in-flight pass to finish
    pub async fn unload(&self) -> Result<()> {
        let was_generating = {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            match *state {
                EngineState::Empty | EngineState::Unloading => return Ok(()),
                EngineState::Loading => {
                    return Err(AccelError::Busy("cannot unload while loading".into()))
                }
                EngineState::Generating => {
                    *state = EngineState::Unloading;
                    true
                }
                EngineState::Ready => {
                    *state = EngineState::Unloading;
                    false
                }
            }
        };

        if was_generating {
            // Let the decode loop exit at its next token boundary; the
            // shutdown command queues behind it
            self.stop();
        }
        self.drain_to_empty().await;
        info!("model unloaded");
        Ok(())
    }

    /// Tear down the session (if any) and settle in `Empty`
    async fn drain_to_empty(&self) {
        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            let _ = tokio::task::spawn_blocking(move || session.worker.shutdown()).await;
        }
        *self.shared.info.lock().expect("info lock poisoned") = None;
        *self.shared.stop.lock().expect("stop lock poisoned") = None;
        self.set_state(EngineState::Empty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine() -> (tempfile::TempDir, Engine) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).await.unwrap();
        (tmp, Engine::new(store, &EngineSettings::default()))
    }

    #[tokio::test]
    async fn starts_empty() {
        let (_tmp, engine) = test_engine().await;
        assert_eq!(engine.state(), EngineState::Empty);
        assert!(engine.loaded_model().is_none());
    }

    #[tokio::test]
    async fn generate_without_model_is_rejected() {
        let (_tmp, engine) = test_engine().await;
        let err = engine
            .generate(
                vec![ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                }],
                SamplingParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AccelError::ModelNotLoaded));
    }

    #[tokio::test]
    async fn unload_when_empty_is_a_no_op() {
        let (_tmp, engine) = test_engine().await;
        engine.unload().await.unwrap();
        assert_eq!(engine.state(), EngineState::Empty);
    }

    #[tokio::test]
    async fn stop_without_generation_is_a_no_op() {
        let (_tmp, engine) = test_engine().await;
        engine.stop();
        assert_eq!(engine.state(), EngineState::Empty);
    }
}
