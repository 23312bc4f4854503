use crate::config::Config;
use crate::loader;
use haru_core::classifier::EmotionModel;
use haru_core::compositor::StickerAssets;
use haru_core::landmarks::LandmarkFactory;
use haru_core::session::{EpochCounter, EpochToken};
use haru_core::{Analysis, FailureReason, Pipeline, PipelineError, PipelineState};
use image::DynamicImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(PipelineError),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("models not ready after {0:?}")]
    LoadTimeout(Duration),
    #[error("analysis {epoch} did not finish within {limit:?}")]
    AnalyzeTimeout { epoch: u64, limit: Duration },
    #[error("analysis {epoch} superseded by a newer submission")]
    Superseded { epoch: u64 },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<PipelineError> for EngineError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Superseded { epoch } => EngineError::Superseded { epoch },
            other => EngineError::Pipeline(other),
        }
    }
}

impl EngineError {
    /// The failure the UI should show, if any. Superseded runs show nothing.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            EngineError::Pipeline(e) => e.failure_reason(),
            EngineError::ModelLoad(_) => Some(FailureReason::ModelLoad),
            EngineError::LoadTimeout(_) | EngineError::AnalyzeTimeout { .. } => Some(FailureReason::Timeout),
            EngineError::Superseded { .. } => None,
            EngineError::Spawn(_) | EngineError::ChannelClosed => Some(FailureReason::Inference),
        }
    }
}

/// Something the engine thread can run images through.
pub trait Analyzer {
    fn analyze(
        &mut self,
        photo: &DynamicImage,
        token: EpochToken,
        observer: &mut dyn FnMut(&PipelineState),
    ) -> Result<Analysis, PipelineError>;
}

impl<F: LandmarkFactory, M: EmotionModel, A: StickerAssets> Analyzer for Pipeline<F, M, A> {
    fn analyze(
        &mut self,
        photo: &DynamicImage,
        token: EpochToken,
        observer: &mut dyn FnMut(&PipelineState),
    ) -> Result<Analysis, PipelineError> {
        self.run(photo, token, observer)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum LoadStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    Analyze {
        photo: DynamicImage,
        token: EpochToken,
        reply: oneshot::Sender<Result<Analysis, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Every `analyze` call starts a new epoch, so a newer photo always wins
/// over one still in flight.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    epochs: EpochCounter,
    state: Arc<watch::Sender<PipelineState>>,
    loaded: watch::Receiver<LoadStatus>,
    analyze_timeout: Duration,
}

impl EngineHandle {
    /// Wait until the models finished loading.
    ///
    /// Expiry publishes `Failed(Timeout)`; a load that completes later
    /// still moves the engine to `Ready`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut loaded = self.loaded.clone();
        let status = tokio::time::timeout(timeout, loaded.wait_for(|s| *s != LoadStatus::Pending))
            .await
            .map_err(|_| {
                tracing::warn!(?timeout, "models not ready in time");
                self.state.send_replace(PipelineState::Failed(FailureReason::Timeout));
                EngineError::LoadTimeout(timeout)
            })?
            .map_err(|_| EngineError::ChannelClosed)?
            .clone();

        match status {
            LoadStatus::Ready => Ok(()),
            LoadStatus::Failed(msg) => Err(EngineError::ModelLoad(msg)),
            LoadStatus::Pending => Err(EngineError::ChannelClosed),
        }
    }

    /// Analyze one photo.
    ///
    /// The timeout covers queueing as well as the run itself. On timeout the
    /// submission's epoch is invalidated, so the engine thread drops whatever
    /// it later produces for it.
    pub async fn analyze(&self, photo: DynamicImage) -> Result<Analysis, EngineError> {
        let token = self.epochs.advance();
        let epoch = token.epoch();
        tracing::debug!(epoch, width = photo.width(), height = photo.height(), "analysis submitted");

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = EngineRequest::Analyze {
            photo,
            token,
            reply: reply_tx,
        };
        let exchange = async {
            self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)?;
            reply_rx
                .await
                .map_err(|_| EngineError::ChannelClosed)?
                .map_err(EngineError::from)
        };

        match tokio::time::timeout(self.analyze_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                if self.epochs.invalidate(epoch) {
                    self.state.send_replace(PipelineState::Failed(FailureReason::Timeout));
                }
                tracing::warn!(epoch, limit = ?self.analyze_timeout, "analysis timed out");
                Err(EngineError::AnalyzeTimeout {
                    epoch,
                    limit: self.analyze_timeout,
                })
            }
        }
    }

    /// Latest pipeline state.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Receiver that sees every published state change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }
}

/// Spawn the engine with the ONNX pipeline described by `config`.
///
/// Returns immediately; models load on the engine thread. Use
/// [`EngineHandle::wait_ready`] to wait for them.
pub fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    let analyze_timeout = config.analyze_timeout();
    spawn_with(move || loader::build_pipeline(&config), analyze_timeout)
}

/// Spawn the engine on a dedicated OS thread.
///
/// `load` runs on that thread, so the analyzer it builds never has to be
/// `Send`. Dropping every handle stops the thread and releases the models.
pub fn spawn_with<L, P>(load: L, analyze_timeout: Duration) -> Result<EngineHandle, EngineError>
where
    L: FnOnce() -> Result<P, PipelineError> + Send + 'static,
    P: Analyzer + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (state_tx, _) = watch::channel(PipelineState::Idle);
    let state = Arc::new(state_tx);
    let (loaded_tx, loaded_rx) = watch::channel(LoadStatus::Pending);

    let thread_state = Arc::clone(&state);
    std::thread::Builder::new()
        .name("haru-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            thread_state.send_replace(PipelineState::LandmarkModelLoading);

            let started = Instant::now();
            let (mut analyzer, load_error) = match load() {
                Ok(analyzer) => {
                    tracing::info!(elapsed = ?started.elapsed(), "models loaded");
                    thread_state.send_replace(PipelineState::Ready);
                    loaded_tx.send_replace(LoadStatus::Ready);
                    (Some(analyzer), String::new())
                }
                Err(err) => {
                    tracing::error!(error = %err, "model load failed");
                    thread_state.send_replace(PipelineState::Failed(FailureReason::ModelLoad));
                    loaded_tx.send_replace(LoadStatus::Failed(err.to_string()));
                    (None, err.to_string())
                }
            };

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { photo, token, reply } => {
                        let result = match analyzer.as_mut() {
                            Some(analyzer) => {
                                let guard = token.clone();
                                let publish = Arc::clone(&thread_state);
                                analyzer.analyze(&photo, token, &mut |s: &PipelineState| {
                                    // Checked under the watch lock, so an epoch invalidated
                                    // by a timeout or a newer run never publishes again.
                                    publish.send_if_modified(|current| {
                                        if guard.is_current() {
                                            *current = *s;
                                            true
                                        } else {
                                            false
                                        }
                                    });
                                })
                            }
                            None => Err(PipelineError::ModelLoad(load_error.clone())),
                        };
                        let _ = reply.send(result);
                    }
                }
            }

            drop(analyzer);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        epochs: EpochCounter::new(),
        state,
        loaded: loaded_rx,
        analyze_timeout,
    })
}
