//! Per-image pipeline session and epoch tokens.
//!
//! Every submitted image gets a new epoch. Work tagged with an older epoch
//! is stale and is dropped at the next stage boundary instead of racing the
//! newer submission.

use crate::compositor::ComposedImage;
use crate::landmarks::LandmarkProvider;
use crate::pipeline::PipelineState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared monotonically increasing submission counter.
#[derive(Debug, Clone, Default)]
pub struct EpochCounter {
    current: Arc<AtomicU64>,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new epoch, making every earlier token stale.
    pub fn advance(&self) -> EpochToken {
        let epoch = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        EpochToken {
            current: Arc::clone(&self.current),
            epoch,
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Invalidate `epoch` if it is still the latest one.
    ///
    /// Returns false when a newer epoch already superseded it.
    pub fn invalidate(&self, epoch: u64) -> bool {
        self.current
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// The epoch one submission was issued under.
#[derive(Debug, Clone)]
pub struct EpochToken {
    current: Arc<AtomicU64>,
    epoch: u64,
}

impl EpochToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }
}

/// State for one image's trip through the pipeline.
///
/// Owns the per-image landmark provider, if any, and releases it when
/// dropped.
pub struct PipelineSession<P: LandmarkProvider> {
    token: EpochToken,
    landmarker: Option<P>,
    state: PipelineState,
    composed: Option<ComposedImage>,
}

impl<P: LandmarkProvider> PipelineSession<P> {
    pub fn new(token: EpochToken) -> Self {
        Self {
            token,
            landmarker: None,
            state: PipelineState::Idle,
            composed: None,
        }
    }

    pub fn token(&self) -> &EpochToken {
        &self.token
    }

    pub fn epoch(&self) -> u64 {
        self.token.epoch()
    }

    pub fn attach_landmarker(&mut self, provider: P) {
        self.release_landmarker();
        self.landmarker = Some(provider);
    }

    pub fn landmarker_mut(&mut self) -> Option<&mut P> {
        self.landmarker.as_mut()
    }

    /// Release the per-image landmark provider now.
    pub fn release_landmarker(&mut self) {
        if let Some(mut provider) = self.landmarker.take() {
            provider.release();
            tracing::debug!(epoch = self.token.epoch(), "per-image landmark provider released");
        }
    }

    pub fn transition(&mut self, next: PipelineState, observer: &mut dyn FnMut(&PipelineState)) {
        tracing::debug!(epoch = self.token.epoch(), from = %self.state, to = %next, "pipeline state");
        self.state = next;
        observer(&self.state);
    }

    pub fn set_composed(&mut self, composed: ComposedImage) {
        self.composed = Some(composed);
    }

    pub fn take_composed(&mut self) -> Option<ComposedImage> {
        self.composed.take()
    }
}

impl<P: LandmarkProvider> Drop for PipelineSession<P> {
    fn drop(&mut self) {
        self.release_landmarker();
    }
}
