//! haru-engine — Owns the pipeline on a dedicated thread.
//!
//! Async callers talk to it through a cloneable [`EngineHandle`]. Each
//! submission carries an epoch so a retake cancels the photo before it.

pub mod config;
pub mod engine;
pub mod loader;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, spawn_with, Analyzer, EngineError, EngineHandle};
pub use loader::{build_pipeline, OnnxPipeline};
