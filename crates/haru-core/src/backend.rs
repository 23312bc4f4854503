//! ONNX Runtime session construction shared by both models.

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const INTRA_THREADS: usize = 2;

/// Execution provider, in the order the caller prefers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    Cuda,
    CoreMl,
    DirectMl,
    Cpu,
}

impl ExecutionBackend {
    pub const DEFAULT_PREFERENCE: [ExecutionBackend; 3] =
        [ExecutionBackend::Cuda, ExecutionBackend::CoreMl, ExecutionBackend::Cpu];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionBackend::Cuda => "cuda",
            ExecutionBackend::CoreMl => "coreml",
            ExecutionBackend::DirectMl => "directml",
            ExecutionBackend::Cpu => "cpu",
        }
    }

    fn dispatch(self) -> ExecutionProviderDispatch {
        match self {
            ExecutionBackend::Cuda => CUDAExecutionProvider::default().build(),
            ExecutionBackend::CoreMl => CoreMLExecutionProvider::default().build(),
            ExecutionBackend::DirectMl => DirectMLExecutionProvider::default().build(),
            ExecutionBackend::Cpu => CPUExecutionProvider::default().build(),
        }
    }
}

impl FromStr for ExecutionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            "directml" | "dml" => Ok(Self::DirectMl),
            "cpu" | "wasm" => Ok(Self::Cpu),
            other => Err(format!("unknown execution backend: {other}")),
        }
    }
}

/// Parse a comma-separated preference list such as `"cuda,coreml,cpu"`.
pub fn parse_backends(list: &str) -> Result<Vec<ExecutionBackend>, String> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// The provider list actually handed to ONNX Runtime.
///
/// GPU providers are unstable on iOS, so it always gets the CPU provider.
/// Elsewhere the CPU provider is appended when missing so a session can
/// always be created.
pub fn effective_backends(preference: &[ExecutionBackend]) -> Vec<ExecutionBackend> {
    if cfg!(target_os = "ios") {
        return vec![ExecutionBackend::Cpu];
    }

    let mut backends: Vec<ExecutionBackend> = Vec::with_capacity(preference.len() + 1);
    for b in preference {
        if !backends.contains(b) {
            backends.push(*b);
        }
    }
    if !backends.contains(&ExecutionBackend::Cpu) {
        backends.push(ExecutionBackend::Cpu);
    }
    backends
}

/// Build a session for `model_path` using the preferred providers.
pub fn build_session(model_path: &Path, preference: &[ExecutionBackend]) -> ort::Result<Session> {
    let backends = effective_backends(preference);
    tracing::debug!(
        path = %model_path.display(),
        backends = ?backends.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
        "creating ONNX session"
    );

    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(INTRA_THREADS)?
        .with_execution_providers(backends.into_iter().map(ExecutionBackend::dispatch).collect::<Vec<_>>())?
        .commit_from_file(model_path)
}
