//! Engine-level error type
//!
//! Every factory operation of the render context returns [`RenderResult`].
//! Backend-specific failures are translated into one of these variants at the
//! backend boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::BackendType;

/// Errors surfaced by the render context and its backends
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Invalid format combination: {0}")]
    InvalidFormatCombination(String),
    #[error("Shader compilation failed for {path}: {log}")]
    CompileFailure { path: PathBuf, log: String },
    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),
    #[error("Failed to decode {}: {reason}", path.display())]
    AssetDecode { path: PathBuf, reason: String },
    #[error("Invalid {kind} handle: {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("Invalid binding order: {0}")]
    InvalidBindingOrder(String),
    #[error("Descriptor heap exhausted: requested {requested} slots, {available} free")]
    DescriptorHeapExhausted { requested: u32, available: u32 },
    #[error("Resource layout mismatch: {0}")]
    ResourceLayoutMismatch(String),
    #[error("Vertex format is not finalized")]
    UnfinalizedVertexFormat,
    #[error("Usage error: {0}")]
    Usage(String),
    #[error("Failed to initialize backend: {0}")]
    Initialization(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreation(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Backend {0:?} is not available on this platform")]
    BackendUnavailable(BackendType),
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// True for the error kinds callers are expected to log and skip
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AssetNotFound(_) | Self::AssetDecode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_errors_are_recoverable() {
        assert!(RenderError::AssetNotFound(PathBuf::from("a.png")).is_recoverable());
        assert!(!RenderError::OutOfMemory("heap".into()).is_recoverable());
        assert!(!RenderError::UnfinalizedVertexFormat.is_recoverable());
    }

    #[test]
    fn display_includes_path() {
        let err = RenderError::CompileFailure {
            path: PathBuf::from("data/shaders/st_tonemap.wgsl"),
            log: "unexpected token".into(),
        };
        let text = err.to_string();
        assert!(text.contains("st_tonemap.wgsl"));
        assert!(text.contains("unexpected token"));
    }
}
