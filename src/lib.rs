//! Prism - a deferred rendering engine core
//!
//! The engine renders through one of several graphics backends selected at
//! startup:
//! - **Dx12**: explicit API through wgpu's Direct3D 12 backend
//! - **OpenGl**: immediate-style API through wgpu's GL backend
//! - **Vulkan**: direct Vulkan via ash
//! - **Headless**: CPU-side recording backend for tests and tooling
//!
//! # Features
//! - Per-resource-kind backend traits behind a single [`RenderContext`]
//! - Resource tables with descriptor heap slot allocation
//! - Fixed deferred pass chain: shadow, gbuffer, lighting, bloom, tonemap,
//!   anti-aliasing, UI and present
//! - Entities updated in parallel by a job system, pushing draw calls into
//!   mutex-guarded frame lists

pub mod backend;
pub mod context;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod scripting;
pub mod window;

use std::path::PathBuf;
use std::str::FromStr;

pub use context::{ContextGuard, RenderContext, SharedRenderContext};
pub use engine::EngineContext;
pub use error::{RenderError, RenderResult};
pub use pipeline::FrameRenderer;
pub use scene::{Camera, FrameParams};

/// Backend selection for the graphics engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Direct3D 12 through wgpu
    Dx12,
    /// OpenGL through wgpu
    OpenGl,
    /// Vulkan via ash
    #[default]
    Vulkan,
    /// No GPU; records commands for inspection
    Headless,
}

impl BackendType {
    /// Whether the backend needs a window surface
    pub fn is_windowed(&self) -> bool {
        !matches!(self, BackendType::Headless)
    }
}

impl FromStr for BackendType {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dx12" | "d3d12" => Ok(BackendType::Dx12),
            "gl" | "opengl" => Ok(BackendType::OpenGl),
            "vk" | "vulkan" => Ok(BackendType::Vulkan),
            "headless" | "none" => Ok(BackendType::Headless),
            other => Err(RenderError::usage(format!("unknown backend `{other}`"))),
        }
    }
}

/// Bloom post-process settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomSettings {
    /// Brightness above which pixels contribute to bloom
    pub threshold: f32,
    /// Strength of the blurred bright pass when composited
    pub intensity: f32,
}

impl Default for BloomSettings {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            intensity: 0.5,
        }
    }
}

/// Tonemapping operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TonemapOperator {
    Reinhard,
    #[default]
    Aces,
    Uncharted2,
    /// Clamp only
    None,
}

impl TonemapOperator {
    /// Operator index understood by the tonemap shader
    pub fn shader_index(&self) -> u32 {
        match self {
            TonemapOperator::Reinhard => 0,
            TonemapOperator::Aces => 1,
            TonemapOperator::Uncharted2 => 2,
            TonemapOperator::None => 3,
        }
    }
}

/// Tonemap settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TonemapSettings {
    pub operator: TonemapOperator,
    pub exposure: f32,
    pub gamma: f32,
}

impl Default for TonemapSettings {
    fn default() -> Self {
        Self {
            operator: TonemapOperator::Aces,
            exposure: 1.0,
            gamma: 2.2,
        }
    }
}

/// Anti-aliasing applied after tonemapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiAliasing {
    #[default]
    Fxaa,
    Off,
}

/// Configuration for initializing the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    /// Enable vsync
    pub vsync: bool,
    /// Asset root; shaders are read from `<root>/data/shaders`
    pub root_path: PathBuf,
    /// Worker threads for entity updates; 0 picks the available parallelism
    pub worker_threads: usize,
    /// Edge length of the square shadow map
    pub shadow_map_size: u32,
    pub bloom: BloomSettings,
    pub tonemap: TonemapSettings,
    pub anti_aliasing: AntiAliasing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::default(),
            vsync: true,
            root_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            worker_threads: 0,
            shadow_map_size: 2048,
            bloom: BloomSettings::default(),
            tonemap: TonemapSettings::default(),
            anti_aliasing: AntiAliasing::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_shadow_map_size(mut self, size: u32) -> Self {
        self.shadow_map_size = size;
        self
    }

    pub fn with_bloom(mut self, bloom: BloomSettings) -> Self {
        self.bloom = bloom;
        self
    }

    pub fn with_tonemap(mut self, tonemap: TonemapSettings) -> Self {
        self.tonemap = tonemap;
        self
    }

    pub fn with_anti_aliasing(mut self, anti_aliasing: AntiAliasing) -> Self {
        self.anti_aliasing = anti_aliasing;
        self
    }

    /// Worker count with 0 resolved to the machine's parallelism
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("dx12".parse::<BackendType>().unwrap(), BackendType::Dx12);
        assert_eq!("OpenGL".parse::<BackendType>().unwrap(), BackendType::OpenGl);
        assert_eq!("vk".parse::<BackendType>().unwrap(), BackendType::Vulkan);
        assert_eq!(
            "headless".parse::<BackendType>().unwrap(),
            BackendType::Headless
        );
        assert!("metal".parse::<BackendType>().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::default()
            .with_backend(BackendType::Headless)
            .with_size(320, 240)
            .with_worker_threads(3);
        assert_eq!(config.backend, BackendType::Headless);
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.resolved_worker_threads(), 3);
        assert!(EngineConfig::default().resolved_worker_threads() >= 1);
    }
}
