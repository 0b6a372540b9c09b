//! Backend abstraction layer
//!
//! Provides the per-resource traits every backend implements and selects an
//! implementation at startup.

pub mod headless;
pub mod reflect;
pub mod traits;
pub mod types;
pub mod vulkan;
pub mod wgpu_backend;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Mat4;
use winit::window::Window;

use crate::error::{RenderError, RenderResult};
use crate::{BackendType, EngineConfig};

pub use headless::HeadlessBackend;
pub use traits::*;
pub use types::*;

/// Create the backend selected by `config.backend`
///
/// Windowed backends need `window`; the headless backend ignores it.
pub fn create_backend(
    config: &EngineConfig,
    window: Option<Arc<Window>>,
) -> RenderResult<Box<dyn GraphicsBackend>> {
    log::info!("Creating {:?} backend", config.backend);
    match config.backend {
        BackendType::Headless => Ok(Box::new(HeadlessBackend::new(config.width, config.height))),
        BackendType::Dx12 | BackendType::OpenGl => {
            let window = window.ok_or_else(|| {
                RenderError::usage(format!("{:?} backend requires a window", config.backend))
            })?;
            let backend = wgpu_backend::WgpuBackend::new(window, config.backend, config.vsync)?;
            Ok(Box::new(backend))
        }
        BackendType::Vulkan => {
            let window = window.ok_or_else(|| {
                RenderError::usage("Vulkan backend requires a window".to_string())
            })?;
            let backend = vulkan::VulkanBackend::new(window, config.vsync)?;
            Ok(Box::new(backend))
        }
    }
}

/// Correction applied on top of a zero-to-one right-handed projection
///
/// Vulkan's clip space has Y pointing down; every other backend already
/// matches glam's convention.
pub fn clip_space_correction(backend: BackendType) -> Mat4 {
    match backend {
        BackendType::Vulkan => Mat4::from_scale(glam::Vec3::new(1.0, -1.0, 1.0)),
        BackendType::Dx12 | BackendType::OpenGl | BackendType::Headless => Mat4::IDENTITY,
    }
}

/// Whether the backend's rasterizer sees mirrored winding after correction
pub fn flips_winding(backend: BackendType) -> bool {
    matches!(backend, BackendType::Vulkan)
}

/// Vertex entry point name in WGSL shader sources
pub const VERTEX_ENTRY: &str = "vs_main";
/// Fragment entry point name in WGSL shader sources
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// `<stem><suffix>`, e.g. `data/shaders/st_gbuffer` + `_vert.spirv`
pub(crate) fn shader_path(stem: &Path, suffix: &str) -> PathBuf {
    let mut path = stem.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Ensure a parsed WGSL module exposes an entry point for every requested stage
pub(crate) fn check_entry_points(
    module: &naga::Module,
    stages: ShaderStageFlags,
    path: &Path,
) -> RenderResult<()> {
    let required = [
        (ShaderStageFlags::VERTEX, naga::ShaderStage::Vertex, VERTEX_ENTRY),
        (ShaderStageFlags::FRAGMENT, naga::ShaderStage::Fragment, FRAGMENT_ENTRY),
    ];
    for (flag, stage, name) in required {
        if !stages.contains(flag) {
            continue;
        }
        let found = module
            .entry_points
            .iter()
            .any(|ep| ep.stage == stage && ep.name == name);
        if !found {
            return Err(RenderError::CompileFailure {
                path: path.to_path_buf(),
                log: format!("missing {stage:?} entry point `{name}`"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn vulkan_correction_flips_y() {
        let p = Vec4::new(0.5, 0.25, 0.5, 1.0);
        let corrected = clip_space_correction(BackendType::Vulkan) * p;
        assert_eq!(corrected, Vec4::new(0.5, -0.25, 0.5, 1.0));
        assert_eq!(clip_space_correction(BackendType::Dx12), Mat4::IDENTITY);
        assert_eq!(clip_space_correction(BackendType::OpenGl), Mat4::IDENTITY);
    }

    #[test]
    fn headless_needs_no_window() {
        let config = EngineConfig {
            backend: BackendType::Headless,
            ..Default::default()
        };
        let backend = create_backend(&config, None).unwrap();
        assert_eq!(backend.backend_type(), BackendType::Headless);
    }

    #[test]
    fn windowed_backend_without_window_is_usage_error() {
        let config = EngineConfig {
            backend: BackendType::Vulkan,
            ..Default::default()
        };
        assert!(matches!(
            create_backend(&config, None),
            Err(RenderError::Usage(_))
        ));
    }
}
