//! Shared helpers for the integration tests.
//!
//! Everything runs on the headless backend so the suite needs neither a GPU
//! nor a window. Shaders are read from the crate's own `data/shaders`.

#![allow(dead_code)]

use std::sync::Once;

use prism_render::backend::{
    AttachmentDesc, HeadlessBackend, RenderPassDesc, RenderPassHandle, TextureDesc, TextureFormat, TextureHandle,
    Viewport,
};
use prism_render::backend::create_backend;
use prism_render::{BackendType, EngineConfig, EngineContext, RenderContext};

static LOGGER: Once = Once::new();

/// Route `log` output through the test harness
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn root_path() -> &'static str {
    env!("CARGO_MANIFEST_DIR")
}

/// A render context over a fresh headless backend
pub struct TestContext {
    pub ctx: RenderContext,
}

impl TestContext {
    pub fn new(width: u32, height: u32) -> Self {
        init_logging();
        let ctx = RenderContext::new(Box::new(HeadlessBackend::new(width, height)), root_path())
            .expect("headless context");
        Self { ctx }
    }

    /// A context on `backend`, or `None` when it cannot run here
    ///
    /// Windowed backends have no surface in the test harness and are skipped.
    pub fn for_backend(backend: BackendType, width: u32, height: u32) -> Option<Self> {
        init_logging();
        let config = EngineConfig::default()
            .with_size(width, height)
            .with_backend(backend);
        let backend = match create_backend(&config, None) {
            Ok(backend) => backend,
            Err(e) => {
                log::warn!("Skipping {:?}: {e}", config.backend);
                return None;
            }
        };
        RenderContext::new(backend, root_path()).ok().map(|ctx| Self { ctx })
    }

    /// The backend, for inspecting what was recorded
    pub fn headless(&self) -> &HeadlessBackend {
        self.ctx
            .backend_as::<HeadlessBackend>()
            .expect("headless backend")
    }

    pub fn render_target(&mut self, label: &str, width: u32, height: u32, format: TextureFormat) -> TextureHandle {
        self.ctx
            .create_texture(&TextureDesc::render_target(label, width, height, format), None)
            .expect("render target")
    }

    /// Pass clearing every attachment, sized `width`x`height`
    pub fn render_pass(
        &mut self,
        label: &str,
        colors: &[TextureFormat],
        depth: Option<TextureFormat>,
        width: u32,
        height: u32,
    ) -> RenderPassHandle {
        let desc = RenderPassDesc {
            label: Some(label.to_string()),
            color_attachments: colors.iter().map(|&f| AttachmentDesc::clear_store(f)).collect(),
            depth_attachment: depth.map(AttachmentDesc::clear_store),
            viewport: Viewport::full(width, height),
        };
        self.ctx.create_render_pass(&desc).expect("render pass")
    }
}

/// Small engine on the headless backend
pub fn headless_engine(width: u32, height: u32) -> EngineContext {
    init_logging();
    let config = EngineConfig::default()
        .with_size(width, height)
        .with_root_path(root_path())
        .with_worker_threads(4)
        .with_shadow_map_size(256);
    EngineContext::new_headless(config).expect("headless engine")
}
