//! Engine context
//!
//! Owns the render context, the frame renderer and the scene, and drives one
//! frame per [`EngineContext::tick`]. Nothing lives in globals; two engines
//! in one process are independent.

use std::sync::Arc;

use glam::Vec3;
use winit::window::Window;

use crate::backend::create_backend;
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::jobs::{JobSystem, Stage};
use crate::pipeline::FrameRenderer;
use crate::resources::{
    create_geometry, GBufferMaterial, GBufferMaterialDesc, Geometry, Material, ModelData,
    ParallaxMaterialDesc, ParallaxOcclusionMaterial, ShaderTable, UnlitMaterial, UnlitMaterialDesc,
};
use crate::scene::{Camera, Entity, EntityId, FrameParams, InputState, World};
use crate::scripting::{EngineCapabilities, ScriptHost};
use crate::{BackendType, EngineConfig};

/// The main engine: one render context, one scene, one frame at a time
pub struct EngineContext {
    config: EngineConfig,
    context: RenderContext,
    shaders: ShaderTable,
    renderer: FrameRenderer,
    materials: Vec<Arc<dyn Material>>,
    geometries: Vec<Arc<Geometry>>,
    world: World,
    camera: Camera,
    camera_controls: bool,
    frame: FrameParams,
    jobs: JobSystem,
    script_host: Option<Box<dyn ScriptHost>>,
    input: InputState,
    frame_index: u64,
}

impl EngineContext {
    /// Create the backend, load shaders and build the pass chain
    ///
    /// Windowed backends need `window`.
    pub fn new(config: EngineConfig, window: Option<Arc<Window>>) -> RenderResult<Self> {
        let backend = create_backend(&config, window).inspect_err(|e| {
            log::error!("Failed to create {:?} backend: {e}", config.backend);
        })?;
        let mut context = RenderContext::new(backend, config.root_path.clone())?;
        let shaders = ShaderTable::load(&mut context)?;
        let renderer = match FrameRenderer::new(&mut context, &config, &shaders) {
            Ok(renderer) => renderer,
            Err(e) => {
                log::error!("Failed to build the frame renderer: {e}");
                shaders.release(&mut context);
                return Err(e);
            }
        };

        let (width, height) = renderer.size();
        let mut camera = Camera::new(Vec3::new(0.0, 2.0, 6.0));
        camera.look_at(Vec3::ZERO);
        camera.set_aspect(width as f32, height as f32);

        log::info!(
            "Engine ready: {:?} backend, {}x{}",
            context.backend_type(),
            width,
            height
        );
        Ok(Self {
            jobs: JobSystem::new(config.worker_threads),
            config,
            context,
            shaders,
            renderer,
            materials: Vec::new(),
            geometries: Vec::new(),
            world: World::new(),
            camera,
            camera_controls: true,
            frame: FrameParams::new(),
            script_host: None,
            input: InputState::default(),
            frame_index: 0,
        })
    }

    /// Engine on the headless backend, regardless of `config.backend`
    pub fn new_headless(config: EngineConfig) -> RenderResult<Self> {
        Self::new(config.with_backend(BackendType::Headless), None)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.context
    }

    pub fn renderer(&self) -> &FrameRenderer {
        &self.renderer
    }

    pub fn shaders(&self) -> &ShaderTable {
        &self.shaders
    }

    /// Parameters of the last ticked frame
    pub fn frame(&self) -> &FrameParams {
        &self.frame
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Let input drive the camera; on by default
    pub fn set_camera_controls(&mut self, enabled: bool) {
        self.camera_controls = enabled;
    }

    /// Input for the next tick
    pub fn set_input(&mut self, input: InputState) {
        self.input = input;
    }

    pub fn input(&self) -> InputState {
        self.input
    }

    pub fn set_script_host(&mut self, host: Box<dyn ScriptHost>) {
        self.script_host = Some(host);
    }

    pub fn spawn(&mut self, entity: impl Entity + 'static) -> EntityId {
        self.world.spawn(entity)
    }

    /// Build a material against the current gbuffer and shadow passes
    pub fn create_material(&mut self, desc: &GBufferMaterialDesc) -> RenderResult<Arc<GBufferMaterial>> {
        let passes = self.renderer.material_passes();
        let material = Arc::new(GBufferMaterial::new(
            &mut self.context,
            &self.shaders,
            &passes,
            desc,
        )?);
        self.materials.push(material.clone());
        Ok(material)
    }

    pub fn create_unlit_material(&mut self, desc: &UnlitMaterialDesc) -> RenderResult<Arc<UnlitMaterial>> {
        let passes = self.renderer.material_passes();
        let material = Arc::new(UnlitMaterial::new(
            &mut self.context,
            &self.shaders,
            &passes,
            desc,
        )?);
        self.materials.push(material.clone());
        Ok(material)
    }

    pub fn create_parallax_material(
        &mut self,
        desc: &ParallaxMaterialDesc,
    ) -> RenderResult<Arc<ParallaxOcclusionMaterial>> {
        let passes = self.renderer.material_passes();
        let material = Arc::new(ParallaxOcclusionMaterial::new(
            &mut self.context,
            &self.shaders,
            &passes,
            desc,
        )?);
        self.materials.push(material.clone());
        Ok(material)
    }

    pub fn default_material(&self) -> Arc<dyn Material> {
        self.renderer.default_material()
    }

    /// Upload a model; the engine releases it on shutdown
    pub fn create_geometry(&mut self, model: &ModelData) -> RenderResult<Arc<Geometry>> {
        let geometry = Arc::new(create_geometry(&mut self.context, model)?);
        self.geometries.push(geometry.clone());
        Ok(geometry)
    }

    /// Simulate and render one frame
    ///
    /// Update and late update run on the job system, scripts run after both,
    /// then the pass chain renders on the calling thread.
    pub fn tick(&mut self, delta_time: f32) -> RenderResult<()> {
        let frame_index = self.frame_index + 1;
        let (width, height) = self.renderer.size();
        self.frame.reset(frame_index, delta_time);
        self.frame.input = self.input;
        if self.camera_controls {
            self.camera.update(&self.input, delta_time);
        }
        self.camera
            .write_frame(&mut self.frame, self.context.backend_type(), width, height);

        self.jobs.run(Stage::Update, &self.world, &self.frame);
        self.jobs.run(Stage::LateUpdate, &self.world, &self.frame);

        if let Some(host) = self.script_host.as_mut() {
            let caps = EngineCapabilities::new(&self.world, self.input);
            host.run(&caps, delta_time);
        }
        self.input.reset_deltas();

        self.context.acquire()?;
        let result = self.render_frame();
        self.context.release();
        self.frame_index = frame_index;
        log::trace!(
            "Frame {frame_index}: {} static, {} dynamic, {} gui draws",
            self.frame.static_draws.len(),
            self.frame.dynamic_draws.len(),
            self.frame.gui_draws.len()
        );
        result
    }

    fn render_frame(&mut self) -> RenderResult<()> {
        self.context.begin_frame()?;
        let rendered = self.renderer.render(&mut self.context, &self.frame);
        if rendered.is_err() && self.context.active_render_pass().is_some() {
            self.context.end_render_pass()?;
        }
        self.context.end_frame()?;
        rendered?;
        self.context.swap()
    }

    /// Resize the surface and every size-dependent target
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {width}x{height}");
            return Ok(());
        }
        self.context.acquire()?;
        self.context.wait_idle();
        self.context.resize(width, height);
        let (width, height) = self.context.surface_size();
        let result = self.renderer.resize(&mut self.context, width, height);
        self.context.release();
        self.camera.set_aspect(width as f32, height as f32);
        result
    }

    /// Release every GPU resource the engine created
    pub fn shutdown(mut self) {
        self.context.wait_idle();
        for material in self.materials.drain(..) {
            material.release(&mut self.context);
        }
        for geometry in self.geometries.drain(..) {
            geometry.release(&mut self.context);
        }
        self.renderer.release(&mut self.context);
        self.shaders.release(&mut self.context);
        log::info!("Engine shut down after {} frames", self.frame_index);
    }
}
