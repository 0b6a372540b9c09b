//! Render context
//!
//! [`RenderContext`] is the engine-facing front end over a
//! [`GraphicsBackend`]. It owns the bookkeeping every backend shares:
//! - buffer alignment and upload validation
//! - texture state tracking and transitions around render passes
//! - framebuffer/pass and pipeline/pass format validation
//! - resource table slot allocation from the descriptor heaps
//! - the frame lifecycle and thread ownership
//!
//! The backend only ever sees validated calls.

pub mod descriptor_heap;
pub mod resource_table;
pub mod state_tracker;

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::resources::VertexFormat;
use crate::BackendType;

use descriptor_heap::{DescriptorHeap, RESOURCE_HEAP_CAPACITY, SAMPLER_HEAP_CAPACITY};
use resource_table::ResourceTable;
use state_tracker::{TextureStateTracker, TransitionBatch};

/// Bytes reserved per frame for dynamic vertex data
pub const DYNAMIC_VERTEX_CAPACITY: u64 = 4 * 1024 * 1024;
/// Bytes reserved per frame for dynamic index data
pub const DYNAMIC_INDEX_CAPACITY: u64 = 1024 * 1024;

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[derive(Debug, Clone)]
struct BufferInfo {
    desc: BufferDesc,
    size: u64,
}

#[derive(Debug, Clone)]
struct TextureInfo {
    desc: TextureDesc,
    clear_value: ClearValue,
    swapchain_owned: bool,
}

#[derive(Debug, Clone)]
struct PipelineInfo {
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    resource_layout: ResourceLayout,
    topology: PrimitiveTopology,
    has_vertex_input: bool,
}

#[derive(Debug, Clone, Copy)]
struct ActivePass {
    pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
}

/// Per-frame ring for inline draw data
#[derive(Debug)]
struct DynamicRing {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    vertex_cursor: u64,
    index_cursor: u64,
}

/// Backend-agnostic render context
pub struct RenderContext {
    backend: Box<dyn GraphicsBackend>,
    backend_type: BackendType,
    root_path: PathBuf,
    buffers: HashMap<BufferHandle, BufferInfo>,
    textures: HashMap<TextureHandle, TextureInfo>,
    samplers: HashSet<SamplerHandle>,
    shaders: HashMap<ShaderHandle, String>,
    vertex_formats: HashMap<VertexFormatHandle, VertexLayout>,
    render_passes: HashMap<RenderPassHandle, RenderPassDesc>,
    framebuffers: HashMap<FramebufferHandle, FramebufferDesc>,
    pipelines: HashMap<PipelineHandle, PipelineInfo>,
    resource_tables: HashMap<ResourceTableHandle, ResourceTable>,
    resource_heap: DescriptorHeap,
    sampler_heap: DescriptorHeap,
    states: TextureStateTracker,
    active_pass: Option<ActivePass>,
    bound_pipeline: Option<PipelineHandle>,
    frame: Option<FrameInfo>,
    frame_index: u64,
    dynamic: Option<DynamicRing>,
    owner: Option<ThreadId>,
}

impl RenderContext {
    /// Wrap a backend; `root_path` is the asset root containing `data/`
    pub fn new(backend: Box<dyn GraphicsBackend>, root_path: impl Into<PathBuf>) -> RenderResult<Self> {
        let backend_type = backend.backend_type();
        let mut context = Self {
            backend,
            backend_type,
            root_path: root_path.into(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashSet::new(),
            shaders: HashMap::new(),
            vertex_formats: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            resource_tables: HashMap::new(),
            resource_heap: DescriptorHeap::new("resource heap", RESOURCE_HEAP_CAPACITY),
            sampler_heap: DescriptorHeap::new("sampler heap", SAMPLER_HEAP_CAPACITY),
            states: TextureStateTracker::new(),
            active_pass: None,
            bound_pipeline: None,
            frame: None,
            frame_index: 0,
            dynamic: None,
            owner: None,
        };
        context.register_backbuffer();

        let vertex_buffer = context.create_buffer(
            DYNAMIC_VERTEX_CAPACITY,
            1,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            "dynamic vertices",
        )?;
        let index_buffer = context.create_buffer(
            DYNAMIC_INDEX_CAPACITY,
            1,
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            "dynamic indices",
        )?;
        context.dynamic = Some(DynamicRing {
            vertex_buffer,
            index_buffer,
            vertex_cursor: 0,
            index_cursor: 0,
        });

        log::info!(
            "Render context ready on {:?} backend, asset root {}",
            backend_type,
            context.root_path.display()
        );
        Ok(context)
    }

    fn register_backbuffer(&mut self) {
        let handle = self.backend.backbuffer();
        let (width, height) = self.backend.surface_size();
        let desc = TextureDesc {
            label: Some("backbuffer".into()),
            width,
            height,
            mip_levels: 1,
            format: self.backend.backbuffer_format(),
            usage: TextureUsage::COLOR_TARGET,
            initial_state: TextureState::Present,
            clear_value: Some(ClearValue::OPAQUE_BLACK),
        };
        self.textures.insert(
            handle,
            TextureInfo {
                desc,
                clear_value: ClearValue::OPAQUE_BLACK,
                swapchain_owned: true,
            },
        );
        self.states.register(handle, TextureState::Present);
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    /// Downcast the backend, e.g. to inspect a headless recording
    pub fn backend_as<T: 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    pub fn backend_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.backend.as_any_mut().downcast_mut::<T>()
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.backend.surface_size()
    }

    // Thread ownership

    /// Bind the context to the calling thread
    pub fn acquire(&mut self) -> RenderResult<()> {
        let current = std::thread::current().id();
        match self.owner {
            Some(owner) if owner != current => Err(RenderError::usage(
                "render context is acquired by another thread",
            )),
            _ => {
                self.owner = Some(current);
                Ok(())
            }
        }
    }

    /// Unbind the context from the calling thread
    pub fn release(&mut self) {
        if self.owner == Some(std::thread::current().id()) {
            self.owner = None;
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    fn check_owner(&self) -> RenderResult<()> {
        match self.owner {
            Some(owner) if owner != std::thread::current().id() => Err(RenderError::usage(
                "render context used from a thread that did not acquire it",
            )),
            _ => Ok(()),
        }
    }

    // Buffers

    /// Allocate `count * element_size` bytes rounded up to the backend alignment
    pub fn create_buffer(
        &mut self,
        count: u64,
        element_size: u64,
        usage: BufferUsage,
        label: &str,
    ) -> RenderResult<BufferHandle> {
        let desc = BufferDesc {
            label: Some(label.to_string()),
            count,
            element_size,
            usage,
        };
        self.create_buffer_from_desc(desc, None)
    }

    /// Allocate a buffer holding `data` (count = data length / element size)
    pub fn create_buffer_with_data(
        &mut self,
        data: &[u8],
        element_size: u64,
        usage: BufferUsage,
        label: &str,
    ) -> RenderResult<BufferHandle> {
        let element_size = element_size.max(1);
        let desc = BufferDesc {
            label: Some(label.to_string()),
            count: (data.len() as u64).div_ceil(element_size),
            element_size,
            usage,
        };
        self.create_buffer_from_desc(desc, Some(data))
    }

    fn create_buffer_from_desc(
        &mut self,
        desc: BufferDesc,
        data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        let requested = desc.requested_size();
        if requested == 0 {
            return Err(RenderError::usage(format!(
                "buffer {:?} has zero size",
                desc.label
            )));
        }
        let size = align_up(requested, self.backend.buffer_alignment(desc.usage));
        let handle = self.backend.create_buffer(&desc, size, data)?;
        log::debug!(
            "Created buffer {:?} ({} bytes, {} requested)",
            desc.label,
            size,
            requested
        );
        self.buffers.insert(handle, BufferInfo { desc, size });
        Ok(handle)
    }

    /// Allocated size including alignment padding
    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.size)
    }

    pub fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let info = self.buffers.get(&buffer).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.id(),
        })?;
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > info.size) {
            return Err(RenderError::usage(format!(
                "update of {} bytes at {} overflows buffer {:?} ({} bytes)",
                data.len(),
                offset,
                info.desc.label,
                info.size
            )));
        }
        self.backend.update_buffer(buffer, offset, data)
    }

    /// Read back the requested (unpadded) contents of a buffer
    pub fn read_buffer(&mut self, buffer: BufferHandle) -> RenderResult<Vec<u8>> {
        let info = self.buffers.get(&buffer).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.id(),
        })?;
        let size = info.desc.requested_size();
        self.backend.read_buffer(buffer, 0, size)
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.backend.destroy_buffer(buffer);
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    // Textures and samplers

    /// Create a texture, uploading `data` when given
    ///
    /// Without an explicit clear value depth formats clear to depth 1.0 /
    /// stencil 0 and color formats to transparent black.
    pub fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> RenderResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::usage(format!(
                "texture {:?} has zero extent",
                desc.label
            )));
        }
        if desc.format.is_depth() && desc.usage.contains(TextureUsage::COLOR_TARGET) {
            return Err(RenderError::InvalidFormatCombination(format!(
                "depth format {:?} used as a color target",
                desc.format
            )));
        }
        if !desc.format.is_depth() && desc.usage.contains(TextureUsage::DEPTH_TARGET) {
            return Err(RenderError::InvalidFormatCombination(format!(
                "color format {:?} used as a depth target",
                desc.format
            )));
        }
        if let Some(data) = data {
            if data.len() != desc.byte_size() {
                return Err(RenderError::usage(format!(
                    "texture {:?} expects {} bytes, got {}",
                    desc.label,
                    desc.byte_size(),
                    data.len()
                )));
            }
        }

        let clear_value = if desc.format.is_depth() {
            ClearValue::DEPTH_ONE
        } else {
            desc.clear_value.unwrap_or(ClearValue::TRANSPARENT_BLACK)
        };
        let mut desc = desc.clone();
        desc.clear_value = Some(clear_value);

        let handle = self.backend.create_texture(&desc, data)?;
        log::debug!(
            "Created texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        self.states.register(handle, desc.initial_state);
        self.textures.insert(
            handle,
            TextureInfo {
                desc,
                clear_value,
                swapchain_owned: false,
            },
        );
        Ok(handle)
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDesc> {
        self.textures.get(&texture).map(|t| &t.desc)
    }

    pub fn texture_clear_value(&self, texture: TextureHandle) -> Option<ClearValue> {
        self.textures.get(&texture).map(|t| t.clear_value)
    }

    pub fn texture_state(&self, texture: TextureHandle) -> Option<TextureState> {
        self.states.state(texture)
    }

    /// Live textures, not counting the swap-chain backbuffer
    pub fn texture_count(&self) -> usize {
        self.textures.values().filter(|t| !t.swapchain_owned).count()
    }

    /// Move a texture into `state` outside of a render pass
    pub fn transition_texture(&mut self, texture: TextureHandle, state: TextureState) -> RenderResult<()> {
        if !self.textures.contains_key(&texture) {
            return Err(RenderError::InvalidHandle {
                kind: "texture",
                id: texture.id(),
            });
        }
        self.states.transition(self.backend.as_mut(), texture, state);
        Ok(())
    }

    pub fn destroy_texture(&mut self, texture: TextureHandle) {
        match self.textures.get(&texture) {
            Some(info) if info.swapchain_owned => {
                log::warn!("Ignoring destroy of the swap-chain backbuffer");
            }
            Some(_) => {
                self.textures.remove(&texture);
                self.states.forget(texture);
                self.backend.destroy_texture(texture);
            }
            None => {}
        }
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let handle = self.backend.create_sampler(desc)?;
        self.samplers.insert(handle);
        Ok(handle)
    }

    pub fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if self.samplers.remove(&sampler) {
            self.backend.destroy_sampler(sampler);
        }
    }

    // Shaders and pipelines

    /// Load a shader program from `<root>/data/shaders/<name>` + the backend's extension
    pub fn create_shader(&mut self, name: &str, stages: ShaderStageFlags) -> RenderResult<ShaderHandle> {
        let desc = ShaderDesc {
            label: name.to_string(),
            path_stem: self.root_path.join("data").join("shaders").join(name),
            stages,
        };
        let handle = self.backend.create_shader(&desc).inspect_err(|e| {
            log::error!("Failed to load shader {name}: {e}");
        })?;
        self.shaders.insert(handle, name.to_string());
        Ok(handle)
    }

    pub fn destroy_shader(&mut self, shader: ShaderHandle) {
        if self.shaders.remove(&shader).is_some() {
            self.backend.destroy_shader(shader);
        }
    }

    /// Finalize `format` and build the backend's input layout for it
    pub fn create_vertex_format(&mut self, format: &mut VertexFormat) -> RenderResult<VertexFormatHandle> {
        format.validate()?;
        format.finalize();
        let layout = format.layout().ok_or(RenderError::UnfinalizedVertexFormat)?.clone();
        let handle = self.backend.create_vertex_format(&layout)?;
        self.vertex_formats.insert(handle, layout);
        Ok(handle)
    }

    pub fn vertex_layout(&self, format: VertexFormatHandle) -> Option<&VertexLayout> {
        self.vertex_formats.get(&format)
    }

    /// Compile a pipeline usable with `pass` and every pass sharing its formats
    pub fn create_pipeline(&mut self, desc: &PipelineStateDesc, pass: RenderPassHandle) -> RenderResult<PipelineHandle> {
        let pass_desc = self.render_passes.get(&pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: pass.id(),
        })?;
        if desc.color_formats != pass_desc.color_formats() || desc.depth_format != pass_desc.depth_format() {
            return Err(RenderError::InvalidFormatCombination(format!(
                "pipeline {:?} targets {:?}/{:?} but pass {:?} has {:?}/{:?}",
                desc.label,
                desc.color_formats,
                desc.depth_format,
                pass_desc.label,
                pass_desc.color_formats(),
                pass_desc.depth_format()
            )));
        }
        if desc.color_formats.len() > 8 {
            return Err(RenderError::InvalidFormatCombination(
                "more than 8 color targets".to_string(),
            ));
        }
        if !self.shaders.contains_key(&desc.shader) {
            return Err(RenderError::InvalidHandle {
                kind: "shader",
                id: desc.shader.id(),
            });
        }
        if let Some(format) = desc.vertex_format {
            if !self.vertex_formats.contains_key(&format) {
                return Err(RenderError::UnfinalizedVertexFormat);
            }
        }

        let handle = self.backend.create_pipeline(desc, pass).inspect_err(|e| {
            log::error!("Failed to create pipeline {:?}: {e}", desc.label);
        })?;
        log::debug!("Created pipeline {:?}", desc.label);
        self.pipelines.insert(
            handle,
            PipelineInfo {
                color_formats: desc.color_formats.clone(),
                depth_format: desc.depth_format,
                resource_layout: desc.resource_layout,
                topology: desc.topology,
                has_vertex_input: desc.vertex_format.is_some(),
            },
        );
        Ok(handle)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline).is_some() {
            self.backend.destroy_pipeline(pipeline);
        }
    }

    // Render passes and framebuffers

    pub fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RenderPassHandle> {
        if desc.color_attachments.iter().any(|a| a.format.is_depth()) {
            return Err(RenderError::InvalidFormatCombination(format!(
                "pass {:?} declares a depth format as a color attachment",
                desc.label
            )));
        }
        if let Some(depth) = desc.depth_attachment {
            if !depth.format.is_depth() {
                return Err(RenderError::InvalidFormatCombination(format!(
                    "pass {:?} declares color format {:?} as depth attachment",
                    desc.label, depth.format
                )));
            }
        }
        let handle = self.backend.create_render_pass(desc)?;
        self.render_passes.insert(handle, desc.clone());
        Ok(handle)
    }

    pub fn render_pass_desc(&self, pass: RenderPassHandle) -> Option<&RenderPassDesc> {
        self.render_passes.get(&pass)
    }

    pub fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        if self.render_passes.remove(&pass).is_some() {
            self.backend.destroy_render_pass(pass);
        }
    }

    /// Bind physical targets to a pass; formats and count must match its declaration
    pub fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RenderResult<FramebufferHandle> {
        let pass = self.render_passes.get(&desc.pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: desc.pass.id(),
        })?;
        if desc.color_targets.len() != pass.color_attachments.len()
            || desc.depth_target.is_some() != pass.depth_attachment.is_some()
        {
            return Err(RenderError::InvalidFormatCombination(format!(
                "framebuffer {:?} has {} color / {} depth targets, pass {:?} declares {} / {}",
                desc.label,
                desc.color_targets.len(),
                u8::from(desc.depth_target.is_some()),
                pass.label,
                pass.color_attachments.len(),
                u8::from(pass.depth_attachment.is_some())
            )));
        }

        let declared = pass
            .color_attachments
            .iter()
            .chain(pass.depth_attachment.iter())
            .map(|a| a.format);
        let mut extent = None;
        for (texture, declared) in desc.attachments().zip(declared) {
            let info = self.textures.get(&texture).ok_or(RenderError::InvalidHandle {
                kind: "texture",
                id: texture.id(),
            })?;
            if info.desc.format != declared {
                return Err(RenderError::InvalidFormatCombination(format!(
                    "framebuffer {:?} attachment {:?} is {:?}, pass {:?} declares {:?}",
                    desc.label, info.desc.label, info.desc.format, pass.label, declared
                )));
            }
            let size = (info.desc.width, info.desc.height);
            match extent {
                None => extent = Some(size),
                Some(e) if e != size => {
                    return Err(RenderError::InvalidFormatCombination(format!(
                        "framebuffer {:?} mixes attachment sizes {:?} and {:?}",
                        desc.label, e, size
                    )));
                }
                Some(_) => {}
            }
        }

        let handle = self.backend.create_framebuffer(desc)?;
        self.framebuffers.insert(handle, desc.clone());
        Ok(handle)
    }

    pub fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer).is_some() {
            self.backend.destroy_framebuffer(framebuffer);
        }
    }

    /// Begin `pass` on `framebuffer`
    ///
    /// Attachments move to their target states, then the pass's clears are
    /// applied and viewport/scissor are set to the pass's extent. An empty
    /// `clear_values` uses each attachment's own clear value.
    pub fn begin_render_pass(
        &mut self,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> RenderResult<()> {
        if self.frame.is_none() {
            return Err(RenderError::usage("begin_render_pass outside of a frame"));
        }
        if let Some(active) = self.active_pass {
            return Err(RenderError::usage(format!(
                "begin_render_pass while pass {} is active",
                active.pass.id()
            )));
        }
        let pass_desc = self.render_passes.get(&pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: pass.id(),
        })?;
        let fb = self.framebuffers.get(&framebuffer).ok_or(RenderError::InvalidHandle {
            kind: "framebuffer",
            id: framebuffer.id(),
        })?;
        if fb.pass != pass {
            let fb_pass = self.render_passes.get(&fb.pass);
            let compatible = fb_pass.is_some_and(|p| {
                p.color_formats() == pass_desc.color_formats()
                    && p.depth_format() == pass_desc.depth_format()
            });
            if !compatible {
                return Err(RenderError::InvalidFormatCombination(format!(
                    "framebuffer {:?} is not compatible with pass {:?}",
                    fb.label, pass_desc.label
                )));
            }
        }
        if !clear_values.is_empty() && clear_values.len() != pass_desc.attachment_count() {
            return Err(RenderError::usage(format!(
                "pass {:?} has {} attachments but {} clear values were given",
                pass_desc.label,
                pass_desc.attachment_count(),
                clear_values.len()
            )));
        }

        let mut batch = TransitionBatch::new();
        let mut clears = Vec::with_capacity(pass_desc.attachment_count());
        for texture in fb.attachments() {
            let info = self.textures.get(&texture).ok_or(RenderError::InvalidHandle {
                kind: "texture",
                id: texture.id(),
            })?;
            batch.add(texture, TextureState::attachment_for(info.desc.format));
            clears.push(info.clear_value);
        }
        if !clear_values.is_empty() {
            clears = clear_values.to_vec();
        }
        let viewport = pass_desc.viewport;
        let label = pass_desc.label.clone().unwrap_or_default();
        batch.flush(&mut self.states, self.backend.as_mut());

        self.backend.push_marker(&label);
        if let Err(e) = self.backend.begin_render_pass(pass, framebuffer, &clears) {
            self.backend.pop_marker();
            return Err(e);
        }
        self.backend.set_viewport(&viewport);
        self.backend.set_scissor(&viewport.scissor());
        self.active_pass = Some(ActivePass { pass, framebuffer });
        self.bound_pipeline = None;
        Ok(())
    }

    /// End the active pass and leave every attachment shader-readable
    pub fn end_render_pass(&mut self) -> RenderResult<()> {
        let active = self
            .active_pass
            .take()
            .ok_or_else(|| RenderError::usage("end_render_pass without an active pass"))?;
        self.bound_pipeline = None;
        self.backend.end_render_pass()?;
        self.backend.pop_marker();

        let mut batch = TransitionBatch::new();
        if let Some(fb) = self.framebuffers.get(&active.framebuffer) {
            for texture in fb.attachments() {
                batch.add(texture, TextureState::ShaderRead);
            }
        }
        batch.flush(&mut self.states, self.backend.as_mut());
        Ok(())
    }

    pub fn active_render_pass(&self) -> Option<RenderPassHandle> {
        self.active_pass.map(|a| a.pass)
    }

    // Resource tables

    pub fn create_resource_table(&mut self) -> RenderResult<ResourceTableHandle> {
        let handle = self.backend.create_resource_table()?;
        self.resource_tables.insert(handle, ResourceTable::new(handle));
        Ok(handle)
    }

    fn table_mut(&mut self, table: ResourceTableHandle) -> RenderResult<&mut ResourceTable> {
        self.resource_tables.get_mut(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.id(),
        })
    }

    fn check_buffers(&self, buffers: &[BufferHandle], usage: BufferUsage) -> RenderResult<()> {
        for buffer in buffers {
            let info = self.buffers.get(buffer).ok_or(RenderError::InvalidHandle {
                kind: "buffer",
                id: buffer.id(),
            })?;
            if !info.desc.usage.contains(usage) {
                return Err(RenderError::usage(format!(
                    "buffer {:?} bound as {:?} but created with {:?}",
                    info.desc.label, usage, info.desc.usage
                )));
            }
        }
        Ok(())
    }

    fn check_textures(&self, textures: &[TextureHandle]) -> RenderResult<()> {
        for texture in textures {
            let info = self.textures.get(texture).ok_or(RenderError::InvalidHandle {
                kind: "texture",
                id: texture.id(),
            })?;
            if !info.desc.usage.contains(TextureUsage::SAMPLED) {
                return Err(RenderError::usage(format!(
                    "texture {:?} bound for sampling without SAMPLED usage",
                    info.desc.label
                )));
            }
        }
        Ok(())
    }

    fn write_table(&mut self, table: ResourceTableHandle) -> RenderResult<()> {
        let desc = self.table_mut(table)?.desc().clone();
        self.backend.write_resource_table(table, &desc)
    }

    /// Fill the constant buffer slots; must precede textures and raw buffers
    pub fn set_constant_buffers(&mut self, table: ResourceTableHandle, buffers: &[BufferHandle]) -> RenderResult<()> {
        self.check_buffers(buffers, BufferUsage::UNIFORM)?;
        let entry = self.resource_tables.get_mut(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.id(),
        })?;
        entry.set_constant_buffers(&mut self.resource_heap, buffers)?;
        self.write_table(table)
    }

    /// Fill the texture slots, each paired with a sampler
    pub fn set_textures(
        &mut self,
        table: ResourceTableHandle,
        textures: &[TextureHandle],
        samplers: &[SamplerHandle],
    ) -> RenderResult<()> {
        self.check_textures(textures)?;
        if let Some(sampler) = samplers.iter().find(|s| !self.samplers.contains(s)) {
            return Err(RenderError::InvalidHandle {
                kind: "sampler",
                id: sampler.id(),
            });
        }
        let entry = self.resource_tables.get_mut(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.id(),
        })?;
        entry.set_textures(&mut self.resource_heap, &mut self.sampler_heap, textures, samplers)?;
        self.write_table(table)
    }

    /// Replace the textures of a table keeping its slots and samplers
    pub fn update_textures(&mut self, table: ResourceTableHandle, textures: &[TextureHandle]) -> RenderResult<()> {
        self.check_textures(textures)?;
        self.table_mut(table)?.update_textures(textures)?;
        self.write_table(table)
    }

    /// Fill the raw (storage) buffer slots; must come last
    pub fn set_buffers(&mut self, table: ResourceTableHandle, buffers: &[BufferHandle]) -> RenderResult<()> {
        self.check_buffers(buffers, BufferUsage::STORAGE)?;
        let entry = self.resource_tables.get_mut(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.id(),
        })?;
        entry.set_buffers(&mut self.resource_heap, buffers)?;
        self.write_table(table)
    }

    /// Slot layout of a table
    pub fn resource_table_desc(&self, table: ResourceTableHandle) -> Option<&ResourceTableDesc> {
        self.resource_tables.get(&table).map(|t| t.desc())
    }

    /// Make `table` active for following draws; requires a bound pipeline
    /// whose declared layout matches the table
    pub fn bind_resource_table(&mut self, table: ResourceTableHandle) -> RenderResult<()> {
        let pipeline = self
            .bound_pipeline
            .ok_or_else(|| RenderError::usage("bind_resource_table before set_pipeline"))?;
        let expected = self
            .pipelines
            .get(&pipeline)
            .map(|p| p.resource_layout)
            .unwrap_or_default();
        let entry = self.resource_tables.get(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.id(),
        })?;
        let layout = entry.desc().layout();
        if layout != expected {
            return Err(RenderError::ResourceLayoutMismatch(format!(
                "table {} holds {:?}, pipeline {} expects {:?}",
                table.id(),
                layout,
                pipeline.id(),
                expected
            )));
        }

        let mut batch = TransitionBatch::new();
        for texture in &entry.desc().textures {
            batch.add(*texture, TextureState::ShaderRead);
        }
        batch.flush(&mut self.states, self.backend.as_mut());
        self.backend.bind_resource_table(table)
    }

    pub fn destroy_resource_table(&mut self, table: ResourceTableHandle) {
        if let Some(mut entry) = self.resource_tables.remove(&table) {
            entry.release(&mut self.resource_heap, &mut self.sampler_heap);
            self.backend.destroy_resource_table(table);
        }
    }

    pub fn resource_table_count(&self) -> usize {
        self.resource_tables.len()
    }

    /// Slots currently allocated from the resource heap
    pub fn allocated_descriptor_slots(&self) -> u32 {
        self.resource_heap.allocated_count()
    }

    // Commands

    /// Bind a pipeline; its formats must match the active pass
    pub fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        let active = self
            .active_pass
            .ok_or_else(|| RenderError::usage("set_pipeline outside of a render pass"))?;
        let info = self.pipelines.get(&pipeline).ok_or(RenderError::InvalidHandle {
            kind: "pipeline",
            id: pipeline.id(),
        })?;
        let pass = self.render_passes.get(&active.pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: active.pass.id(),
        })?;
        if info.color_formats != pass.color_formats() || info.depth_format != pass.depth_format() {
            return Err(RenderError::InvalidFormatCombination(format!(
                "pipeline {} does not match pass {:?}",
                pipeline.id(),
                pass.label
            )));
        }
        self.backend.set_pipeline(pipeline)?;
        self.bound_pipeline = Some(pipeline);
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: &Viewport) {
        self.backend.set_viewport(viewport);
    }

    pub fn set_scissor(&mut self, rect: &ScissorRect) {
        self.backend.set_scissor(rect);
    }

    fn bound_pipeline_info(&self) -> RenderResult<&PipelineInfo> {
        if self.active_pass.is_none() {
            return Err(RenderError::usage("draw outside of a render pass"));
        }
        let pipeline = self
            .bound_pipeline
            .ok_or_else(|| RenderError::usage("draw without a bound pipeline"))?;
        self.pipelines.get(&pipeline).ok_or(RenderError::InvalidHandle {
            kind: "pipeline",
            id: pipeline.id(),
        })
    }

    pub fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()> {
        let info = self.bound_pipeline_info()?;
        if info.has_vertex_input && draw.vertex_buffer.is_none() {
            return Err(RenderError::usage(
                "pipeline expects vertex input but the draw has no vertex buffer",
            ));
        }
        if draw.element_count == 0 || draw.instance_count == 0 {
            return Ok(());
        }
        self.backend.draw(draw)
    }

    /// Draw inline vertex/index data through the per-frame dynamic ring
    ///
    /// `stride` is the size of one vertex; without indices every vertex is drawn.
    pub fn draw_dynamic(&mut self, vertices: &[u8], stride: u32, indices: &[u16]) -> RenderResult<()> {
        let (topology, has_vertex_input) = {
            let info = self.bound_pipeline_info()?;
            (info.topology, info.has_vertex_input)
        };
        if !has_vertex_input {
            return Err(RenderError::usage("draw_dynamic needs a pipeline with vertex input"));
        }
        if stride == 0 {
            return Err(RenderError::UnfinalizedVertexFormat);
        }
        if vertices.is_empty() {
            return Ok(());
        }
        let ring = self
            .dynamic
            .as_mut()
            .ok_or_else(|| RenderError::usage("dynamic ring not initialized"))?;

        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let vertex_offset = ring.vertex_cursor;
        let vertex_end = align_up(vertex_offset + vertices.len() as u64, 4);
        let index_offset = ring.index_cursor;
        let index_end = align_up(index_offset + index_bytes.len() as u64, 4);
        if vertex_end > DYNAMIC_VERTEX_CAPACITY || index_end > DYNAMIC_INDEX_CAPACITY {
            return Err(RenderError::OutOfMemory(
                "dynamic geometry ring is full for this frame".to_string(),
            ));
        }
        ring.vertex_cursor = vertex_end;
        ring.index_cursor = index_end;
        let (vertex_buffer, index_buffer) = (ring.vertex_buffer, ring.index_buffer);

        let mut padded = vertices.to_vec();
        padded.resize((vertex_end - vertex_offset) as usize, 0);
        self.backend.update_buffer(vertex_buffer, vertex_offset, &padded)?;
        let vertex_view = VertexBufferView {
            buffer: vertex_buffer,
            offset: vertex_offset,
        };
        let draw = if indices.is_empty() {
            DrawCommand {
                vertex_buffer: Some(vertex_view),
                index_buffer: None,
                element_count: (vertices.len() / stride as usize) as u32,
                instance_count: 1,
            }
        } else {
            let mut padded = index_bytes.to_vec();
            padded.resize((index_end - index_offset) as usize, 0);
            self.backend.update_buffer(index_buffer, index_offset, &padded)?;
            DrawCommand {
                vertex_buffer: Some(vertex_view),
                index_buffer: Some(IndexBufferView {
                    buffer: index_buffer,
                    offset: index_offset,
                    format: IndexFormat::Uint16,
                }),
                element_count: indices.len() as u32,
                instance_count: 1,
            }
        };
        log::trace!("Dynamic draw ({:?}, {} elements)", topology, draw.element_count);
        self.backend.draw(&draw)
    }

    pub fn push_marker(&mut self, label: &str) {
        self.backend.push_marker(label);
    }

    pub fn pop_marker(&mut self) {
        self.backend.pop_marker();
    }

    // Frame lifecycle

    pub fn begin_frame(&mut self) -> RenderResult<FrameInfo> {
        self.check_owner()?;
        if self.frame.is_some() {
            return Err(RenderError::usage("begin_frame inside a frame"));
        }
        let info = self.backend.begin_frame()?;
        if let Some(texture) = self.textures.get_mut(&info.backbuffer) {
            texture.desc.width = info.width;
            texture.desc.height = info.height;
        }
        if let Some(ring) = self.dynamic.as_mut() {
            ring.vertex_cursor = 0;
            ring.index_cursor = 0;
        }
        self.frame_index += 1;
        self.frame = Some(info);
        log::trace!("Frame {} begun", self.frame_index);
        Ok(info)
    }

    /// Finish recording and submit; the backbuffer ends in the present state
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.check_owner()?;
        let frame = self
            .frame
            .take()
            .ok_or_else(|| RenderError::usage("end_frame without begin_frame"))?;
        if self.active_pass.is_some() {
            self.frame = Some(frame);
            return Err(RenderError::usage("end_frame inside a render pass"));
        }
        self.states
            .transition(self.backend.as_mut(), frame.backbuffer, TextureState::Present);
        self.backend.end_frame()
    }

    /// Present the last submitted frame
    pub fn swap(&mut self) -> RenderResult<()> {
        self.check_owner()?;
        self.backend.present()
    }

    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub fn backbuffer(&self) -> TextureHandle {
        self.backend.backbuffer()
    }

    pub fn backbuffer_format(&self) -> TextureFormat {
        self.backend.backbuffer_format()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.backend.resize(width, height);
        let (width, height) = self.backend.surface_size();
        let backbuffer = self.backend.backbuffer();
        if let Some(texture) = self.textures.get_mut(&backbuffer) {
            texture.desc.width = width;
            texture.desc.height = height;
        }
        log::info!("Render context resized to {width}x{height}");
    }

    pub fn wait_idle(&mut self) {
        self.backend.wait_idle();
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.backend.wait_idle();
    }
}

/// A render context shared between threads
///
/// [`SharedRenderContext::acquire`] locks the context and binds it to the
/// calling thread until the guard is dropped.
#[derive(Clone)]
pub struct SharedRenderContext {
    inner: Arc<Mutex<RenderContext>>,
}

impl SharedRenderContext {
    pub fn new(context: RenderContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    pub fn acquire(&self) -> RenderResult<ContextGuard<'_>> {
        let mut guard = self.inner.lock();
        guard.acquire()?;
        Ok(ContextGuard { guard })
    }
}

/// Exclusive access to a shared context on the current thread
pub struct ContextGuard<'a> {
    guard: MutexGuard<'a, RenderContext>,
}

impl Deref for ContextGuard<'_> {
    type Target = RenderContext;

    fn deref(&self) -> &RenderContext {
        &self.guard
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut RenderContext {
        &mut self.guard
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

static_assertions::assert_impl_all!(RenderContext: Send);
static_assertions::assert_impl_all!(SharedRenderContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, RecordedCommand};

    fn context() -> RenderContext {
        RenderContext::new(Box::new(HeadlessBackend::new(64, 64)), ".").unwrap()
    }

    #[test]
    fn uniform_buffers_round_to_256() {
        let mut ctx = context();
        let buffer = ctx
            .create_buffer(1, 80, BufferUsage::UNIFORM, "constants")
            .unwrap();
        assert_eq!(ctx.buffer_size(buffer), Some(256));
        let vertices = ctx
            .create_buffer(3, 12, BufferUsage::VERTEX, "vertices")
            .unwrap();
        assert_eq!(ctx.buffer_size(vertices), Some(36));
    }

    #[test]
    fn read_back_returns_requested_bytes_only() {
        let mut ctx = context();
        let data: Vec<u8> = (0..80).collect();
        let buffer = ctx
            .create_buffer(1, 80, BufferUsage::UNIFORM, "constants")
            .unwrap();
        ctx.update_buffer(buffer, 0, &data).unwrap();
        assert_eq!(ctx.read_buffer(buffer).unwrap(), data);
    }

    #[test]
    fn depth_textures_clear_to_one() {
        let mut ctx = context();
        let mut desc = TextureDesc::render_target("depth", 8, 8, TextureFormat::Depth32Float);
        desc.clear_value = Some(ClearValue::Color([0.5; 4]));
        let depth = ctx.create_texture(&desc, None).unwrap();
        assert_eq!(ctx.texture_clear_value(depth), Some(ClearValue::DEPTH_ONE));

        let color = ctx
            .create_texture(
                &TextureDesc::render_target("color", 8, 8, TextureFormat::Rgba8Unorm),
                None,
            )
            .unwrap();
        assert_eq!(
            ctx.texture_clear_value(color),
            Some(ClearValue::TRANSPARENT_BLACK)
        );
    }

    #[test]
    fn mismatched_upload_size_is_rejected() {
        let mut ctx = context();
        let desc = TextureDesc {
            width: 2,
            height: 2,
            ..Default::default()
        };
        assert!(ctx.create_texture(&desc, Some(&[0u8; 15])).is_err());
        assert_eq!(ctx.texture_count(), 0);
    }

    #[test]
    fn acquire_from_second_thread_fails_until_release() {
        let mut ctx = context();
        ctx.acquire().unwrap();
        let mut ctx = std::thread::spawn(move || {
            assert!(matches!(ctx.acquire(), Err(RenderError::Usage(_))));
            assert!(ctx.begin_frame().is_err());
            ctx
        })
        .join()
        .unwrap();

        ctx.release();
        std::thread::spawn(move || {
            ctx.acquire().unwrap();
            assert_eq!(ctx.owner(), Some(std::thread::current().id()));
            ctx.begin_frame().unwrap();
            ctx.end_frame().unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn shared_context_follows_the_guard() {
        let shared = SharedRenderContext::new(context());
        {
            let mut guard = shared.acquire().unwrap();
            guard.begin_frame().unwrap();
            guard.end_frame().unwrap();
        }
        let other = shared.clone();
        std::thread::spawn(move || {
            let guard = other.acquire().unwrap();
            assert_eq!(guard.owner(), Some(std::thread::current().id()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn update_past_the_address_space_is_a_range_error() {
        let mut ctx = context();
        let buffer = ctx
            .create_buffer(1, 16, BufferUsage::UNIFORM, "constants")
            .unwrap();
        assert!(matches!(
            ctx.update_buffer(buffer, u64::MAX, &[0u8; 4]),
            Err(RenderError::Usage(_))
        ));
        assert!(matches!(
            ctx.update_buffer(buffer, 250, &[0u8; 8]),
            Err(RenderError::Usage(_))
        ));
        ctx.update_buffer(buffer, 240, &[0u8; 16]).unwrap();
    }

    #[test]
    fn failed_pass_begin_leaves_markers_balanced() {
        let mut ctx = context();
        let pass = ctx
            .create_render_pass(&RenderPassDesc {
                label: Some("failing".into()),
                color_attachments: vec![AttachmentDesc::clear_store(TextureFormat::Rgba8Unorm)],
                depth_attachment: None,
                viewport: Viewport::full(8, 8),
            })
            .unwrap();
        let color = ctx
            .create_texture(
                &TextureDesc::render_target("color", 8, 8, TextureFormat::Rgba8Unorm),
                None,
            )
            .unwrap();
        let framebuffer = ctx
            .create_framebuffer(&FramebufferDesc {
                label: None,
                pass,
                color_targets: vec![color],
                depth_target: None,
            })
            .unwrap();

        ctx.begin_frame().unwrap();
        ctx.backend_as_mut::<HeadlessBackend>()
            .unwrap()
            .fail_next_render_pass();
        assert!(matches!(
            ctx.begin_render_pass(pass, framebuffer, &[]),
            Err(RenderError::SurfaceLost)
        ));
        assert_eq!(ctx.active_render_pass(), None);
        ctx.begin_render_pass(pass, framebuffer, &[]).unwrap();
        ctx.end_render_pass().unwrap();
        ctx.end_frame().unwrap();

        let commands = ctx.backend_as::<HeadlessBackend>().unwrap().commands();
        let pushes = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::PushMarker(_)))
            .count();
        let pops = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::PopMarker))
            .count();
        assert_eq!((pushes, pops), (2, 2));
    }

    #[test]
    fn frame_brackets_are_enforced() {
        let mut ctx = context();
        assert!(ctx.end_frame().is_err());
        ctx.begin_frame().unwrap();
        assert!(ctx.begin_frame().is_err());
        ctx.end_frame().unwrap();
        ctx.swap().unwrap();
        assert_eq!(ctx.frame_index(), 1);
    }
}
