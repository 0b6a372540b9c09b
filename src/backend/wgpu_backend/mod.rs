//! wgpu backend implementation
//!
//! Drives the DX12 and OpenGL backends through wgpu, restricted to a single
//! native API. Render pass commands are buffered and encoded when the pass
//! ends. Buffer updates made while a pass is recording are staged; when the
//! pass already read the buffer the pass is split so earlier draws keep the
//! old contents.

mod conversion;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::backend::reflect::{self, BindingKind, BoundResource};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::BackendType;

/// Handle id reserved for the swap-chain texture
const BACKBUFFER_ID: u64 = 1;

/// Entry point of a GLSL stage
const GLSL_ENTRY: &str = "main";

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct WgpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

enum ShaderModules {
    /// One WGSL module holding every stage
    Single(wgpu::ShaderModule),
    /// Separately compiled GLSL stages
    Split {
        vertex: wgpu::ShaderModule,
        fragment: Option<wgpu::ShaderModule>,
    },
}

struct WgpuShader {
    modules: ShaderModules,
    stages: ShaderStageFlags,
    bindings: BTreeMap<u32, BindingKind>,
}

impl WgpuShader {
    fn vertex(&self) -> (&wgpu::ShaderModule, &'static str) {
        match &self.modules {
            ShaderModules::Single(module) => (module, crate::backend::VERTEX_ENTRY),
            ShaderModules::Split { vertex, .. } => (vertex, GLSL_ENTRY),
        }
    }

    fn fragment(&self) -> Option<(&wgpu::ShaderModule, &'static str)> {
        if !self.stages.contains(ShaderStageFlags::FRAGMENT) {
            return None;
        }
        match &self.modules {
            ShaderModules::Single(module) => Some((module, crate::backend::FRAGMENT_ENTRY)),
            ShaderModules::Split { fragment, .. } => fragment.as_ref().map(|m| (m, GLSL_ENTRY)),
        }
    }
}

struct WgpuPipeline {
    pipeline: wgpu::RenderPipeline,
    /// Auto-derived layout of group 0; absent when the shader binds nothing
    bind_group_layout: Option<wgpu::BindGroupLayout>,
    bindings: BTreeMap<u32, BindingKind>,
}

struct WgpuFramebuffer {
    colors: Vec<u64>,
    depth: Option<u64>,
}

/// Bind group built for one (table, pipeline) pair
#[derive(Clone)]
struct CachedBindGroup {
    group: Arc<wgpu::BindGroup>,
    buffers: Vec<u64>,
}

/// Buffered render pass command
#[derive(Clone)]
enum PassCommand {
    SetPipeline(u64),
    SetBindGroup(Arc<wgpu::BindGroup>),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Draw(DrawCommand),
}

/// Buffer write copied into place before a pass segment starts
struct StagedUpload {
    staging: wgpu::Buffer,
    target: u64,
    offset: u64,
    size: u64,
}

/// Commands sharing one wgpu render pass
#[derive(Default)]
struct Segment {
    uploads: Vec<StagedUpload>,
    commands: Vec<PassCommand>,
    reads: HashSet<u64>,
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    pass: u64,
    framebuffer: u64,
    clears: Vec<ClearValue>,
    segments: Vec<Segment>,
    pipeline: Option<u64>,
    bind_group: Option<CachedBindGroup>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
}

impl PendingRenderPass {
    fn current(&mut self) -> &mut Segment {
        if self.segments.is_empty() {
            self.segments.push(Segment::default());
        }
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn push(&mut self, command: PassCommand) {
        self.current().commands.push(command);
    }

    /// Queue an upload, splitting the pass when earlier draws read the target
    fn stage(&mut self, upload: StagedUpload) {
        if !self.current().reads.contains(&upload.target) {
            self.current().uploads.push(upload);
            return;
        }
        let mut segment = Segment {
            uploads: vec![upload],
            ..Default::default()
        };
        // A new wgpu pass starts with no state
        if let Some(pipeline) = self.pipeline {
            segment.commands.push(PassCommand::SetPipeline(pipeline));
        }
        if let Some(bound) = &self.bind_group {
            segment.commands.push(PassCommand::SetBindGroup(bound.group.clone()));
            segment.reads.extend(bound.buffers.iter().copied());
        }
        if let Some(viewport) = self.viewport {
            segment.commands.push(PassCommand::SetViewport(viewport));
        }
        if let Some(scissor) = self.scissor {
            segment.commands.push(PassCommand::SetScissor(scissor));
        }
        log::trace!("Splitting pass {} at segment {}", self.pass, self.segments.len());
        self.segments.push(segment);
    }
}

/// wgpu backend implementation
pub struct WgpuBackend {
    backend_type: BackendType,
    _instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    _adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    surface_format: TextureFormat,
    current_texture: Option<wgpu::SurfaceTexture>,
    surface_view: Option<wgpu::TextureView>,

    buffers: HashMap<u64, WgpuBuffer>,
    textures: HashMap<u64, WgpuTexture>,
    samplers: HashMap<u64, wgpu::Sampler>,
    shaders: HashMap<u64, WgpuShader>,
    vertex_formats: HashMap<u64, VertexLayout>,
    pipelines: HashMap<u64, WgpuPipeline>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, WgpuFramebuffer>,
    tables: HashMap<u64, ResourceTableDesc>,
    bind_groups: HashMap<(u64, u64), CachedBindGroup>,
    next_id: u64,

    encoder: Option<wgpu::CommandEncoder>,
    pending_pass: Option<PendingRenderPass>,
    /// One entry per pushed marker: whether it reached the encoder
    markers: Vec<bool>,
}

impl WgpuBackend {
    /// Create a wgpu device restricted to `backend_type`'s native API
    pub fn new(window: Arc<Window>, backend_type: BackendType, vsync: bool) -> RenderResult<Self> {
        let backends = match backend_type {
            BackendType::Dx12 => wgpu::Backends::DX12,
            BackendType::OpenGl => wgpu::Backends::GL,
            other => return Err(RenderError::BackendUnavailable(other)),
        };
        pollster::block_on(Self::new_async(window, backend_type, backends, vsync))
    }

    async fn new_async(
        window: Arc<Window>,
        backend_type: BackendType,
        backends: wgpu::Backends,
        vsync: bool,
    ) -> RenderResult<Self> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::Initialization(format!("surface creation failed: {e}")))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                log::error!("No {backend_type:?} adapter found");
                RenderError::BackendUnavailable(backend_type)
            })?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: match backend_type {
                        BackendType::OpenGl => wgpu::Limits::downlevel_defaults(),
                        _ => wgpu::Limits::default(),
                    }
                    .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| {
                log::error!("Device creation failed: {e}");
                RenderError::Initialization(e.to_string())
            })?;
        device.on_uncaptured_error(Box::new(|e| log::error!("wgpu error: {e}")));

        let caps = surface.get_capabilities(&adapter);
        let (format, surface_format) = caps
            .formats
            .iter()
            .filter(|f| !f.is_srgb())
            .find_map(|f| conversion::texture_format_back(*f).map(|engine| (*f, engine)))
            .ok_or_else(|| {
                RenderError::Initialization("surface offers no supported color format".into())
            })?;

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &surface_config);
        log::info!(
            "Surface configured: {}x{} {:?}, vsync {}",
            surface_config.width,
            surface_config.height,
            format,
            vsync
        );

        Ok(Self {
            backend_type,
            _instance: instance,
            surface,
            _adapter: adapter,
            device,
            queue,
            surface_config,
            surface_format,
            current_texture: None,
            surface_view: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            vertex_formats: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            tables: HashMap::new(),
            bind_groups: HashMap::new(),
            next_id: BACKBUFFER_ID + 1,
            encoder: None,
            pending_pass: None,
            markers: Vec::new(),
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn view(&self, texture: u64) -> Option<&wgpu::TextureView> {
        if texture == BACKBUFFER_ID {
            self.surface_view.as_ref()
        } else {
            self.textures.get(&texture).map(|t| &t.view)
        }
    }

    fn texture_size(&self, texture: u64) -> (u32, u32) {
        if texture == BACKBUFFER_ID {
            (self.surface_config.width, self.surface_config.height)
        } else {
            self.textures
                .get(&texture)
                .map(|t| (t.width, t.height))
                .unwrap_or((1, 1))
        }
    }

    /// Run `f` inside a validation error scope
    fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn load_wgsl(&self, desc: &ShaderDesc) -> RenderResult<WgpuShader> {
        let path = crate::backend::shader_path(&desc.path_stem, ".wgsl");
        let source =
            std::fs::read_to_string(&path).map_err(|_| RenderError::AssetNotFound(path.clone()))?;
        let module = reflect::parse_wgsl(&source, &path)?;
        crate::backend::check_entry_points(&module, desc.stages, &path)?;
        let bindings = reflect::used_bindings(&module);

        let (shader, error) = self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            })
        });
        if let Some(error) = error {
            return Err(RenderError::CompileFailure {
                path,
                log: error.to_string(),
            });
        }
        Ok(WgpuShader {
            modules: ShaderModules::Single(shader),
            stages: desc.stages,
            bindings,
        })
    }

    fn load_glsl_stage(
        &self,
        label: &str,
        path: &Path,
        stage: wgpu::naga::ShaderStage,
        reflect_stage: naga::ShaderStage,
        bindings: &mut BTreeMap<u32, BindingKind>,
    ) -> RenderResult<wgpu::ShaderModule> {
        let source =
            std::fs::read_to_string(path).map_err(|_| RenderError::AssetNotFound(path.to_path_buf()))?;
        let module = reflect::parse_glsl(&source, reflect_stage, path)?;
        reflect::merge_bindings(bindings, reflect::used_bindings(&module), path)?;

        let (shader, error) = self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Glsl {
                    shader: source.as_str().into(),
                    stage,
                    defines: Default::default(),
                },
            })
        });
        match error {
            Some(error) => Err(RenderError::CompileFailure {
                path: path.to_path_buf(),
                log: error.to_string(),
            }),
            None => Ok(shader),
        }
    }

    fn load_glsl(&self, desc: &ShaderDesc) -> RenderResult<WgpuShader> {
        let mut bindings = BTreeMap::new();
        let vertex_path = crate::backend::shader_path(&desc.path_stem, "_vert.glsl");
        let vertex = self.load_glsl_stage(
            &desc.label,
            &vertex_path,
            wgpu::naga::ShaderStage::Vertex,
            naga::ShaderStage::Vertex,
            &mut bindings,
        )?;

        let fragment = if desc.stages.contains(ShaderStageFlags::FRAGMENT) {
            let fragment_path = crate::backend::shader_path(&desc.path_stem, "_frag.glsl");
            Some(self.load_glsl_stage(
                &desc.label,
                &fragment_path,
                wgpu::naga::ShaderStage::Fragment,
                naga::ShaderStage::Fragment,
                &mut bindings,
            )?)
        } else {
            None
        };
        Ok(WgpuShader {
            modules: ShaderModules::Split { vertex, fragment },
            stages: desc.stages,
            bindings,
        })
    }

    /// Bind group of `table` laid out for `pipeline`, built on first use
    fn bind_group(&mut self, table: u64, pipeline: u64) -> RenderResult<Option<CachedBindGroup>> {
        if let Some(cached) = self.bind_groups.get(&(table, pipeline)) {
            return Ok(Some(cached.clone()));
        }
        let pipe = self.pipelines.get(&pipeline).ok_or(RenderError::InvalidHandle {
            kind: "pipeline",
            id: pipeline,
        })?;
        let Some(layout) = &pipe.bind_group_layout else {
            return Ok(None);
        };
        let desc = self.tables.get(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table,
        })?;

        let mut entries = Vec::with_capacity(pipe.bindings.len());
        let mut buffers = Vec::new();
        for (&binding, &kind) in &pipe.bindings {
            let resource = reflect::resolve_binding(desc, binding);
            let resource = match (kind, resource) {
                (
                    BindingKind::UniformBuffer | BindingKind::StorageBuffer,
                    Some(BoundResource::Buffer(buffer)),
                ) => {
                    let buf = self.buffers.get(&buffer.0).ok_or(RenderError::InvalidHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    buffers.push(buffer.0);
                    buf.buffer.as_entire_binding()
                }
                (BindingKind::Texture { .. }, Some(BoundResource::Texture(texture))) => {
                    let view = self
                        .textures
                        .get(&texture.0)
                        .map(|t| &t.view)
                        .ok_or(RenderError::InvalidHandle {
                            kind: "texture",
                            id: texture.0,
                        })?;
                    wgpu::BindingResource::TextureView(view)
                }
                (BindingKind::Sampler { .. }, Some(BoundResource::Sampler(sampler))) => {
                    let s = self.samplers.get(&sampler.0).ok_or(RenderError::InvalidHandle {
                        kind: "sampler",
                        id: sampler.0,
                    })?;
                    wgpu::BindingResource::Sampler(s)
                }
                (kind, found) => {
                    return Err(RenderError::ResourceLayoutMismatch(format!(
                        "shader binding {binding} expects {kind:?}, table {table} provides {found:?}"
                    )));
                }
            };
            entries.push(wgpu::BindGroupEntry { binding, resource });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("resource table"),
            layout,
            entries: &entries,
        });
        let cached = CachedBindGroup {
            group: Arc::new(group),
            buffers,
        };
        self.bind_groups.insert((table, pipeline), cached.clone());
        Ok(Some(cached))
    }

    fn stage_upload(&self, target: u64, offset: u64, data: &[u8]) -> StagedUpload {
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("staged upload"),
            contents: data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        StagedUpload {
            staging,
            target,
            offset,
            size: data.len() as u64,
        }
    }

    /// Encode a finished pass, one wgpu render pass per segment
    fn encode_pass(&self, encoder: &mut wgpu::CommandEncoder, pending: &PendingRenderPass) -> RenderResult<()> {
        let pass = self.render_passes.get(&pending.pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: pending.pass,
        })?;
        let framebuffer = self
            .framebuffers
            .get(&pending.framebuffer)
            .ok_or(RenderError::InvalidHandle {
                kind: "framebuffer",
                id: pending.framebuffer,
            })?;
        let extent = framebuffer
            .colors
            .first()
            .copied()
            .or(framebuffer.depth)
            .map(|t| self.texture_size(t))
            .unwrap_or((1, 1));
        let clear_for = |index: usize| pending.clears.get(index).copied().unwrap_or(ClearValue::TRANSPARENT_BLACK);

        for (index, segment) in pending.segments.iter().enumerate() {
            for upload in &segment.uploads {
                if let Some(target) = self.buffers.get(&upload.target) {
                    encoder.copy_buffer_to_buffer(
                        &upload.staging,
                        0,
                        &target.buffer,
                        upload.offset,
                        upload.size,
                    );
                }
            }
            let first = index == 0;

            let mut color_attachments = Vec::with_capacity(framebuffer.colors.len());
            for (slot, (texture, attachment)) in framebuffer
                .colors
                .iter()
                .zip(&pass.color_attachments)
                .enumerate()
            {
                let view = self.view(*texture).ok_or(RenderError::InvalidHandle {
                    kind: "texture",
                    id: *texture,
                })?;
                let load = if first {
                    conversion::color_load_op(attachment.load_op, &clear_for(slot))
                } else {
                    wgpu::LoadOp::Load
                };
                color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: conversion::store_op(attachment.store_op),
                    },
                }));
            }

            let depth_attachment = match (framebuffer.depth, pass.depth_attachment) {
                (Some(texture), Some(attachment)) => {
                    let view = self.view(texture).ok_or(RenderError::InvalidHandle {
                        kind: "texture",
                        id: texture,
                    })?;
                    let load = if first {
                        conversion::depth_load_op(attachment.load_op, &clear_for(framebuffer.colors.len()))
                    } else {
                        wgpu::LoadOp::Load
                    };
                    Some(wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load,
                            store: conversion::store_op(attachment.store_op),
                        }),
                        stencil_ops: None,
                    })
                }
                _ => None,
            };

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pass.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for command in &segment.commands {
                match command {
                    PassCommand::SetPipeline(id) => {
                        if let Some(pipeline) = self.pipelines.get(id) {
                            render_pass.set_pipeline(&pipeline.pipeline);
                        }
                    }
                    PassCommand::SetBindGroup(group) => {
                        render_pass.set_bind_group(0, group.as_ref(), &[]);
                    }
                    PassCommand::SetViewport(v) => {
                        render_pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                    }
                    PassCommand::SetScissor(rect) => {
                        let x = rect.x.min(extent.0);
                        let y = rect.y.min(extent.1);
                        let width = rect.width.min(extent.0 - x);
                        let height = rect.height.min(extent.1 - y);
                        render_pass.set_scissor_rect(x, y, width, height);
                    }
                    PassCommand::Draw(draw) => self.replay_draw(&mut render_pass, draw),
                }
            }
        }
        Ok(())
    }

    fn replay_draw<'a>(&'a self, render_pass: &mut wgpu::RenderPass<'a>, draw: &DrawCommand) {
        if let Some(view) = draw.vertex_buffer {
            match self.buffers.get(&view.buffer.0) {
                Some(buffer) => render_pass.set_vertex_buffer(0, buffer.buffer.slice(view.offset..)),
                None => return,
            }
        }
        let instances = 0..draw.instance_count;
        match draw.index_buffer {
            Some(view) => {
                let Some(buffer) = self.buffers.get(&view.buffer.0) else {
                    return;
                };
                render_pass.set_index_buffer(
                    buffer.buffer.slice(view.offset..),
                    conversion::index_format(view.format),
                );
                render_pass.draw_indexed(0..draw.element_count, 0, instances);
            }
            None => render_pass.draw(0..draw.element_count, instances),
        }
    }

    fn forget_bind_groups(&mut self) {
        self.bind_groups.clear();
    }
}

fn pad_to_copy_alignment(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if data.len() % align == 0 {
        data.into()
    } else {
        let mut padded = data.to_vec();
        padded.resize(data.len().next_multiple_of(align), 0);
        padded.into()
    }
}

impl BufferApi for WgpuBackend {
    fn buffer_alignment(&self, usage: BufferUsage) -> u64 {
        if usage.contains(BufferUsage::UNIFORM) {
            match self.backend_type {
                BackendType::OpenGl => 16,
                _ => 256,
            }
        } else {
            wgpu::COPY_BUFFER_ALIGNMENT
        }
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        size: u64,
        data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        let size = size.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size,
            usage: conversion::buffer_usage(desc.usage),
            mapped_at_creation: data.is_some(),
        });
        if let Some(data) = data {
            if data.len() as u64 > size {
                buffer.destroy();
                return Err(RenderError::usage(format!(
                    "initial data of {} bytes exceeds buffer size {size}",
                    data.len()
                )));
            }
            buffer.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
            buffer.unmap();
        }
        let id = self.allocate_id();
        log::debug!("WgpuBackend: buffer {id} {:?} ({size} bytes)", desc.label);
        self.buffers.insert(id, WgpuBuffer { buffer, size });
        Ok(BufferHandle(id))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let size = self
            .buffers
            .get(&buffer.0)
            .map(|b| b.size)
            .ok_or(RenderError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        let data = pad_to_copy_alignment(data);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + data.len() as u64 > size {
            return Err(RenderError::usage(format!(
                "update of {} bytes at offset {offset} does not fit buffer {} ({size} bytes)",
                data.len(),
                buffer.0
            )));
        }

        if self.pending_pass.is_some() {
            let upload = self.stage_upload(buffer.0, offset, &data);
            if let Some(pending) = self.pending_pass.as_mut() {
                pending.stage(upload);
            }
        } else if self.encoder.is_some() {
            let upload = self.stage_upload(buffer.0, offset, &data);
            if let (Some(encoder), Some(target)) = (self.encoder.as_mut(), self.buffers.get(&buffer.0)) {
                encoder.copy_buffer_to_buffer(&upload.staging, 0, &target.buffer, offset, upload.size);
            }
        } else if let Some(target) = self.buffers.get(&buffer.0) {
            self.queue.write_buffer(&target.buffer, offset, &data);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> RenderResult<Vec<u8>> {
        let source = self.buffers.get(&buffer.0).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let copy_size = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + copy_size > source.size {
            return Err(RenderError::usage(format!(
                "read of {size} bytes at offset {offset} exceeds buffer {}",
                buffer.0
            )));
        }
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: copy_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&source.buffer, offset, &readback, 0, copy_size);

        // Work recorded so far this frame must land before the copy
        let mut submissions = Vec::with_capacity(2);
        if let Some(frame_encoder) = self.encoder.take() {
            submissions.push(frame_encoder.finish());
            self.encoder = Some(
                self.device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame Encoder") }),
            );
        }
        submissions.push(encoder.finish());
        self.queue.submit(submissions);

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| RenderError::usage("buffer readback was dropped"))?
            .map_err(|e| RenderError::usage(format!("buffer readback failed: {e}")))?;

        let data = slice.get_mapped_range()[..size as usize].to_vec();
        readback.unmap();
        Ok(data)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.remove(&buffer.0) {
            b.buffer.destroy();
            self.forget_bind_groups();
            log::debug!("WgpuBackend: destroyed buffer {}", buffer.0);
        }
    }
}

impl TextureApi for WgpuBackend {
    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> RenderResult<TextureHandle> {
        let size = wgpu::Extent3d {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size,
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: conversion::texture_format(desc.format),
            usage: conversion::texture_usage(desc.usage),
            view_formats: &[],
        });

        if let Some(data) = data {
            if desc.format.is_depth() {
                log::warn!("Ignoring initial data for depth texture {:?}", desc.label);
            } else {
                self.queue.write_texture(
                    wgpu::ImageCopyTexture {
                        texture: &texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    data,
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(size.width * desc.format.bytes_per_pixel()),
                        rows_per_image: Some(size.height),
                    },
                    size,
                );
            }
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            mip_level_count: Some(1),
            ..Default::default()
        });
        let id = self.allocate_id();
        log::debug!(
            "WgpuBackend: texture {id} {:?} {}x{} {:?}",
            desc.label,
            size.width,
            size.height,
            desc.format
        );
        self.textures.insert(
            id,
            WgpuTexture {
                _texture: texture,
                view,
                width: size.width,
                height: size.height,
            },
        );
        Ok(TextureHandle(id))
    }

    fn transition_texture(&mut self, texture: TextureHandle, before: TextureState, after: TextureState) {
        // wgpu derives barriers from usage; the tracked state only feeds logging
        log::trace!("WgpuBackend: texture {} {:?} -> {:?}", texture.0, before, after);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let address_mode = conversion::address_mode(desc.address_mode);
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: conversion::filter_mode(desc.mag_filter),
            min_filter: conversion::filter_mode(desc.min_filter),
            mipmap_filter: conversion::filter_mode(desc.mipmap_filter),
            compare: desc.compare.map(conversion::compare_function),
            ..Default::default()
        });
        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture.0 == BACKBUFFER_ID {
            return;
        }
        if self.textures.remove(&texture.0).is_some() {
            self.forget_bind_groups();
            log::debug!("WgpuBackend: destroyed texture {}", texture.0);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if self.samplers.remove(&sampler.0).is_some() {
            self.forget_bind_groups();
        }
    }
}

impl ShaderApi for WgpuBackend {
    fn shader_extensions(&self) -> &'static [&'static str] {
        match self.backend_type {
            BackendType::OpenGl => &["_vert.glsl", "_frag.glsl", ".wgsl"],
            _ => &[".wgsl"],
        }
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> RenderResult<ShaderHandle> {
        let shader = match self.backend_type {
            BackendType::OpenGl
                if crate::backend::shader_path(&desc.path_stem, "_vert.glsl").exists() =>
            {
                self.load_glsl(desc)?
            }
            BackendType::OpenGl => {
                log::warn!(
                    "No GLSL sources for {}, falling back to WGSL",
                    desc.path_stem.display()
                );
                self.load_wgsl(desc)?
            }
            _ => self.load_wgsl(desc)?,
        };
        let id = self.allocate_id();
        log::debug!(
            "WgpuBackend: shader {id} {} ({} bindings)",
            desc.label,
            shader.bindings.len()
        );
        self.shaders.insert(id, shader);
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
    }
}

impl PipelineApi for WgpuBackend {
    fn create_vertex_format(&mut self, layout: &VertexLayout) -> RenderResult<VertexFormatHandle> {
        if layout.stride == 0 {
            return Err(RenderError::UnfinalizedVertexFormat);
        }
        let id = self.allocate_id();
        self.vertex_formats.insert(id, layout.clone());
        Ok(VertexFormatHandle(id))
    }

    fn create_pipeline(
        &mut self,
        desc: &PipelineStateDesc,
        pass: RenderPassHandle,
    ) -> RenderResult<PipelineHandle> {
        if !self.render_passes.contains_key(&pass.0) {
            return Err(RenderError::InvalidHandle {
                kind: "render pass",
                id: pass.0,
            });
        }
        let shader = self.shaders.get(&desc.shader.0).ok_or(RenderError::InvalidHandle {
            kind: "shader",
            id: desc.shader.0,
        })?;

        let attributes: Vec<wgpu::VertexAttribute>;
        let vertex_buffers = match desc.vertex_format {
            Some(format) => {
                let layout = self
                    .vertex_formats
                    .get(&format.0)
                    .ok_or(RenderError::InvalidHandle {
                        kind: "vertex format",
                        id: format.0,
                    })?;
                attributes = layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: conversion::vertex_format(a.format),
                        offset: a.offset as u64,
                        shader_location: a.location,
                    })
                    .collect();
                vec![wgpu::VertexBufferLayout {
                    array_stride: layout.stride as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &attributes,
                }]
            }
            None => Vec::new(),
        };

        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: conversion::texture_format(*format),
                    blend: desc.blend.blend.as_ref().map(conversion::blend_state),
                    write_mask: conversion::color_writes(desc.blend.write_mask),
                })
            })
            .collect();

        let (vertex_module, vertex_entry) = shader.vertex();
        let fragment = shader.fragment().map(|(module, entry_point)| wgpu::FragmentState {
            module,
            entry_point,
            compilation_options: Default::default(),
            targets: &targets,
        });

        let (pipeline, error) = self.validated(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: None,
                vertex: wgpu::VertexState {
                    module: vertex_module,
                    entry_point: vertex_entry,
                    compilation_options: Default::default(),
                    buffers: &vertex_buffers,
                },
                primitive: conversion::primitive_state(desc),
                depth_stencil: conversion::depth_stencil_state(desc),
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count.max(1),
                    mask: !0,
                    alpha_to_coverage_enabled: desc.blend.alpha_to_coverage,
                },
                fragment,
                multiview: None,
            })
        });
        if let Some(error) = error {
            log::error!("Pipeline {:?} failed: {error}", desc.label);
            return Err(RenderError::PipelineCreation(error.to_string()));
        }

        let bindings = shader.bindings.clone();
        let bind_group_layout = (!bindings.is_empty()).then(|| pipeline.get_bind_group_layout(0));
        let id = self.allocate_id();
        log::debug!("WgpuBackend: pipeline {id} {:?}", desc.label);
        self.pipelines.insert(
            id,
            WgpuPipeline {
                pipeline,
                bind_group_layout,
                bindings,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline.0).is_some() {
            self.bind_groups.retain(|(_, p), _| *p != pipeline.0);
        }
    }
}

impl RenderPassApi for WgpuBackend {
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RenderPassHandle> {
        let id = self.allocate_id();
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RenderResult<FramebufferHandle> {
        for texture in desc.attachments() {
            if texture.0 != BACKBUFFER_ID && !self.textures.contains_key(&texture.0) {
                return Err(RenderError::InvalidHandle {
                    kind: "texture",
                    id: texture.0,
                });
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            WgpuFramebuffer {
                colors: desc.color_targets.iter().map(|t| t.0).collect(),
                depth: desc.depth_target.map(|t| t.0),
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn begin_render_pass(
        &mut self,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> RenderResult<()> {
        if self.encoder.is_none() {
            return Err(RenderError::usage("begin_render_pass outside of a frame"));
        }
        if self.pending_pass.is_some() {
            return Err(RenderError::usage("begin_render_pass while a pass is recording"));
        }
        self.pending_pass = Some(PendingRenderPass {
            pass: pass.0,
            framebuffer: framebuffer.0,
            clears: clear_values.to_vec(),
            segments: vec![Segment::default()],
            pipeline: None,
            bind_group: None,
            viewport: None,
            scissor: None,
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> RenderResult<()> {
        let pending = self
            .pending_pass
            .take()
            .ok_or_else(|| RenderError::usage("end_render_pass without a recording pass"))?;
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| RenderError::usage("end_render_pass outside of a frame"))?;
        let result = self.encode_pass(&mut encoder, &pending);
        self.encoder = Some(encoder);
        log::trace!(
            "WgpuBackend: pass {} encoded in {} segment(s)",
            pending.pass,
            pending.segments.len()
        );
        result
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.render_passes.remove(&pass.0);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }
}

impl ResourceTableApi for WgpuBackend {
    fn create_resource_table(&mut self) -> RenderResult<ResourceTableHandle> {
        let id = self.allocate_id();
        self.tables.insert(id, ResourceTableDesc::default());
        Ok(ResourceTableHandle(id))
    }

    fn write_resource_table(&mut self, table: ResourceTableHandle, desc: &ResourceTableDesc) -> RenderResult<()> {
        let entry = self.tables.get_mut(&table.0).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.0,
        })?;
        *entry = desc.clone();
        self.bind_groups.retain(|(t, _), _| *t != table.0);
        Ok(())
    }

    fn bind_resource_table(&mut self, table: ResourceTableHandle) -> RenderResult<()> {
        let pipeline = self
            .pending_pass
            .as_ref()
            .and_then(|p| p.pipeline)
            .ok_or_else(|| RenderError::usage("bind_resource_table without a bound pipeline"))?;
        let Some(bound) = self.bind_group(table.0, pipeline)? else {
            return Ok(());
        };
        if let Some(pending) = self.pending_pass.as_mut() {
            pending.push(PassCommand::SetBindGroup(bound.group.clone()));
            pending.current().reads.extend(bound.buffers.iter().copied());
            pending.bind_group = Some(bound);
        }
        Ok(())
    }

    fn destroy_resource_table(&mut self, table: ResourceTableHandle) {
        self.tables.remove(&table.0);
        self.bind_groups.retain(|(t, _), _| *t != table.0);
    }
}

impl CommandApi for WgpuBackend {
    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        if !self.pipelines.contains_key(&pipeline.0) {
            return Err(RenderError::InvalidHandle {
                kind: "pipeline",
                id: pipeline.0,
            });
        }
        let pending = self
            .pending_pass
            .as_mut()
            .ok_or_else(|| RenderError::usage("set_pipeline outside of a render pass"))?;
        pending.push(PassCommand::SetPipeline(pipeline.0));
        pending.pipeline = Some(pipeline.0);
        pending.bind_group = None;
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        if let Some(pending) = self.pending_pass.as_mut() {
            pending.push(PassCommand::SetViewport(*viewport));
            pending.viewport = Some(*viewport);
        }
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        if let Some(pending) = self.pending_pass.as_mut() {
            pending.push(PassCommand::SetScissor(*rect));
            pending.scissor = Some(*rect);
        }
    }

    fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()> {
        let pending = self
            .pending_pass
            .as_mut()
            .ok_or_else(|| RenderError::usage("draw outside of a render pass"))?;
        if pending.pipeline.is_none() {
            return Err(RenderError::usage("draw without a bound pipeline"));
        }
        let segment = pending.current();
        if let Some(view) = draw.vertex_buffer {
            segment.reads.insert(view.buffer.0);
        }
        if let Some(view) = draw.index_buffer {
            segment.reads.insert(view.buffer.0);
        }
        segment.commands.push(PassCommand::Draw(*draw));
        Ok(())
    }

    fn push_marker(&mut self, label: &str) {
        let forwarded = match (&self.pending_pass, self.encoder.as_mut()) {
            (None, Some(encoder)) => {
                encoder.push_debug_group(label);
                true
            }
            _ => false,
        };
        self.markers.push(forwarded);
    }

    fn pop_marker(&mut self) {
        if self.markers.pop() == Some(true) && self.pending_pass.is_none() {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.pop_debug_group();
            }
        }
    }
}

impl FrameApi for WgpuBackend {
    fn begin_frame(&mut self) -> RenderResult<FrameInfo> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost, reconfiguring");
                self.surface.configure(&self.device, &self.surface_config);
                return Err(RenderError::SurfaceLost);
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                return Err(RenderError::OutOfMemory("swap chain acquire".into()));
            }
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("Swap chain acquire timed out");
                return Err(RenderError::SurfaceLost);
            }
        };
        self.surface_view = Some(output.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        self.current_texture = Some(output);
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Frame Encoder") }),
        );
        self.markers.clear();
        Ok(FrameInfo {
            backbuffer: TextureHandle(BACKBUFFER_ID),
            width: self.surface_config.width,
            height: self.surface_config.height,
        })
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        if self.pending_pass.is_some() {
            return Err(RenderError::usage("end_frame while a pass is recording"));
        }
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| RenderError::usage("end_frame without begin_frame"))?;
        for forwarded in self.markers.drain(..) {
            if forwarded {
                encoder.pop_debug_group();
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn present(&mut self) -> RenderResult<()> {
        self.surface_view = None;
        if let Some(texture) = self.current_texture.take() {
            texture.present();
        }
        Ok(())
    }

    fn backbuffer(&self) -> TextureHandle {
        TextureHandle(BACKBUFFER_ID)
    }

    fn backbuffer_format(&self) -> TextureFormat {
        self.surface_format
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        // Clamp to device limits while maintaining aspect ratio
        let max_size = self.device.limits().max_texture_dimension_2d;
        let (width, height) = if width > max_size || height > max_size {
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width, height)
        };
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
        log::info!("Surface reconfigured to {width}x{height}");
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn wait_idle(&mut self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }
}

impl GraphicsBackend for WgpuBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_padding_rounds_to_four() {
        assert_eq!(pad_to_copy_alignment(&[1, 2, 3]).len(), 4);
        assert_eq!(pad_to_copy_alignment(&[1, 2, 3, 4]).len(), 4);
        assert_eq!(&pad_to_copy_alignment(&[9, 8, 7])[..3], &[9, 8, 7]);
    }
}
