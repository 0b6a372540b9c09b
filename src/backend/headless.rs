//! Headless recording backend
//!
//! Performs no GPU work. Buffers and textures keep CPU-side storage, every
//! command is appended to a log, and texture states are simulated so tests
//! and tools can inspect what a frame did without a device or a window.
//! WGSL shaders are still parsed through naga so broken assets fail here too.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::BackendType;

/// One command recorded by the headless backend
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginFrame(u64),
    EndFrame,
    Present,
    Transition {
        texture: TextureHandle,
        before: TextureState,
        after: TextureState,
    },
    BeginRenderPass {
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass(RenderPassHandle),
    SetPipeline(PipelineHandle),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindResourceTable(ResourceTableHandle),
    Draw {
        pipeline: PipelineHandle,
        element_count: u32,
        indexed: bool,
    },
    PushMarker(String),
    PopMarker,
}

#[derive(Debug)]
struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessTexture {
    desc: TextureDesc,
    state: TextureState,
    data: Vec<u8>,
    draws: u32,
}

#[derive(Debug)]
struct HeadlessShader {
    path: PathBuf,
    stages: ShaderStageFlags,
}

/// Frames of commands kept by default; older frames are dropped at `BeginFrame`
pub const DEFAULT_RETAINED_FRAMES: usize = 2;

/// Recording backend without a device
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    next_id: u64,
    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, HeadlessTexture>,
    samplers: HashMap<u64, SamplerDesc>,
    shaders: HashMap<u64, HeadlessShader>,
    vertex_formats: HashMap<u64, VertexLayout>,
    pipelines: HashMap<u64, PipelineStateDesc>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, FramebufferDesc>,
    resource_tables: HashMap<u64, ResourceTableDesc>,
    backbuffer: TextureHandle,
    active_pass: Option<(RenderPassHandle, FramebufferHandle)>,
    bound_pipeline: Option<PipelineHandle>,
    in_frame: bool,
    frame_count: u64,
    state_mismatches: u32,
    commands: Vec<RecordedCommand>,
    frame_starts: VecDeque<usize>,
    retained_frames: usize,
    fail_next_render_pass: bool,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            width: width.max(1),
            height: height.max(1),
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            vertex_formats: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            resource_tables: HashMap::new(),
            backbuffer: TextureHandle(0),
            active_pass: None,
            bound_pipeline: None,
            in_frame: false,
            frame_count: 0,
            state_mismatches: 0,
            commands: Vec::new(),
            frame_starts: VecDeque::new(),
            retained_frames: DEFAULT_RETAINED_FRAMES,
            fail_next_render_pass: false,
        };
        backend.backbuffer = backend.create_backbuffer();
        log::info!(
            "Headless backend initialized ({}x{})",
            backend.width,
            backend.height
        );
        backend
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_backbuffer(&mut self) -> TextureHandle {
        let id = self.allocate_id();
        let desc = TextureDesc {
            label: Some("backbuffer".into()),
            width: self.width,
            height: self.height,
            mip_levels: 1,
            format: TextureFormat::Bgra8Unorm,
            usage: TextureUsage::COLOR_TARGET,
            initial_state: TextureState::Present,
            clear_value: None,
        };
        self.textures.insert(
            id,
            HeadlessTexture {
                desc,
                state: TextureState::Present,
                data: Vec::new(),
                draws: 0,
            },
        );
        TextureHandle(id)
    }

    /// Keep the commands of the last `frames` frames (at least one)
    pub fn with_retained_frames(mut self, frames: usize) -> Self {
        self.retained_frames = frames.max(1);
        self
    }

    /// Commands of the retained frames, plus anything recorded before the
    /// first of them or since the last [`Self::clear_commands`]
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
        self.frame_starts.clear();
    }

    /// Make the next `begin_render_pass` fail with a device error
    pub fn fail_next_render_pass(&mut self) {
        self.fail_next_render_pass = true;
    }

    fn start_frame_log(&mut self) {
        self.frame_starts.push_back(self.commands.len());
        while self.frame_starts.len() > self.retained_frames {
            self.frame_starts.pop_front();
            let cut = self.frame_starts.front().copied().unwrap_or(self.commands.len());
            self.commands.drain(..cut);
            for start in self.frame_starts.iter_mut() {
                *start -= cut;
            }
        }
    }

    /// Simulated state of a texture
    pub fn texture_state(&self, texture: TextureHandle) -> Option<TextureState> {
        self.textures.get(&texture.0).map(|t| t.state)
    }

    /// Number of draws that targeted `texture` as a color or depth attachment
    pub fn draws_into(&self, texture: TextureHandle) -> u32 {
        self.textures.get(&texture.0).map_or(0, |t| t.draws)
    }

    /// Texel data last uploaded to `texture`
    pub fn texture_data(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.data.as_slice())
    }

    /// Transitions whose `before` state disagreed with the simulated state
    pub fn state_mismatches(&self) -> u32 {
        self.state_mismatches
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn live_textures(&self) -> usize {
        // the backbuffer is swap-chain owned
        self.textures.len() - 1
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_resource_tables(&self) -> usize {
        self.resource_tables.len()
    }

    fn require_pass(&self, what: &str) -> RenderResult<(RenderPassHandle, FramebufferHandle)> {
        self.active_pass
            .ok_or_else(|| RenderError::usage(format!("{what} outside of a render pass")))
    }
}

impl BufferApi for HeadlessBackend {
    fn buffer_alignment(&self, usage: BufferUsage) -> u64 {
        if usage.contains(BufferUsage::UNIFORM) {
            256
        } else {
            4
        }
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        size: u64,
        data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            size
        );
        let mut bytes = vec![0u8; size as usize];
        if let Some(data) = data {
            if data.len() as u64 > size {
                return Err(RenderError::usage(format!(
                    "initial data of {} bytes exceeds buffer size {size}",
                    data.len()
                )));
            }
            bytes[..data.len()].copy_from_slice(data);
        }
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                desc: desc.clone(),
                data: bytes,
            },
        );
        Ok(BufferHandle(id))
    }

    fn update_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let entry = self.buffers.get_mut(&buffer.0).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(RenderError::usage(format!(
                "write of {} bytes at {offset} overflows buffer {:?} ({} bytes)",
                data.len(),
                entry.desc.label,
                entry.data.len()
            )));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> RenderResult<Vec<u8>> {
        let entry = self.buffers.get(&buffer.0).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > entry.data.len() {
            return Err(RenderError::usage(format!(
                "read of {size} bytes at {offset} overflows buffer ({} bytes)",
                entry.data.len()
            )));
        }
        Ok(entry.data[start..end].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("HeadlessBackend: destroying buffer {}", buffer.0);
        self.buffers.remove(&buffer.0);
    }
}

impl TextureApi for HeadlessBackend {
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> RenderResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let data = match data {
            Some(data) => {
                if data.len() != desc.byte_size() {
                    return Err(RenderError::usage(format!(
                        "texture {:?} expects {} bytes of data, got {}",
                        desc.label,
                        desc.byte_size(),
                        data.len()
                    )));
                }
                data.to_vec()
            }
            None => Vec::new(),
        };
        let id = self.allocate_id();
        self.textures.insert(
            id,
            HeadlessTexture {
                desc: desc.clone(),
                state: desc.initial_state,
                data,
                draws: 0,
            },
        );
        Ok(TextureHandle(id))
    }

    fn transition_texture(
        &mut self,
        texture: TextureHandle,
        before: TextureState,
        after: TextureState,
    ) {
        if let Some(entry) = self.textures.get_mut(&texture.0) {
            if entry.state != before {
                log::warn!(
                    "HeadlessBackend: texture {:?} transitioned from {:?} but is in {:?}",
                    entry.desc.label,
                    before,
                    entry.state
                );
                self.state_mismatches += 1;
            }
            entry.state = after;
        }
        self.commands.push(RecordedCommand::Transition {
            texture,
            before,
            after,
        });
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.allocate_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture != self.backbuffer {
            self.textures.remove(&texture.0);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }
}

impl ShaderApi for HeadlessBackend {
    fn shader_extensions(&self) -> &'static [&'static str] {
        &[".wgsl"]
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> RenderResult<ShaderHandle> {
        let path = super::shader_path(&desc.path_stem, ".wgsl");
        let source = std::fs::read_to_string(&path)
            .map_err(|_| RenderError::AssetNotFound(path.clone()))?;
        let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
            RenderError::CompileFailure {
                path: path.clone(),
                log: e.emit_to_string(&source),
            }
        })?;
        super::check_entry_points(&module, desc.stages, &path)?;

        log::debug!("HeadlessBackend: loaded shader {}", path.display());
        let id = self.allocate_id();
        self.shaders.insert(
            id,
            HeadlessShader {
                path,
                stages: desc.stages,
            },
        );
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
    }
}

impl PipelineApi for HeadlessBackend {
    fn create_vertex_format(&mut self, layout: &VertexLayout) -> RenderResult<VertexFormatHandle> {
        let id = self.allocate_id();
        self.vertex_formats.insert(id, layout.clone());
        Ok(VertexFormatHandle(id))
    }

    fn create_pipeline(
        &mut self,
        desc: &PipelineStateDesc,
        pass: RenderPassHandle,
    ) -> RenderResult<PipelineHandle> {
        let shader = self.shaders.get(&desc.shader.0).ok_or(RenderError::InvalidHandle {
            kind: "shader",
            id: desc.shader.0,
        })?;
        if !shader.stages.contains(ShaderStageFlags::VERTEX) {
            return Err(RenderError::PipelineCreation(format!(
                "{} has no vertex stage",
                shader.path.display()
            )));
        }
        if !self.render_passes.contains_key(&pass.0) {
            return Err(RenderError::InvalidHandle {
                kind: "render pass",
                id: pass.0,
            });
        }
        if let Some(format) = desc.vertex_format {
            if !self.vertex_formats.contains_key(&format.0) {
                return Err(RenderError::InvalidHandle {
                    kind: "vertex format",
                    id: format.0,
                });
            }
        }
        let id = self.allocate_id();
        self.pipelines.insert(id, desc.clone());
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }
}

impl RenderPassApi for HeadlessBackend {
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RenderPassHandle> {
        let id = self.allocate_id();
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RenderResult<FramebufferHandle> {
        for texture in desc.attachments() {
            if !self.textures.contains_key(&texture.0) {
                return Err(RenderError::InvalidHandle {
                    kind: "texture",
                    id: texture.0,
                });
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn begin_render_pass(
        &mut self,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> RenderResult<()> {
        if !self.in_frame {
            return Err(RenderError::usage("render pass begun outside of a frame"));
        }
        if std::mem::take(&mut self.fail_next_render_pass) {
            return Err(RenderError::SurfaceLost);
        }
        if let Some((active, _)) = self.active_pass {
            return Err(RenderError::usage(format!(
                "render pass {} begun while {} is active",
                pass.0, active.0
            )));
        }
        let fb = self
            .framebuffers
            .get(&framebuffer.0)
            .ok_or(RenderError::InvalidHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        for texture in fb.attachments() {
            let Some(entry) = self.textures.get(&texture.0) else {
                continue;
            };
            if entry.state != TextureState::attachment_for(entry.desc.format) {
                log::warn!(
                    "HeadlessBackend: attachment {:?} bound in state {:?}",
                    entry.desc.label,
                    entry.state
                );
                self.state_mismatches += 1;
            }
        }
        self.active_pass = Some((pass, framebuffer));
        self.bound_pipeline = None;
        self.commands.push(RecordedCommand::BeginRenderPass {
            pass,
            framebuffer,
            clear_values: clear_values.to_vec(),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> RenderResult<()> {
        let (pass, _) = self.require_pass("end_render_pass")?;
        self.active_pass = None;
        self.bound_pipeline = None;
        self.commands.push(RecordedCommand::EndRenderPass(pass));
        Ok(())
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.render_passes.remove(&pass.0);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }
}

impl ResourceTableApi for HeadlessBackend {
    fn create_resource_table(&mut self) -> RenderResult<ResourceTableHandle> {
        let id = self.allocate_id();
        self.resource_tables.insert(id, ResourceTableDesc::default());
        Ok(ResourceTableHandle(id))
    }

    fn write_resource_table(
        &mut self,
        table: ResourceTableHandle,
        desc: &ResourceTableDesc,
    ) -> RenderResult<()> {
        let entry = self
            .resource_tables
            .get_mut(&table.0)
            .ok_or(RenderError::InvalidHandle {
                kind: "resource table",
                id: table.0,
            })?;
        *entry = desc.clone();
        Ok(())
    }

    fn bind_resource_table(&mut self, table: ResourceTableHandle) -> RenderResult<()> {
        self.require_pass("bind_resource_table")?;
        if !self.resource_tables.contains_key(&table.0) {
            return Err(RenderError::InvalidHandle {
                kind: "resource table",
                id: table.0,
            });
        }
        self.commands.push(RecordedCommand::BindResourceTable(table));
        Ok(())
    }

    fn destroy_resource_table(&mut self, table: ResourceTableHandle) {
        self.resource_tables.remove(&table.0);
    }
}

impl CommandApi for HeadlessBackend {
    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        self.require_pass("set_pipeline")?;
        if !self.pipelines.contains_key(&pipeline.0) {
            return Err(RenderError::InvalidHandle {
                kind: "pipeline",
                id: pipeline.0,
            });
        }
        self.bound_pipeline = Some(pipeline);
        self.commands.push(RecordedCommand::SetPipeline(pipeline));
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.commands.push(RecordedCommand::SetViewport(*viewport));
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        self.commands.push(RecordedCommand::SetScissor(*rect));
    }

    fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()> {
        let (_, framebuffer) = self.require_pass("draw")?;
        let pipeline = self
            .bound_pipeline
            .ok_or_else(|| RenderError::usage("draw without a pipeline"))?;
        for view in draw.vertex_buffer.iter().map(|v| v.buffer) {
            if !self.buffers.contains_key(&view.0) {
                return Err(RenderError::InvalidHandle {
                    kind: "buffer",
                    id: view.0,
                });
            }
        }
        if let Some(index) = draw.index_buffer {
            let Some(buffer) = self.buffers.get(&index.buffer.0) else {
                return Err(RenderError::InvalidHandle {
                    kind: "buffer",
                    id: index.buffer.0,
                });
            };
            let needed = index.offset + draw.element_count as u64 * index.format.size();
            if needed > buffer.data.len() as u64 {
                return Err(RenderError::usage(format!(
                    "draw reads {needed} index bytes from a {} byte buffer",
                    buffer.data.len()
                )));
            }
        }

        if let Some(fb) = self.framebuffers.get(&framebuffer.0) {
            for texture in fb.attachments() {
                if let Some(entry) = self.textures.get_mut(&texture.0) {
                    entry.draws += 1;
                }
            }
        }
        log::trace!(
            "HeadlessBackend: draw {} elements with pipeline {}",
            draw.element_count,
            pipeline.0
        );
        self.commands.push(RecordedCommand::Draw {
            pipeline,
            element_count: draw.element_count,
            indexed: draw.index_buffer.is_some(),
        });
        Ok(())
    }

    fn push_marker(&mut self, label: &str) {
        self.commands.push(RecordedCommand::PushMarker(label.to_string()));
    }

    fn pop_marker(&mut self) {
        self.commands.push(RecordedCommand::PopMarker);
    }
}

impl FrameApi for HeadlessBackend {
    fn begin_frame(&mut self) -> RenderResult<FrameInfo> {
        if self.in_frame {
            return Err(RenderError::usage("begin_frame called twice"));
        }
        self.in_frame = true;
        self.frame_count += 1;
        if let Some(entry) = self.textures.get_mut(&self.backbuffer.0) {
            entry.draws = 0;
        }
        self.start_frame_log();
        self.commands.push(RecordedCommand::BeginFrame(self.frame_count));
        Ok(FrameInfo {
            backbuffer: self.backbuffer,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        if !self.in_frame {
            return Err(RenderError::usage("end_frame without begin_frame"));
        }
        if self.active_pass.is_some() {
            return Err(RenderError::usage("end_frame inside a render pass"));
        }
        self.in_frame = false;
        self.commands.push(RecordedCommand::EndFrame);
        Ok(())
    }

    fn present(&mut self) -> RenderResult<()> {
        self.commands.push(RecordedCommand::Present);
        Ok(())
    }

    fn backbuffer(&self) -> TextureHandle {
        self.backbuffer
    }

    fn backbuffer_format(&self) -> TextureFormat {
        TextureFormat::Bgra8Unorm
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
        if let Some(entry) = self.textures.get_mut(&self.backbuffer.0) {
            entry.desc.width = self.width;
            entry.desc.height = self.height;
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn wait_idle(&mut self) {}
}

impl GraphicsBackend for HeadlessBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Headless
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

static_assertions::assert_impl_all!(HeadlessBackend: Send);

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_desc() -> BufferDesc {
        BufferDesc {
            label: Some("constants".into()),
            count: 1,
            element_size: 64,
            usage: BufferUsage::UNIFORM,
        }
    }

    #[test]
    fn uniform_alignment_is_256() {
        let backend = HeadlessBackend::new(4, 4);
        assert_eq!(backend.buffer_alignment(BufferUsage::UNIFORM), 256);
        assert_eq!(backend.buffer_alignment(BufferUsage::VERTEX), 4);
    }

    #[test]
    fn buffer_write_and_read_back() {
        let mut backend = HeadlessBackend::new(4, 4);
        let buffer = backend.create_buffer(&uniform_desc(), 256, None).unwrap();
        backend.update_buffer(buffer, 16, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer, 16, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(backend.update_buffer(buffer, 254, &[0; 4]).is_err());
    }

    #[test]
    fn transition_mismatch_is_counted() {
        let mut backend = HeadlessBackend::new(4, 4);
        let texture = backend
            .create_texture(
                &TextureDesc::render_target("t", 4, 4, TextureFormat::Rgba8Unorm),
                None,
            )
            .unwrap();
        backend.transition_texture(texture, TextureState::ShaderRead, TextureState::RenderTarget);
        assert_eq!(backend.state_mismatches(), 0);
        backend.transition_texture(texture, TextureState::ShaderRead, TextureState::CopyDst);
        assert_eq!(backend.state_mismatches(), 1);
        assert_eq!(backend.texture_state(texture), Some(TextureState::CopyDst));
    }

    #[test]
    fn draw_requires_pass_and_pipeline() {
        let mut backend = HeadlessBackend::new(4, 4);
        assert!(matches!(
            backend.draw(&DrawCommand::fullscreen()),
            Err(RenderError::Usage(_))
        ));
    }

    #[test]
    fn command_log_keeps_the_last_frames() {
        let mut backend = HeadlessBackend::new(4, 4).with_retained_frames(2);
        backend.push_marker("setup");
        for _ in 0..10 {
            backend.begin_frame().unwrap();
            backend.push_marker("frame");
            backend.pop_marker();
            backend.end_frame().unwrap();
        }
        let frames: Vec<u64> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginFrame(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![9, 10]);
        assert_eq!(backend.commands().len(), 8);
        assert_eq!(backend.commands()[0], RecordedCommand::BeginFrame(9));

        backend.clear_commands();
        backend.begin_frame().unwrap();
        assert_eq!(backend.commands(), &[RecordedCommand::BeginFrame(11)]);
    }

    #[test]
    fn missing_shader_is_asset_not_found() {
        let mut backend = HeadlessBackend::new(4, 4);
        let result = backend.create_shader(&ShaderDesc {
            label: "missing".into(),
            path_stem: PathBuf::from("/nonexistent/data/shaders/st_missing"),
            stages: ShaderStageFlags::VERTEX_FRAGMENT,
        });
        assert!(matches!(result, Err(RenderError::AssetNotFound(_))));
    }
}
