//! Core backend abstraction traits
//!
//! One trait per resource kind. Every backend implements all of them and is
//! used through the combined [`GraphicsBackend`] trait object, so several
//! backends can coexist in one build and be picked at startup.

use std::any::Any;

use crate::backend::types::*;
use crate::error::RenderResult;
use crate::BackendType;

/// Buffer creation, upload and readback
pub trait BufferApi {
    /// Alignment every allocation of `usage` is rounded up to
    fn buffer_alignment(&self, usage: BufferUsage) -> u64;

    /// Create a buffer of `size` bytes (already aligned by the caller)
    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        size: u64,
        data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle>;

    /// Write `data` at `offset`
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> RenderResult<()>;

    /// Read `size` bytes back from `offset`
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64)
        -> RenderResult<Vec<u8>>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);
}

/// Textures, samplers and state transitions
pub trait TextureApi {
    /// Create a texture, uploading `data` synchronously when present
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> RenderResult<TextureHandle>;

    /// Record a state transition; `before` is the tracked state
    fn transition_texture(&mut self, texture: TextureHandle, before: TextureState, after: TextureState);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn destroy_sampler(&mut self, sampler: SamplerHandle);
}

/// Shader loading
pub trait ShaderApi {
    /// File name suffixes this backend loads, in lookup order
    fn shader_extensions(&self) -> &'static [&'static str];

    fn create_shader(&mut self, desc: &ShaderDesc) -> RenderResult<ShaderHandle>;

    fn destroy_shader(&mut self, shader: ShaderHandle);
}

/// Vertex input layouts and pipeline state objects
pub trait PipelineApi {
    /// Build the backend's native input layout for a finalized vertex layout
    fn create_vertex_format(&mut self, layout: &VertexLayout) -> RenderResult<VertexFormatHandle>;

    /// Compile a pipeline compatible with `pass`
    fn create_pipeline(
        &mut self,
        desc: &PipelineStateDesc,
        pass: RenderPassHandle,
    ) -> RenderResult<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
}

/// Render passes and framebuffers
pub trait RenderPassApi {
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RenderPassHandle>;

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RenderResult<FramebufferHandle>;

    /// Begin recording into `framebuffer`; one clear value per attachment,
    /// colors first, then depth
    fn begin_render_pass(
        &mut self,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> RenderResult<()>;

    fn end_render_pass(&mut self) -> RenderResult<()>;

    fn destroy_render_pass(&mut self, pass: RenderPassHandle);

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
}

/// Descriptor tables
pub trait ResourceTableApi {
    fn create_resource_table(&mut self) -> RenderResult<ResourceTableHandle>;

    /// Write the table's descriptors; called after each category is set
    fn write_resource_table(
        &mut self,
        table: ResourceTableHandle,
        desc: &ResourceTableDesc,
    ) -> RenderResult<()>;

    /// Make the table active for following draws
    fn bind_resource_table(&mut self, table: ResourceTableHandle) -> RenderResult<()>;

    fn destroy_resource_table(&mut self, table: ResourceTableHandle);
}

/// Command recording inside a render pass
pub trait CommandApi {
    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()>;

    fn set_viewport(&mut self, viewport: &Viewport);

    fn set_scissor(&mut self, rect: &ScissorRect);

    fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()>;

    fn push_marker(&mut self, label: &str);

    fn pop_marker(&mut self);
}

/// Frame lifecycle and swap chain
pub trait FrameApi {
    /// Acquire the backbuffer and open command recording
    fn begin_frame(&mut self) -> RenderResult<FrameInfo>;

    /// Close and submit the frame's commands
    fn end_frame(&mut self) -> RenderResult<()>;

    /// Present the submitted backbuffer
    fn present(&mut self) -> RenderResult<()>;

    /// Handle of the swap-chain owned backbuffer texture
    fn backbuffer(&self) -> TextureHandle;

    fn backbuffer_format(&self) -> TextureFormat;

    fn resize(&mut self, width: u32, height: u32);

    /// Actual surface size (may be clamped by device limits)
    fn surface_size(&self) -> (u32, u32);

    /// Block until the device has finished all submitted work
    fn wait_idle(&mut self);
}

/// Main graphics backend trait
pub trait GraphicsBackend:
    BufferApi
    + TextureApi
    + ShaderApi
    + PipelineApi
    + RenderPassApi
    + ResourceTableApi
    + CommandApi
    + FrameApi
    + Send
{
    fn backend_type(&self) -> BackendType;

    /// Downcast support for backend-specific inspection
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
