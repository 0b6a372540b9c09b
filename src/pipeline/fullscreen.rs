//! Fullscreen triangle passes
//!
//! Post-processing, lighting and present all draw one generated triangle
//! with a pipeline and a single resource table.

use bytemuck::Pod;

use crate::backend::{
    BufferHandle, BufferUsage, DrawCommand, PipelineHandle, PipelineStateDesc, RasterizerDesc,
    ResourceLayout, ResourceTableHandle, SamplerHandle, ShaderHandle, TextureHandle,
};
use crate::context::RenderContext;
use crate::error::RenderResult;

use super::PassTarget;

/// Inputs of a fullscreen table, in category order
#[derive(Debug, Clone, Copy, Default)]
pub struct FullscreenInputs<'a> {
    /// Size in bytes of the single constant buffer; zero for none
    pub constants_size: u64,
    pub textures: &'a [TextureHandle],
    pub samplers: &'a [SamplerHandle],
    pub buffers: &'a [BufferHandle],
}

/// Pipeline, table and optional constant buffer of a fullscreen draw
#[derive(Debug, Clone)]
pub struct FullscreenPipeline {
    pub pipeline: PipelineHandle,
    pub table: ResourceTableHandle,
    pub constants: Option<BufferHandle>,
}

impl FullscreenPipeline {
    pub fn new(
        ctx: &mut RenderContext,
        label: &str,
        shader: ShaderHandle,
        target: &PassTarget,
        inputs: FullscreenInputs<'_>,
    ) -> RenderResult<Self> {
        let pass_desc = target.pass_desc(ctx)?.clone();
        let mut desc = PipelineStateDesc::for_pass(label, shader, &pass_desc);
        desc.rasterizer = RasterizerDesc::no_cull();
        desc.resource_layout = ResourceLayout::new(
            u32::from(inputs.constants_size > 0),
            inputs.textures.len() as u32,
            inputs.buffers.len() as u32,
        );
        let pipeline = ctx.create_pipeline(&desc, target.pass)?;

        let constants = if inputs.constants_size > 0 {
            match ctx.create_buffer(
                1,
                inputs.constants_size,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                label,
            ) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    ctx.destroy_pipeline(pipeline);
                    return Err(e);
                }
            }
        } else {
            None
        };

        match Self::create_table(ctx, constants, &inputs) {
            Ok(table) => Ok(Self {
                pipeline,
                table,
                constants,
            }),
            Err(e) => {
                if let Some(buffer) = constants {
                    ctx.destroy_buffer(buffer);
                }
                ctx.destroy_pipeline(pipeline);
                Err(e)
            }
        }
    }

    fn create_table(
        ctx: &mut RenderContext,
        constants: Option<BufferHandle>,
        inputs: &FullscreenInputs<'_>,
    ) -> RenderResult<ResourceTableHandle> {
        let table = ctx.create_resource_table()?;
        match Self::fill_table(ctx, table, constants, inputs) {
            Ok(()) => Ok(table),
            Err(e) => {
                ctx.destroy_resource_table(table);
                Err(e)
            }
        }
    }

    fn fill_table(
        ctx: &mut RenderContext,
        table: ResourceTableHandle,
        constants: Option<BufferHandle>,
        inputs: &FullscreenInputs<'_>,
    ) -> RenderResult<()> {
        if let Some(buffer) = constants {
            ctx.set_constant_buffers(table, &[buffer])?;
        }
        if !inputs.textures.is_empty() {
            ctx.set_textures(table, inputs.textures, inputs.samplers)?;
        }
        if !inputs.buffers.is_empty() {
            ctx.set_buffers(table, inputs.buffers)?;
        }
        Ok(())
    }

    /// Upload new constants; a no-op for pipelines without a constant buffer
    pub fn write_constants<T: Pod>(&self, ctx: &mut RenderContext, constants: &T) -> RenderResult<()> {
        match self.constants {
            Some(buffer) => ctx.update_buffer(buffer, 0, bytemuck::bytes_of(constants)),
            None => Ok(()),
        }
    }

    /// Point the table at new input textures, e.g. after a resize
    pub fn set_inputs(&self, ctx: &mut RenderContext, textures: &[TextureHandle]) -> RenderResult<()> {
        ctx.update_textures(self.table, textures)
    }

    /// Run the pass on `target`
    pub fn draw(&self, ctx: &mut RenderContext, target: &PassTarget) -> RenderResult<()> {
        target.begin(ctx)?;
        let result = self.draw_in_pass(ctx);
        ctx.end_render_pass()?;
        result
    }

    /// Draw inside an already begun pass
    pub fn draw_in_pass(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        ctx.set_pipeline(self.pipeline)?;
        ctx.bind_resource_table(self.table)?;
        ctx.draw(&DrawCommand::fullscreen())
    }

    pub fn release(&self, ctx: &mut RenderContext) {
        ctx.destroy_resource_table(self.table);
        if let Some(buffer) = self.constants {
            ctx.destroy_buffer(buffer);
        }
        ctx.destroy_pipeline(self.pipeline);
    }
}
