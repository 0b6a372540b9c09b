//! Present pass
//!
//! Copies the final image into the swapchain backbuffer.

use crate::backend::{LoadOp, SamplerDesc, SamplerHandle, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::resources::{ShaderKind, ShaderTable};

use super::fullscreen::{FullscreenInputs, FullscreenPipeline};
use super::{FramePass, PassTarget, PassType};

pub struct PresentPass {
    target: PassTarget,
    sampler: SamplerHandle,
    fullscreen: FullscreenPipeline,
}

impl PresentPass {
    pub fn new(ctx: &mut RenderContext, shaders: &ShaderTable, input: TextureHandle) -> RenderResult<Self> {
        let shader = shaders.get(ShaderKind::Present)?;
        let target = Self::create_target(ctx)?;
        let sampler = match ctx.create_sampler(&SamplerDesc::point_clamp()) {
            Ok(sampler) => sampler,
            Err(e) => {
                target.release(ctx);
                return Err(e);
            }
        };
        let fullscreen = FullscreenPipeline::new(
            ctx,
            PassType::Present.name(),
            shader,
            &target,
            FullscreenInputs {
                textures: &[input],
                samplers: &[sampler],
                ..Default::default()
            },
        );
        match fullscreen {
            Ok(fullscreen) => Ok(Self {
                target,
                sampler,
                fullscreen,
            }),
            Err(e) => {
                ctx.destroy_sampler(sampler);
                target.release(ctx);
                Err(e)
            }
        }
    }

    fn create_target(ctx: &mut RenderContext) -> RenderResult<PassTarget> {
        let backbuffer = ctx.backbuffer();
        PassTarget::wrap(ctx, PassType::Present.name(), &[backbuffer], LoadOp::Clear)
    }

    pub fn set_input(&self, ctx: &mut RenderContext, input: TextureHandle) -> RenderResult<()> {
        self.fullscreen.set_inputs(ctx, &[input])
    }

    pub fn execute(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        self.fullscreen.draw(ctx, &self.target)
    }
}

impl FramePass for PresentPass {
    fn name(&self) -> &str {
        PassType::Present.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Present
    }

    /// The backbuffer was resized by the context; rebuild the framebuffer over it
    fn resize(&mut self, ctx: &mut RenderContext, _width: u32, _height: u32) -> RenderResult<()> {
        let target = Self::create_target(ctx)?;
        self.target.release(ctx);
        self.target = target;
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.fullscreen.release(ctx);
        ctx.destroy_sampler(self.sampler);
        self.target.release(ctx);
    }
}
