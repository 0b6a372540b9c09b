//! Separable 9-tap gaussian blur
//!
//! A vertical pass into an intermediate target followed by a horizontal
//! pass into the output, both at the source's resolution.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::{SamplerHandle, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::pipeline::fullscreen::{FullscreenInputs, FullscreenPipeline};
use crate::pipeline::PassTarget;
use crate::resources::{ShaderKind, ShaderTable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlurConstants {
    /// xy target size in pixels, zw texel size
    pub params: Vec4,
}

impl BlurConstants {
    pub fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        Self {
            params: Vec4::new(w, h, 1.0 / w, 1.0 / h),
        }
    }
}

pub struct GaussianBlur {
    intermediate: PassTarget,
    output: PassTarget,
    vertical: FullscreenPipeline,
    horizontal: FullscreenPipeline,
}

impl GaussianBlur {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        source: TextureHandle,
        sampler: SamplerHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let vertical_shader = shaders.get(ShaderKind::GaussianBlurVertical)?;
        let horizontal_shader = shaders.get(ShaderKind::GaussianBlurHorizontal)?;
        let (intermediate, output) = Self::create_targets(ctx, width, height)?;
        let constants_size = std::mem::size_of::<BlurConstants>() as u64;

        let vertical = FullscreenPipeline::new(
            ctx,
            "Gaussian Blur Vertical",
            vertical_shader,
            &intermediate,
            FullscreenInputs {
                constants_size,
                textures: &[source],
                samplers: &[sampler],
                buffers: &[],
            },
        );
        let vertical = match vertical {
            Ok(p) => p,
            Err(e) => {
                intermediate.release(ctx);
                output.release(ctx);
                return Err(e);
            }
        };

        let horizontal_input = intermediate.color(0).into_iter().collect::<Vec<_>>();
        let horizontal = FullscreenPipeline::new(
            ctx,
            "Gaussian Blur Horizontal",
            horizontal_shader,
            &output,
            FullscreenInputs {
                constants_size,
                textures: &horizontal_input,
                samplers: &[sampler],
                buffers: &[],
            },
        );
        let horizontal = match horizontal {
            Ok(p) => p,
            Err(e) => {
                vertical.release(ctx);
                intermediate.release(ctx);
                output.release(ctx);
                return Err(e);
            }
        };

        Ok(Self {
            intermediate,
            output,
            vertical,
            horizontal,
        })
    }

    fn create_targets(
        ctx: &mut RenderContext,
        width: u32,
        height: u32,
    ) -> RenderResult<(PassTarget, PassTarget)> {
        let intermediate = PassTarget::create(
            ctx,
            "Gaussian Blur Vertical",
            width,
            height,
            &[("blur_intermediate", TextureFormat::Rgba16Float)],
            None,
        )?;
        let output = PassTarget::create(
            ctx,
            "Gaussian Blur Horizontal",
            width,
            height,
            &[("blur_output", TextureFormat::Rgba16Float)],
            None,
        );
        match output {
            Ok(output) => Ok((intermediate, output)),
            Err(e) => {
                intermediate.release(ctx);
                Err(e)
            }
        }
    }

    pub fn output(&self) -> Option<TextureHandle> {
        self.output.color(0)
    }

    pub fn execute(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        let constants = BlurConstants::new(self.output.width, self.output.height);
        self.vertical.write_constants(ctx, &constants)?;
        self.vertical.draw(ctx, &self.intermediate)?;
        self.horizontal.write_constants(ctx, &constants)?;
        self.horizontal.draw(ctx, &self.output)
    }

    /// Recreate both targets at a new size reading from `source`
    pub fn resize(
        &mut self,
        ctx: &mut RenderContext,
        source: TextureHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let (intermediate, output) = Self::create_targets(ctx, width, height)?;
        self.intermediate.release(ctx);
        self.output.release(ctx);
        self.intermediate = intermediate;
        self.output = output;
        self.vertical.set_inputs(ctx, &[source])?;
        let intermediate: Vec<_> = self.intermediate.color(0).into_iter().collect();
        self.horizontal.set_inputs(ctx, &intermediate)
    }

    pub fn release(&mut self, ctx: &mut RenderContext) {
        self.vertical.release(ctx);
        self.horizontal.release(ctx);
        self.intermediate.release(ctx);
        self.output.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_size_is_reciprocal() {
        let c = BlurConstants::new(640, 360);
        assert_eq!(c.params.x, 640.0);
        assert!((c.params.z * 640.0 - 1.0).abs() < 1e-6);
        assert!((c.params.w * 360.0 - 1.0).abs() < 1e-6);
    }
}
