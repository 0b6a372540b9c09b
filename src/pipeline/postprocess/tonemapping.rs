//! Tonemapping pass
//!
//! Converts HDR to LDR using the configured operator, exposure and gamma.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::{SamplerDesc, SamplerHandle, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::pipeline::fullscreen::{FullscreenInputs, FullscreenPipeline};
use crate::pipeline::{FramePass, PassTarget, PassType};
use crate::resources::{ShaderKind, ShaderTable};
use crate::TonemapSettings;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TonemapConstants {
    /// x exposure, y gamma, z operator index
    pub params: Vec4,
}

impl From<&TonemapSettings> for TonemapConstants {
    fn from(settings: &TonemapSettings) -> Self {
        Self {
            params: Vec4::new(
                settings.exposure,
                // gamma of zero would divide by zero in the shader
                settings.gamma.max(0.01),
                settings.operator.shader_index() as f32,
                0.0,
            ),
        }
    }
}

/// Tonemapping post-process pass
pub struct TonemapPass {
    pub settings: TonemapSettings,
    target: PassTarget,
    sampler: SamplerHandle,
    fullscreen: FullscreenPipeline,
}

impl TonemapPass {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        settings: TonemapSettings,
        input: TextureHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let shader = shaders.get(ShaderKind::Tonemap)?;
        let target = Self::create_target(ctx, width, height)?;
        let sampler = match ctx.create_sampler(&SamplerDesc {
            label: Some("tonemap_sampler".into()),
            ..Default::default()
        }) {
            Ok(sampler) => sampler,
            Err(e) => {
                target.release(ctx);
                return Err(e);
            }
        };
        let fullscreen = FullscreenPipeline::new(
            ctx,
            PassType::Tonemap.name(),
            shader,
            &target,
            FullscreenInputs {
                constants_size: std::mem::size_of::<TonemapConstants>() as u64,
                textures: &[input],
                samplers: &[sampler],
                buffers: &[],
            },
        );
        match fullscreen {
            Ok(fullscreen) => Ok(Self {
                settings,
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

    fn create_target(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            PassType::Tonemap.name(),
            width,
            height,
            &[("tonemap", TextureFormat::Rgba8Unorm)],
            None,
        )
    }

    pub fn output(&self) -> Option<TextureHandle> {
        self.target.color(0)
    }

    pub fn set_input(&self, ctx: &mut RenderContext, input: TextureHandle) -> RenderResult<()> {
        self.fullscreen.set_inputs(ctx, &[input])
    }

    pub fn execute(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        self.fullscreen
            .write_constants(ctx, &TonemapConstants::from(&self.settings))?;
        self.fullscreen.draw(ctx, &self.target)
    }
}

impl FramePass for TonemapPass {
    fn name(&self) -> &str {
        PassType::Tonemap.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Tonemap
    }

    fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        let target = Self::create_target(ctx, width, height)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TonemapOperator;

    #[test]
    fn constants_encode_operator_and_clamp_gamma() {
        let settings = TonemapSettings {
            operator: TonemapOperator::Uncharted2,
            exposure: 1.5,
            gamma: 0.0,
        };
        let constants = TonemapConstants::from(&settings);
        assert_eq!(constants.params.x, 1.5);
        assert!(constants.params.y > 0.0);
        assert_eq!(constants.params.z, 2.0);
    }
}
