//! Anti-aliasing pass
//!
//! FXAA over the tonemapped image. With anti-aliasing off the same shader
//! runs as a plain copy so the rest of the chain keeps a fixed input.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::{SamplerDesc, SamplerHandle, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::pipeline::fullscreen::{FullscreenInputs, FullscreenPipeline};
use crate::pipeline::{FramePass, PassTarget, PassType};
use crate::resources::{ShaderKind, ShaderTable};
use crate::AntiAliasing;

/// Relative local contrast needed to treat a pixel as an edge
pub const FXAA_EDGE_THRESHOLD: f32 = 0.125;
/// Contrast below which dark pixels are never processed
pub const FXAA_EDGE_THRESHOLD_MIN: f32 = 0.0312;
/// Amount of sub-pixel aliasing removal
pub const FXAA_SUBPIXEL: f32 = 0.75;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FxaaConstants {
    /// xy target size in pixels, zw texel size
    pub params: Vec4,
    /// x enabled, y edge threshold, z minimum threshold, w subpixel blend
    pub settings: Vec4,
}

impl FxaaConstants {
    pub fn new(mode: AntiAliasing, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        let enabled = match mode {
            AntiAliasing::Fxaa => 1.0,
            AntiAliasing::Off => 0.0,
        };
        Self {
            params: Vec4::new(w, h, 1.0 / w, 1.0 / h),
            settings: Vec4::new(
                enabled,
                FXAA_EDGE_THRESHOLD,
                FXAA_EDGE_THRESHOLD_MIN,
                FXAA_SUBPIXEL,
            ),
        }
    }
}

pub struct AntiAliasingPass {
    pub mode: AntiAliasing,
    target: PassTarget,
    sampler: SamplerHandle,
    fullscreen: FullscreenPipeline,
}

impl AntiAliasingPass {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        mode: AntiAliasing,
        input: TextureHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let shader = shaders.get(ShaderKind::Fxaa)?;
        let target = Self::create_target(ctx, width, height)?;
        let sampler = match ctx.create_sampler(&SamplerDesc {
            label: Some("fxaa_sampler".into()),
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
            PassType::AntiAliasing.name(),
            shader,
            &target,
            FullscreenInputs {
                constants_size: std::mem::size_of::<FxaaConstants>() as u64,
                textures: &[input],
                samplers: &[sampler],
                buffers: &[],
            },
        );
        match fullscreen {
            Ok(fullscreen) => Ok(Self {
                mode,
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
            PassType::AntiAliasing.name(),
            width,
            height,
            &[("aa", TextureFormat::Rgba8Unorm)],
            None,
        )
    }

    /// Final scene color; the UI pass draws on top of it
    pub fn output(&self) -> Option<TextureHandle> {
        self.target.color(0)
    }

    pub fn set_input(&self, ctx: &mut RenderContext, input: TextureHandle) -> RenderResult<()> {
        self.fullscreen.set_inputs(ctx, &[input])
    }

    pub fn execute(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        let constants = FxaaConstants::new(self.mode, self.target.width, self.target.height);
        self.fullscreen.write_constants(ctx, &constants)?;
        self.fullscreen.draw(ctx, &self.target)
    }
}

impl FramePass for AntiAliasingPass {
    fn name(&self) -> &str {
        PassType::AntiAliasing.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::AntiAliasing
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

    #[test]
    fn off_disables_the_filter() {
        assert_eq!(FxaaConstants::new(AntiAliasing::Off, 4, 4).settings.x, 0.0);
        let on = FxaaConstants::new(AntiAliasing::Fxaa, 200, 100);
        assert_eq!(on.settings.x, 1.0);
        assert_eq!(on.params.z, 1.0 / 200.0);
    }
}
