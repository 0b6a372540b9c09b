//! Bloom post-processing effect
//!
//! Bright pass at half resolution, a separable gaussian blur, then an
//! upsample that adds the glow back onto the scene at full resolution.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::{SamplerDesc, SamplerHandle, ShaderHandle, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::fullscreen::{FullscreenInputs, FullscreenPipeline};
use crate::pipeline::{FramePass, PassTarget, PassType};
use crate::resources::{ShaderKind, ShaderTable};
use crate::BloomSettings;

use super::GaussianBlur;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BloomConstants {
    /// x threshold, y intensity, zw target size in pixels
    pub params: Vec4,
}

impl BloomConstants {
    pub fn new(settings: &BloomSettings, target: &PassTarget) -> Self {
        Self {
            params: Vec4::new(
                settings.threshold,
                settings.intensity,
                target.width as f32,
                target.height as f32,
            ),
        }
    }
}

fn target_color(target: &PassTarget) -> RenderResult<TextureHandle> {
    target
        .color(0)
        .ok_or_else(|| RenderError::usage("bloom target has no color attachment"))
}

fn half_size(width: u32, height: u32) -> (u32, u32) {
    ((width / 2).max(1), (height / 2).max(1))
}

/// Bloom post-processing pass
pub struct BloomPass {
    pub settings: BloomSettings,
    sampler: SamplerHandle,
    threshold_target: PassTarget,
    threshold: FullscreenPipeline,
    blur: GaussianBlur,
    composite_target: PassTarget,
    composite: FullscreenPipeline,
}

impl BloomPass {
    /// Reads the HDR `scene` of `width`x`height`
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        settings: BloomSettings,
        scene: TextureHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let threshold_shader = shaders.get(ShaderKind::BloomThreshold)?;
        let composite_shader = shaders.get(ShaderKind::BloomUpsample)?;
        let sampler = ctx.create_sampler(&SamplerDesc {
            label: Some("linear_clamp".into()),
            ..Default::default()
        })?;

        let mut parts = Parts::new(sampler);
        match Self::build(
            ctx,
            shaders,
            settings,
            scene,
            width,
            height,
            (threshold_shader, composite_shader),
            &mut parts,
        ) {
            Ok(pass) => Ok(pass),
            Err(e) => {
                parts.release(ctx);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        settings: BloomSettings,
        scene: TextureHandle,
        width: u32,
        height: u32,
        (threshold_shader, composite_shader): (ShaderHandle, ShaderHandle),
        parts: &mut Parts,
    ) -> RenderResult<Self> {
        let sampler = parts.sampler;
        let constants_size = std::mem::size_of::<BloomConstants>() as u64;
        let (half_w, half_h) = half_size(width, height);

        let threshold_target = Self::create_threshold_target(ctx, half_w, half_h)?;
        parts.targets.push(threshold_target.clone());
        let composite_target = Self::create_composite_target(ctx, width, height)?;
        parts.targets.push(composite_target.clone());

        let threshold = FullscreenPipeline::new(
            ctx,
            "Bloom Threshold",
            threshold_shader,
            &threshold_target,
            FullscreenInputs {
                constants_size,
                textures: &[scene],
                samplers: &[sampler],
                buffers: &[],
            },
        )?;
        parts.pipelines.push(threshold.clone());

        let bright = target_color(&threshold_target)?;
        let blur = GaussianBlur::new(ctx, shaders, bright, sampler, half_w, half_h)?;
        let glow = blur.output();
        parts.blur = Some(blur);
        let glow = glow.ok_or_else(|| RenderError::usage("blur target has no color attachment"))?;

        let composite = FullscreenPipeline::new(
            ctx,
            "Bloom Upsample",
            composite_shader,
            &composite_target,
            FullscreenInputs {
                constants_size,
                textures: &[scene, glow],
                samplers: &[sampler, sampler],
                buffers: &[],
            },
        )?;

        let blur = parts
            .blur
            .take()
            .ok_or_else(|| RenderError::usage("bloom blur missing after construction"))?;
        Ok(Self {
            settings,
            sampler,
            threshold_target,
            threshold,
            blur,
            composite_target,
            composite,
        })
    }

    fn create_threshold_target(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            "Bloom Threshold",
            width,
            height,
            &[("bloom_threshold", TextureFormat::Rgba16Float)],
            None,
        )
    }

    fn create_composite_target(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            "Bloom Upsample",
            width,
            height,
            &[("bloom_composite", TextureFormat::Rgba16Float)],
            None,
        )
    }

    /// Scene with bloom added, at full resolution
    pub fn output(&self) -> Option<TextureHandle> {
        self.composite_target.color(0)
    }

    pub fn execute(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        ctx.push_marker(PassType::Bloom.name());
        let result = self.run(ctx);
        ctx.pop_marker();
        result
    }

    fn run(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        self.threshold
            .write_constants(ctx, &BloomConstants::new(&self.settings, &self.threshold_target))?;
        self.threshold.draw(ctx, &self.threshold_target)?;
        self.blur.execute(ctx)?;
        self.composite
            .write_constants(ctx, &BloomConstants::new(&self.settings, &self.composite_target))?;
        self.composite.draw(ctx, &self.composite_target)
    }

    /// Rebind the HDR scene after it was recreated
    pub fn set_scene(&self, ctx: &mut RenderContext, scene: TextureHandle) -> RenderResult<()> {
        self.threshold.set_inputs(ctx, &[scene])?;
        match self.blur.output() {
            Some(glow) => self.composite.set_inputs(ctx, &[scene, glow]),
            None => Ok(()),
        }
    }
}

impl FramePass for BloomPass {
    fn name(&self) -> &str {
        PassType::Bloom.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Bloom
    }

    /// Call [`BloomPass::set_scene`] afterwards with the new scene texture
    fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        let (half_w, half_h) = half_size(width, height);
        let threshold_target = Self::create_threshold_target(ctx, half_w, half_h)?;
        let composite_target = match Self::create_composite_target(ctx, width, height) {
            Ok(target) => target,
            Err(e) => {
                threshold_target.release(ctx);
                return Err(e);
            }
        };
        self.threshold_target.release(ctx);
        self.composite_target.release(ctx);
        self.threshold_target = threshold_target;
        self.composite_target = composite_target;
        let bright = target_color(&self.threshold_target)?;
        self.blur.resize(ctx, bright, half_w, half_h)
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.threshold.release(ctx);
        self.composite.release(ctx);
        self.blur.release(ctx);
        self.threshold_target.release(ctx);
        self.composite_target.release(ctx);
        ctx.destroy_sampler(self.sampler);
    }
}

/// Pieces created so far, released if construction fails
struct Parts {
    sampler: SamplerHandle,
    targets: Vec<PassTarget>,
    pipelines: Vec<FullscreenPipeline>,
    blur: Option<GaussianBlur>,
}

impl Parts {
    fn new(sampler: SamplerHandle) -> Self {
        Self {
            sampler,
            targets: Vec::new(),
            pipelines: Vec::new(),
            blur: None,
        }
    }

    fn release(mut self, ctx: &mut RenderContext) {
        for pipeline in &self.pipelines {
            pipeline.release(ctx);
        }
        if let Some(blur) = self.blur.as_mut() {
            blur.release(ctx);
        }
        for target in &self.targets {
            target.release(ctx);
        }
        ctx.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_size_never_reaches_zero() {
        assert_eq!(half_size(1280, 720), (640, 360));
        assert_eq!(half_size(1, 1), (1, 1));
        assert_eq!(half_size(3, 5), (1, 2));
    }
}
