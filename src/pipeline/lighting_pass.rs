//! Deferred lighting pass
//!
//! Performs lighting calculations using G-buffer data. Renders a fullscreen
//! triangle shading the sun (with its shadow map) and the frame's sphere
//! lights into an HDR target.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{
    BufferHandle, BufferUsage, CompareFunction, FilterMode, SamplerDesc, SamplerHandle,
    TextureFormat, TextureHandle,
};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::resources::{ShaderKind, ShaderTable};
use crate::scene::{FrameParams, GpuSphereLight, MAX_SPHERE_LIGHTS};
use crate::BackendType;

use super::fullscreen::{FullscreenInputs, FullscreenPipeline};
use super::{FramePass, PassTarget, PassType};

/// Constant ambient term applied to every lit pixel
pub const AMBIENT: f32 = 0.03;
/// Depth bias of the shadow comparison
pub const SHADOW_BIAS: f32 = 0.002;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightingConstants {
    pub inverse_view_projection: Mat4,
    pub sun_view_projection: Mat4,
    pub eye: Vec4,
    /// xyz travel direction, w 1.0 when a sun is present
    pub sun_direction: Vec4,
    /// rgb color, w power
    pub sun_color: Vec4,
    /// x sphere light count, y ambient, z clip-space y sign, w shadow bias
    pub params: Vec4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<LightingConstants>(), 192);

impl LightingConstants {
    pub fn from_frame(frame: &FrameParams, light_count: usize) -> Self {
        let y_sign = match frame.backend {
            BackendType::Vulkan => -1.0,
            _ => 1.0,
        };
        let (sun_view_projection, sun_direction, sun_color) = match frame.sun() {
            Some(sun) => (
                sun.view_projection,
                sun.direction.extend(1.0),
                sun.color.extend(sun.power),
            ),
            None => (Mat4::IDENTITY, Vec4::ZERO, Vec4::ZERO),
        };
        Self {
            inverse_view_projection: frame.view_projection().inverse(),
            sun_view_projection,
            eye: frame.eye.extend(1.0),
            sun_direction,
            sun_color,
            params: Vec4::new(light_count as f32, AMBIENT, y_sign, SHADOW_BIAS),
        }
    }
}

/// Deferred lighting pass
pub struct LightingPass {
    target: PassTarget,
    fullscreen: FullscreenPipeline,
    light_buffer: BufferHandle,
    point_sampler: SamplerHandle,
    shadow_sampler: SamplerHandle,
}

impl LightingPass {
    /// `inputs` are the gbuffer albedo, normal, material and depth plus the shadow map
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        width: u32,
        height: u32,
        inputs: &[TextureHandle; 5],
    ) -> RenderResult<Self> {
        let target = Self::create_target(ctx, width, height)?;
        let mut created = Created::new(target);
        match Self::build(ctx, shaders, inputs, &mut created) {
            Ok(pass) => Ok(pass),
            Err(e) => {
                created.release(ctx);
                Err(e)
            }
        }
    }

    fn build(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        inputs: &[TextureHandle; 5],
        created: &mut Created,
    ) -> RenderResult<Self> {
        let light_buffer = ctx.create_buffer(
            MAX_SPHERE_LIGHTS as u64,
            std::mem::size_of::<GpuSphereLight>() as u64,
            BufferUsage::STORAGE | BufferUsage::COPY_DST,
            "sphere lights",
        )?;
        created.buffer = Some(light_buffer);
        let point_sampler = ctx.create_sampler(&SamplerDesc::point_clamp())?;
        created.samplers.push(point_sampler);
        let shadow_sampler = ctx.create_sampler(&SamplerDesc {
            label: Some("shadow_compare".into()),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Nearest,
            compare: Some(CompareFunction::LessEqual),
            ..Default::default()
        })?;
        created.samplers.push(shadow_sampler);

        let samplers = [
            point_sampler,
            point_sampler,
            point_sampler,
            point_sampler,
            shadow_sampler,
        ];
        let fullscreen = FullscreenPipeline::new(
            ctx,
            PassType::DeferredLight.name(),
            shaders.get(ShaderKind::DeferredLight)?,
            &created.target,
            FullscreenInputs {
                constants_size: std::mem::size_of::<LightingConstants>() as u64,
                textures: inputs,
                samplers: &samplers,
                buffers: &[light_buffer],
            },
        )?;

        Ok(Self {
            target: created.target.clone(),
            fullscreen,
            light_buffer,
            point_sampler,
            shadow_sampler,
        })
    }

    fn create_target(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            PassType::DeferredLight.name(),
            width,
            height,
            &[("hdr_color", TextureFormat::Rgba16Float)],
            None,
        )
    }

    pub fn hdr_output(&self) -> Option<TextureHandle> {
        self.target.color(0)
    }

    pub fn light_buffer(&self) -> BufferHandle {
        self.light_buffer
    }

    /// Rebind the gbuffer and shadow map after they were recreated
    pub fn set_inputs(&self, ctx: &mut RenderContext, inputs: &[TextureHandle; 5]) -> RenderResult<()> {
        self.fullscreen.set_inputs(ctx, inputs)
    }

    pub fn execute(&self, ctx: &mut RenderContext, frame: &FrameParams) -> RenderResult<()> {
        let lights: Vec<GpuSphereLight> = frame
            .sphere_lights()
            .iter()
            .take(MAX_SPHERE_LIGHTS)
            .map(|l| l.to_gpu_data())
            .collect();
        if !lights.is_empty() {
            ctx.update_buffer(self.light_buffer, 0, bytemuck::cast_slice(&lights))?;
        }
        let constants = LightingConstants::from_frame(frame, lights.len());
        self.fullscreen.write_constants(ctx, &constants)?;
        self.fullscreen.draw(ctx, &self.target)
    }
}

/// Resources of a lighting pass under construction
struct Created {
    target: PassTarget,
    buffer: Option<BufferHandle>,
    samplers: Vec<SamplerHandle>,
}

impl Created {
    fn new(target: PassTarget) -> Self {
        Self {
            target,
            buffer: None,
            samplers: Vec::new(),
        }
    }

    fn release(self, ctx: &mut RenderContext) {
        for sampler in self.samplers {
            ctx.destroy_sampler(sampler);
        }
        if let Some(buffer) = self.buffer {
            ctx.destroy_buffer(buffer);
        }
        self.target.release(ctx);
    }
}

impl FramePass for LightingPass {
    fn name(&self) -> &str {
        PassType::DeferredLight.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::DeferredLight
    }

    fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        let target = Self::create_target(ctx, width, height)?;
        self.target.release(ctx);
        self.target = target;
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.fullscreen.release(ctx);
        ctx.destroy_sampler(self.point_sampler);
        ctx.destroy_sampler(self.shadow_sampler);
        ctx.destroy_buffer(self.light_buffer);
        self.target.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{DirectionalLight, SphereLight};
    use glam::Vec3;

    #[test]
    fn constants_flip_y_on_vulkan_only() {
        let mut frame = FrameParams::new();
        frame.backend = BackendType::Vulkan;
        assert_eq!(LightingConstants::from_frame(&frame, 0).params.z, -1.0);
        frame.backend = BackendType::Dx12;
        assert_eq!(LightingConstants::from_frame(&frame, 0).params.z, 1.0);
    }

    #[test]
    fn constants_carry_sun_and_light_count() {
        let frame = FrameParams::new();
        let none = LightingConstants::from_frame(&frame, 0);
        assert_eq!(none.sun_direction.w, 0.0);

        frame.set_sun(DirectionalLight {
            color: Vec3::new(1.0, 0.5, 0.25),
            power: 4.0,
            ..Default::default()
        });
        frame.push_sphere_light(SphereLight::default());
        let lit = LightingConstants::from_frame(&frame, frame.sphere_lights().len());
        assert_eq!(lit.sun_direction.w, 1.0);
        assert_eq!(lit.sun_color, Vec4::new(1.0, 0.5, 0.25, 4.0));
        assert_eq!(lit.params.x, 1.0);
    }
}
