//! Atmosphere pass
//!
//! Three fullscreen draws per frame:
//! 1. transmittance from any altitude to the top of the atmosphere, into a
//!    small lookup table indexed by view zenith and height
//! 2. single-scattered sky radiance seen from the camera, into a lookup
//!    table indexed by azimuth and elevation
//! 3. the sky and sun disk, written into the HDR target wherever the
//!    gbuffer depth is still at the far plane
//!
//! Without an atmosphere in the frame the pass records only its marker.

use std::f32::consts::{FRAC_PI_2, TAU};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{LoadOp, SamplerDesc, SamplerHandle, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{ShaderKind, ShaderTable};
use crate::scene::{Atmosphere, DirectionalLight, FrameParams};
use crate::BackendType;

use super::fullscreen::{FullscreenInputs, FullscreenPipeline};
use super::{FramePass, PassTarget, PassType};

pub const TRANSMITTANCE_SIZE: (u32, u32) = (256, 64);
pub const SKY_VIEW_SIZE: (u32, u32) = (192, 108);

/// Camera altitude above the ground used when the eye is below it
const MIN_EYE_ALTITUDE_M: f32 = 1.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AtmosphereConstants {
    /// x planet radius (m), y atmosphere radius (m), zw inverse target size
    pub radii_dims: Vec4,
    /// xyz scattering per meter, w average density height (m)
    pub rayleigh: Vec4,
    pub mie: Vec4,
    /// xyz absorption per meter, w layer altitude (m)
    pub ozone: Vec4,
    /// xyz unit vector towards the sun, w sun power
    pub sun_direction: Vec4,
    /// x azimuth / 2pi, y elevation / (pi / 2)
    pub sun_angles: Vec4,
    /// x clip-space y sign, y eye altitude (m)
    pub params: Vec4,
    pub inverse_projection: Mat4,
    pub inverse_view: Mat4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AtmosphereConstants>(), 240);

impl AtmosphereConstants {
    pub fn new(atmosphere: &Atmosphere, frame: &FrameParams, target_size: (u32, u32)) -> Self {
        let sun = frame.sun().unwrap_or_default();
        let to_sun = -sun.direction.normalize_or_zero();
        let (azimuth, elevation) = sun_angles(&sun);
        let y_sign = match frame.backend {
            BackendType::Vulkan => -1.0,
            _ => 1.0,
        };
        Self {
            radii_dims: Vec4::new(
                atmosphere.planet_radius_km * 1000.0,
                atmosphere.atmosphere_radius_km * 1000.0,
                1.0 / target_size.0.max(1) as f32,
                1.0 / target_size.1.max(1) as f32,
            ),
            rayleigh: atmosphere
                .rayleigh_coefficients
                .extend(atmosphere.rayleigh_average_km * 1000.0),
            mie: atmosphere
                .mie_coefficients
                .extend(atmosphere.mie_average_km * 1000.0),
            ozone: atmosphere
                .ozone_coefficients
                .extend(atmosphere.ozone_average_km * 1000.0),
            sun_direction: to_sun.extend(sun.power),
            sun_angles: Vec4::new(azimuth / TAU, elevation / FRAC_PI_2, 0.0, 0.0),
            params: Vec4::new(y_sign, frame.eye.y.max(MIN_EYE_ALTITUDE_M), 0.0, 0.0),
            inverse_projection: frame.projection.inverse(),
            inverse_view: frame.view.inverse(),
        }
    }
}

/// Azimuth in [0, 2pi) and elevation of the sun, matching [`crate::scene::Sun`]
fn sun_angles(sun: &DirectionalLight) -> (f32, f32) {
    let to_sun = -sun.direction.normalize_or_zero();
    let elevation = to_sun.y.clamp(-1.0, 1.0).asin();
    let azimuth = to_sun.x.atan2(-to_sun.z).rem_euclid(TAU);
    (azimuth, elevation)
}

/// Atmospheric scattering pass
pub struct AtmospherePass {
    sampler: SamplerHandle,
    transmittance_target: PassTarget,
    transmittance: FullscreenPipeline,
    sky_view_target: PassTarget,
    sky_view: FullscreenPipeline,
    apply_target: PassTarget,
    apply: FullscreenPipeline,
}

impl AtmospherePass {
    /// Draws the sky into `hdr`, behind everything `depth` covers
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        hdr: TextureHandle,
        depth: TextureHandle,
    ) -> RenderResult<Self> {
        let sampler = ctx.create_sampler(&SamplerDesc {
            label: Some("atmosphere_lut".into()),
            ..Default::default()
        })?;
        let mut parts = Parts::new(sampler);
        match Self::build(ctx, shaders, hdr, depth, &mut parts) {
            Ok(pass) => Ok(pass),
            Err(e) => {
                parts.release(ctx);
                Err(e)
            }
        }
    }

    fn build(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        hdr: TextureHandle,
        depth: TextureHandle,
        parts: &mut Parts,
    ) -> RenderResult<Self> {
        let sampler = parts.sampler;
        let constants_size = std::mem::size_of::<AtmosphereConstants>() as u64;

        let (w, h) = TRANSMITTANCE_SIZE;
        let transmittance_target = PassTarget::create(
            ctx,
            "Atmosphere Transmittance",
            w,
            h,
            &[("atmosphere_transmittance", TextureFormat::Rgba16Float)],
            None,
        )?;
        parts.targets.push(transmittance_target.clone());
        let (w, h) = SKY_VIEW_SIZE;
        let sky_view_target = PassTarget::create(
            ctx,
            "Atmosphere Sky View",
            w,
            h,
            &[("atmosphere_sky_view", TextureFormat::Rgba16Float)],
            None,
        )?;
        parts.targets.push(sky_view_target.clone());
        let apply_target = Self::wrap_scene(ctx, hdr)?;
        parts.targets.push(apply_target.clone());

        let transmittance_lut = lut_color(&transmittance_target)?;
        let sky_view_lut = lut_color(&sky_view_target)?;

        let transmittance = FullscreenPipeline::new(
            ctx,
            "Atmosphere Transmittance",
            shaders.get(ShaderKind::AtmosphereTransmittance)?,
            &transmittance_target,
            FullscreenInputs {
                constants_size,
                ..Default::default()
            },
        )?;
        parts.pipelines.push(transmittance.clone());

        let sky_view = FullscreenPipeline::new(
            ctx,
            "Atmosphere Sky View",
            shaders.get(ShaderKind::AtmosphereSkyView)?,
            &sky_view_target,
            FullscreenInputs {
                constants_size,
                textures: &[transmittance_lut],
                samplers: &[sampler],
                buffers: &[],
            },
        )?;
        parts.pipelines.push(sky_view.clone());

        let apply = FullscreenPipeline::new(
            ctx,
            "Atmosphere Apply",
            shaders.get(ShaderKind::AtmosphereApply)?,
            &apply_target,
            FullscreenInputs {
                constants_size,
                textures: &[transmittance_lut, sky_view_lut, depth],
                samplers: &[sampler, sampler, sampler],
                buffers: &[],
            },
        )?;

        log::debug!("Atmosphere pass ready");
        Ok(Self {
            sampler,
            transmittance_target,
            transmittance,
            sky_view_target,
            sky_view,
            apply_target,
            apply,
        })
    }

    fn wrap_scene(ctx: &mut RenderContext, hdr: TextureHandle) -> RenderResult<PassTarget> {
        PassTarget::wrap(ctx, "Atmosphere Apply", &[hdr], LoadOp::Load)
    }

    /// Transmittance and sky-view tables
    pub fn lookup_tables(&self) -> Vec<TextureHandle> {
        self.transmittance_target
            .colors
            .iter()
            .chain(self.sky_view_target.colors.iter())
            .copied()
            .collect()
    }

    /// Point the pass at a recreated HDR target and gbuffer depth
    pub fn set_scene(&mut self, ctx: &mut RenderContext, hdr: TextureHandle, depth: TextureHandle) -> RenderResult<()> {
        let target = Self::wrap_scene(ctx, hdr)?;
        self.apply_target.release(ctx);
        self.apply_target = target;
        let transmittance_lut = lut_color(&self.transmittance_target)?;
        let sky_view_lut = lut_color(&self.sky_view_target)?;
        self.apply
            .set_inputs(ctx, &[transmittance_lut, sky_view_lut, depth])
    }

    pub fn execute(&self, ctx: &mut RenderContext, frame: &FrameParams) -> RenderResult<()> {
        ctx.push_marker(PassType::Atmosphere.name());
        let result = match frame.atmosphere() {
            Some(atmosphere) => self.run(ctx, frame, &atmosphere),
            None => Ok(()),
        };
        ctx.pop_marker();
        result
    }

    fn run(&self, ctx: &mut RenderContext, frame: &FrameParams, atmosphere: &Atmosphere) -> RenderResult<()> {
        let stages = [
            (&self.transmittance, &self.transmittance_target),
            (&self.sky_view, &self.sky_view_target),
            (&self.apply, &self.apply_target),
        ];
        for (pipeline, target) in stages {
            let constants = AtmosphereConstants::new(atmosphere, frame, (target.width, target.height));
            pipeline.write_constants(ctx, &constants)?;
            pipeline.draw(ctx, target)?;
        }
        Ok(())
    }
}

fn lut_color(target: &PassTarget) -> RenderResult<TextureHandle> {
    target
        .color(0)
        .ok_or_else(|| RenderError::usage("atmosphere lookup table has no color attachment"))
}

impl FramePass for AtmospherePass {
    fn name(&self) -> &str {
        PassType::Atmosphere.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Atmosphere
    }

    /// Lookup tables keep their size; call [`AtmospherePass::set_scene`]
    /// with the recreated HDR target and depth
    fn resize(&mut self, _ctx: &mut RenderContext, _width: u32, _height: u32) -> RenderResult<()> {
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.apply.release(ctx);
        self.sky_view.release(ctx);
        self.transmittance.release(ctx);
        self.apply_target.release(ctx);
        self.sky_view_target.release(ctx);
        self.transmittance_target.release(ctx);
        ctx.destroy_sampler(self.sampler);
    }
}

/// Pieces created so far, released if construction fails
struct Parts {
    sampler: SamplerHandle,
    targets: Vec<PassTarget>,
    pipelines: Vec<FullscreenPipeline>,
}

impl Parts {
    fn new(sampler: SamplerHandle) -> Self {
        Self {
            sampler,
            targets: Vec::new(),
            pipelines: Vec::new(),
        }
    }

    fn release(self, ctx: &mut RenderContext) {
        for pipeline in &self.pipelines {
            pipeline.release(ctx);
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
    use crate::scene::Sun;
    use glam::Vec3;

    #[test]
    fn constants_scale_kilometers_to_meters() {
        let frame = FrameParams::new();
        let constants = AtmosphereConstants::new(&Atmosphere::default(), &frame, (256, 64));
        assert_eq!(constants.radii_dims.x, 6_360_000.0);
        assert_eq!(constants.radii_dims.y, 6_460_000.0);
        assert_eq!(constants.radii_dims.z, 1.0 / 256.0);
        assert_eq!(constants.rayleigh.w, 8000.0);
        assert_eq!(constants.ozone.w, 25_000.0);
        assert_eq!(constants.params.y, MIN_EYE_ALTITUDE_M);
    }

    #[test]
    fn sun_angles_round_trip_through_the_light() {
        let sun = Sun::new(1.2, 0.4);
        let light = sun.to_directional_light(Vec3::ZERO, BackendType::Headless);
        let (azimuth, elevation) = sun_angles(&light);
        assert!((azimuth - 1.2).abs() < 1e-4);
        assert!((elevation - 0.4).abs() < 1e-4);

        let frame = FrameParams::new();
        frame.set_sun(light);
        let constants = AtmosphereConstants::new(&Atmosphere::default(), &frame, (1, 1));
        assert!((constants.sun_angles.y - 0.4 / FRAC_PI_2).abs() < 1e-4);
        assert!((constants.sun_direction.truncate() - sun.to_sun()).length() < 1e-5);
    }
}
