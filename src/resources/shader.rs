//! Shader table
//!
//! Every program the engine uses is named by a [`ShaderKind`]. The table
//! maps kinds to asset names under `data/shaders/` and is loaded once at
//! startup; it is not extensible at runtime.

use std::collections::HashMap;

use crate::backend::{ShaderHandle, ShaderStageFlags};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};

/// Every shader program known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Shadow,
    GBuffer,
    DeferredLight,
    AtmosphereTransmittance,
    AtmosphereSkyView,
    AtmosphereApply,
    BloomThreshold,
    GaussianBlurVertical,
    GaussianBlurHorizontal,
    BloomUpsample,
    Tonemap,
    Fxaa,
    ConstantColor,
    Unlit,
    ParallaxOcclusion,
    Present,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 16] = [
        ShaderKind::Shadow,
        ShaderKind::GBuffer,
        ShaderKind::DeferredLight,
        ShaderKind::AtmosphereTransmittance,
        ShaderKind::AtmosphereSkyView,
        ShaderKind::AtmosphereApply,
        ShaderKind::BloomThreshold,
        ShaderKind::GaussianBlurVertical,
        ShaderKind::GaussianBlurHorizontal,
        ShaderKind::BloomUpsample,
        ShaderKind::Tonemap,
        ShaderKind::Fxaa,
        ShaderKind::ConstantColor,
        ShaderKind::Unlit,
        ShaderKind::ParallaxOcclusion,
        ShaderKind::Present,
    ];

    /// Asset name under `data/shaders/`, without extension
    pub fn name(&self) -> &'static str {
        match self {
            ShaderKind::Shadow => "shadow",
            ShaderKind::GBuffer => "gbuffer",
            ShaderKind::DeferredLight => "deferred_light",
            ShaderKind::AtmosphereTransmittance => "atmosphere_transmittance",
            ShaderKind::AtmosphereSkyView => "atmosphere_sky_view",
            ShaderKind::AtmosphereApply => "atmosphere_apply",
            ShaderKind::BloomThreshold => "bloom_threshold",
            ShaderKind::GaussianBlurVertical => "gaussian_blur_vertical",
            ShaderKind::GaussianBlurHorizontal => "gaussian_blur_horizontal",
            ShaderKind::BloomUpsample => "bloom_upsample",
            ShaderKind::Tonemap => "tonemap",
            ShaderKind::Fxaa => "fxaa",
            ShaderKind::ConstantColor => "constant_color",
            ShaderKind::Unlit => "unlit",
            ShaderKind::ParallaxOcclusion => "parallax_occlusion",
            ShaderKind::Present => "present",
        }
    }

    pub fn stages(&self) -> ShaderStageFlags {
        match self {
            // depth only
            ShaderKind::Shadow => ShaderStageFlags::VERTEX,
            _ => ShaderStageFlags::VERTEX_FRAGMENT,
        }
    }
}

/// Compiled shaders for every [`ShaderKind`]
#[derive(Debug)]
pub struct ShaderTable {
    shaders: HashMap<ShaderKind, ShaderHandle>,
}

impl ShaderTable {
    /// Load every shader kind; fails on the first missing or broken program
    pub fn load(ctx: &mut RenderContext) -> RenderResult<Self> {
        let mut shaders = HashMap::with_capacity(ShaderKind::ALL.len());
        for kind in ShaderKind::ALL {
            match ctx.create_shader(kind.name(), kind.stages()) {
                Ok(handle) => {
                    shaders.insert(kind, handle);
                }
                Err(e) => {
                    for handle in shaders.into_values() {
                        ctx.destroy_shader(handle);
                    }
                    return Err(e);
                }
            }
        }
        log::info!("Loaded {} shaders", shaders.len());
        Ok(Self { shaders })
    }

    pub fn get(&self, kind: ShaderKind) -> RenderResult<ShaderHandle> {
        self.shaders
            .get(&kind)
            .copied()
            .ok_or_else(|| RenderError::usage(format!("shader {} not loaded", kind.name())))
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub fn release(self, ctx: &mut RenderContext) {
        for handle in self.shaders.into_values() {
            ctx.destroy_shader(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = ShaderKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ShaderKind::ALL.len());
    }

    #[test]
    fn every_shipped_shader_loads() {
        let mut ctx = RenderContext::new(
            Box::new(HeadlessBackend::new(16, 16)),
            env!("CARGO_MANIFEST_DIR"),
        )
        .unwrap();
        let table = ShaderTable::load(&mut ctx).unwrap();
        assert_eq!(table.len(), ShaderKind::ALL.len());
        assert!(table.get(ShaderKind::Tonemap).is_ok());
        table.release(&mut ctx);
    }

    #[test]
    fn missing_root_fails_cleanly() {
        let mut ctx =
            RenderContext::new(Box::new(HeadlessBackend::new(16, 16)), "/nonexistent").unwrap();
        assert!(matches!(
            ShaderTable::load(&mut ctx),
            Err(RenderError::AssetNotFound(_))
        ));
    }
}
