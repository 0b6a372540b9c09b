//! Unlit materials
//!
//! Textured or single-color surfaces. They write the gbuffer with the unlit
//! flag in the material target's blue channel, and the lighting pass outputs
//! their albedo unshaded.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use parking_lot::Mutex;

use crate::backend::{SamplerDesc, SamplerHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::pipeline::{PassType, PassTypeFlags};

use super::material::{create_binding, PassBinding, Partial};
use super::{DrawView, Material, MaterialPasses, ShaderKind, ShaderTable, Texture, TextureLoader};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UnlitConstants {
    mvp: Mat4,
    color: Vec4,
}

/// Description of an [`UnlitMaterial`]
#[derive(Debug, Clone, PartialEq)]
pub struct UnlitMaterialDesc {
    pub name: String,
    /// File under `data/textures/`; empty draws `color` alone
    pub texture: String,
    pub color: Vec4,
}

impl UnlitMaterialDesc {
    pub fn textured(name: impl Into<String>, texture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            texture: texture.into(),
            color: Vec4::ONE,
        }
    }

    pub fn constant_color(name: impl Into<String>, color: Vec4) -> Self {
        Self {
            name: name.into(),
            texture: String::new(),
            color,
        }
    }
}

/// Surface that ignores every light
pub struct UnlitMaterial {
    name: String,
    texture: Texture,
    sampler: SamplerHandle,
    gbuffer: PassBinding,
    color: Mutex<Vec4>,
}

impl UnlitMaterial {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        passes: &MaterialPasses,
        desc: &UnlitMaterialDesc,
    ) -> RenderResult<Self> {
        let mut partial = Partial::default();
        match Self::build(ctx, shaders, passes, desc, &mut partial) {
            Ok(material) => Ok(material),
            Err(e) => {
                log::error!("Material {} failed: {e}", desc.name);
                partial.release(ctx);
                Err(e)
            }
        }
    }

    fn build(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        passes: &MaterialPasses,
        desc: &UnlitMaterialDesc,
        partial: &mut Partial,
    ) -> RenderResult<Self> {
        let texture = TextureLoader::load(ctx, &desc.texture)?;
        partial.textures.push(texture.clone());
        let sampler = ctx.create_sampler(&SamplerDesc {
            label: Some("trilinear_clamp".into()),
            ..Default::default()
        })?;
        partial.sampler = Some(sampler);

        let gbuffer = create_binding(
            ctx,
            &format!("{} unlit", desc.name),
            shaders.get(ShaderKind::Unlit)?,
            passes.gbuffer,
            passes.mesh_format,
            std::mem::size_of::<UnlitConstants>() as u64,
            &[texture.handle],
            &[sampler],
        )?;
        partial.bindings.push(gbuffer);

        log::debug!("Created unlit material {}", desc.name);
        Ok(Self {
            name: desc.name.clone(),
            texture,
            sampler,
            gbuffer,
            color: Mutex::new(desc.color),
        })
    }

    pub fn color(&self) -> Vec4 {
        *self.color.lock()
    }

    pub fn set_color(&self, color: Vec4) {
        *self.color.lock() = color;
    }

    pub fn texture(&self) -> &Texture {
        &self.texture
    }
}

impl Material for UnlitMaterial {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_passes(&self) -> PassTypeFlags {
        PassTypeFlags::GBUFFER
    }

    fn bind(
        &self,
        ctx: &mut RenderContext,
        pass: PassType,
        view: &DrawView,
        transform: &Mat4,
    ) -> RenderResult<()> {
        if pass != PassType::GBuffer {
            return Ok(());
        }
        let constants = UnlitConstants {
            mvp: view.view_projection * *transform,
            color: *self.color.lock(),
        };
        self.gbuffer.bind(ctx, &constants)
    }

    fn release(&self, ctx: &mut RenderContext) {
        self.gbuffer.release(ctx);
        ctx.destroy_sampler(self.sampler);
        ctx.destroy_texture(self.texture.handle);
    }
}

static_assertions::assert_impl_all!(UnlitMaterial: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_color_has_no_texture_file() {
        let desc = UnlitMaterialDesc::constant_color("red", Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert!(desc.texture.is_empty());
        assert_eq!(UnlitMaterialDesc::textured("sky", "sky.png").color, Vec4::ONE);
    }
}
