//! Parallax occlusion mapped surfaces
//!
//! The height field lives in the alpha channel of the normal map. The
//! gbuffer shader marches the view ray through it in tangent space before
//! sampling albedo and normal.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use parking_lot::Mutex;

use crate::backend::{SamplerDesc, SamplerHandle, TextureFormat};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::pipeline::{PassType, PassTypeFlags};

use super::material::{create_binding, PassBinding, Partial, ShadowConstants};
use super::{
    DrawView, Material, MaterialPasses, ShaderKind, ShaderTable, Texture, TextureData,
    TextureLoader,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ParallaxConstants {
    mvp: Mat4,
    model: Mat4,
    normal_matrix: Mat4,
    /// World-space eye, w unused
    eye: Vec4,
    tint: Vec4,
    /// x = height scale, y = roughness, z = metallic, w = max layers
    params: Vec4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ParallaxConstants>(), 240);

/// Surface parameters of a [`ParallaxOcclusionMaterial`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParallaxParams {
    pub tint: Vec4,
    /// Depth of the height field in uv units
    pub height_scale: f32,
    pub roughness: f32,
    pub metallic: f32,
    /// Ray march steps at grazing angles
    pub max_layers: u32,
}

impl Default for ParallaxParams {
    fn default() -> Self {
        Self {
            tint: Vec4::ONE,
            height_scale: 0.05,
            roughness: 0.8,
            metallic: 0.0,
            max_layers: 32,
        }
    }
}

impl ParallaxParams {
    pub const MAX_LAYERS: u32 = 64;

    fn clamped(mut self) -> Self {
        self.height_scale = self.height_scale.clamp(0.0, 0.5);
        self.max_layers = self.max_layers.clamp(1, Self::MAX_LAYERS);
        self
    }
}

/// Description of a [`ParallaxOcclusionMaterial`]
#[derive(Debug, Clone, Default)]
pub struct ParallaxMaterialDesc {
    pub name: String,
    /// Albedo file under `data/textures/`; empty uses plain white
    pub albedo: String,
    /// Tangent-space normals in rgb, height in alpha; empty is a flat surface
    pub normal_height: String,
    pub params: ParallaxParams,
}

impl ParallaxMaterialDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_albedo(mut self, albedo: impl Into<String>) -> Self {
        self.albedo = albedo.into();
        self
    }

    pub fn with_normal_height(mut self, normal_height: impl Into<String>) -> Self {
        self.normal_height = normal_height.into();
        self
    }

    pub fn with_height_scale(mut self, height_scale: f32) -> Self {
        self.params.height_scale = height_scale;
        self
    }
}

/// Opaque surface with self-occluding relief
pub struct ParallaxOcclusionMaterial {
    name: String,
    albedo: Texture,
    normal_height: Texture,
    sampler: SamplerHandle,
    shadow: PassBinding,
    gbuffer: PassBinding,
    params: Mutex<ParallaxParams>,
}

/// Normal maps hold vectors, not colors
fn load_normal_height(ctx: &mut RenderContext, filename: &str) -> RenderResult<Texture> {
    if filename.is_empty() {
        return TextureData::flat_normal().upload(ctx);
    }
    let path = TextureLoader::resolve(ctx.root_path(), filename);
    let mut data = TextureData::from_file(&path).inspect_err(|e| {
        log::warn!("Normal map {filename} not loaded: {e}");
    })?;
    data.format = TextureFormat::Rgba8Unorm;
    data.upload(ctx)
}

impl ParallaxOcclusionMaterial {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        passes: &MaterialPasses,
        desc: &ParallaxMaterialDesc,
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
        desc: &ParallaxMaterialDesc,
        partial: &mut Partial,
    ) -> RenderResult<Self> {
        let albedo = TextureLoader::load(ctx, &desc.albedo)?;
        partial.textures.push(albedo.clone());
        let normal_height = load_normal_height(ctx, &desc.normal_height)?;
        partial.textures.push(normal_height.clone());
        let sampler = ctx.create_sampler(&SamplerDesc::linear_wrap())?;
        partial.sampler = Some(sampler);

        let shadow = create_binding(
            ctx,
            &format!("{} shadow", desc.name),
            shaders.get(ShaderKind::Shadow)?,
            passes.shadow,
            passes.mesh_format,
            std::mem::size_of::<ShadowConstants>() as u64,
            &[],
            &[],
        )?;
        partial.bindings.push(shadow);

        let gbuffer = create_binding(
            ctx,
            &format!("{} parallax", desc.name),
            shaders.get(ShaderKind::ParallaxOcclusion)?,
            passes.gbuffer,
            passes.mesh_format,
            std::mem::size_of::<ParallaxConstants>() as u64,
            &[albedo.handle, normal_height.handle],
            &[sampler, sampler],
        )?;
        partial.bindings.push(gbuffer);

        log::debug!("Created parallax material {}", desc.name);
        Ok(Self {
            name: desc.name.clone(),
            albedo,
            normal_height,
            sampler,
            shadow,
            gbuffer,
            params: Mutex::new(desc.params.clamped()),
        })
    }

    pub fn params(&self) -> ParallaxParams {
        *self.params.lock()
    }

    pub fn set_params(&self, params: ParallaxParams) {
        *self.params.lock() = params.clamped();
    }

    pub fn albedo(&self) -> &Texture {
        &self.albedo
    }

    pub fn normal_height(&self) -> &Texture {
        &self.normal_height
    }
}

impl Material for ParallaxOcclusionMaterial {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_passes(&self) -> PassTypeFlags {
        PassTypeFlags::SHADOW | PassTypeFlags::GBUFFER
    }

    fn bind(
        &self,
        ctx: &mut RenderContext,
        pass: PassType,
        view: &DrawView,
        transform: &Mat4,
    ) -> RenderResult<()> {
        match pass {
            PassType::Shadow => self.shadow.bind(
                ctx,
                &ShadowConstants {
                    light_mvp: view.view_projection * *transform,
                },
            ),
            PassType::GBuffer => {
                let params = *self.params.lock();
                let constants = ParallaxConstants {
                    mvp: view.view_projection * *transform,
                    model: *transform,
                    normal_matrix: transform.inverse().transpose(),
                    eye: view.eye.extend(1.0),
                    tint: params.tint,
                    params: Vec4::new(
                        params.height_scale,
                        params.roughness,
                        params.metallic,
                        params.max_layers as f32,
                    ),
                };
                self.gbuffer.bind(ctx, &constants)
            }
            _ => Ok(()),
        }
    }

    fn release(&self, ctx: &mut RenderContext) {
        self.shadow.release(ctx);
        self.gbuffer.release(ctx);
        ctx.destroy_sampler(self.sampler);
        ctx.destroy_texture(self.albedo.handle);
        ctx.destroy_texture(self.normal_height.handle);
    }
}

static_assertions::assert_impl_all!(ParallaxOcclusionMaterial: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_clamped_to_a_bounded_march() {
        let params = ParallaxParams {
            height_scale: 3.0,
            max_layers: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(params.height_scale, 0.5);
        assert_eq!(params.max_layers, 1);
        let deep = ParallaxParams {
            max_layers: 1000,
            ..Default::default()
        };
        assert_eq!(deep.clamped().max_layers, ParallaxParams::MAX_LAYERS);
    }
}
