//! Materials
//!
//! A material owns the pipelines, constant buffers and resource tables it
//! needs for each pass it takes part in, and binds them for one draw.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::{
    BufferHandle, BufferUsage, DepthStencilDesc, PipelineHandle, PipelineStateDesc,
    RenderPassHandle, ResourceLayout, ResourceTableHandle, SamplerDesc, SamplerHandle,
    VertexFormatHandle,
};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{PassType, PassTypeFlags};

use super::{ShaderKind, ShaderTable, Texture, TextureData, TextureLoader};

/// Camera a draw is seen from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawView {
    pub view_projection: Mat4,
    /// World-space eye position
    pub eye: Vec3,
}

impl DrawView {
    pub fn new(view_projection: Mat4, eye: Vec3) -> Self {
        Self { view_projection, eye }
    }
}

/// Binds the state a draw needs in one pass
pub trait Material: Send + Sync {
    fn name(&self) -> &str;

    fn supported_passes(&self) -> PassTypeFlags;

    fn supports_pass(&self, pass: PassType) -> bool {
        self.supported_passes().contains(pass.flag())
    }

    /// Set pipeline, upload per-draw constants and bind tables for `pass`
    ///
    /// Passes the material does not take part in are a silent no-op.
    fn bind(
        &self,
        ctx: &mut RenderContext,
        pass: PassType,
        view: &DrawView,
        transform: &Mat4,
    ) -> RenderResult<()>;

    /// Destroy every GPU resource owned by the material
    fn release(&self, ctx: &mut RenderContext);
}

/// Passes and vertex format materials build their pipelines against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialPasses {
    pub shadow: RenderPassHandle,
    pub gbuffer: RenderPassHandle,
    pub mesh_format: VertexFormatHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(super) struct ShadowConstants {
    pub light_mvp: Mat4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ObjectConstants {
    mvp: Mat4,
    model: Mat4,
    normal_matrix: Mat4,
    tint: Vec4,
    /// x = roughness, y = metallic
    params: Vec4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ObjectConstants>(), 224);

/// Pipeline plus the table and constants it is drawn with
#[derive(Debug, Clone, Copy)]
pub(super) struct PassBinding {
    pub pipeline: PipelineHandle,
    pub constants: BufferHandle,
    pub table: ResourceTableHandle,
}

impl PassBinding {
    /// Set the pipeline, upload `constants` and bind the table
    pub fn bind<T: Pod>(&self, ctx: &mut RenderContext, constants: &T) -> RenderResult<()> {
        ctx.set_pipeline(self.pipeline)?;
        ctx.update_buffer(self.constants, 0, bytemuck::bytes_of(constants))?;
        ctx.bind_resource_table(self.table)
    }

    pub fn release(&self, ctx: &mut RenderContext) {
        ctx.destroy_resource_table(self.table);
        ctx.destroy_buffer(self.constants);
        ctx.destroy_pipeline(self.pipeline);
    }
}

/// Surface parameters that may change while the material is in use
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceParams {
    pub tint: Vec4,
    pub roughness: f32,
    pub metallic: f32,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            tint: Vec4::ONE,
            roughness: 0.5,
            metallic: 0.0,
        }
    }
}

/// Description of a [`GBufferMaterial`]
#[derive(Debug, Clone)]
pub struct GBufferMaterialDesc {
    pub name: String,
    /// Albedo file under `data/textures/`; empty uses plain white
    pub albedo: String,
    pub params: SurfaceParams,
    pub casts_shadow: bool,
}

impl Default for GBufferMaterialDesc {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            albedo: String::new(),
            params: SurfaceParams::default(),
            casts_shadow: true,
        }
    }
}

impl GBufferMaterialDesc {
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

    pub fn with_tint(mut self, tint: Vec4) -> Self {
        self.params.tint = tint;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.params.roughness = roughness;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.params.metallic = metallic;
        self
    }

    pub fn with_shadow(mut self, casts_shadow: bool) -> Self {
        self.casts_shadow = casts_shadow;
        self
    }
}

/// Opaque surface drawn into the gbuffer and, optionally, the shadow map
pub struct GBufferMaterial {
    name: String,
    albedo: Texture,
    material_map: Texture,
    sampler: SamplerHandle,
    shadow: Option<PassBinding>,
    gbuffer: PassBinding,
    params: Mutex<SurfaceParams>,
}

/// Everything created so far, destroyed if a later step fails
#[derive(Default)]
pub(super) struct Partial {
    pub textures: Vec<Texture>,
    pub sampler: Option<SamplerHandle>,
    pub bindings: Vec<PassBinding>,
}

impl Partial {
    pub fn release(self, ctx: &mut RenderContext) {
        for binding in &self.bindings {
            binding.release(ctx);
        }
        if let Some(sampler) = self.sampler {
            ctx.destroy_sampler(sampler);
        }
        for texture in self.textures {
            texture.release(ctx);
        }
    }
}

impl GBufferMaterial {
    pub fn new(
        ctx: &mut RenderContext,
        shaders: &ShaderTable,
        passes: &MaterialPasses,
        desc: &GBufferMaterialDesc,
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
        desc: &GBufferMaterialDesc,
        partial: &mut Partial,
    ) -> RenderResult<Self> {
        let albedo = TextureLoader::load(ctx, &desc.albedo)?;
        partial.textures.push(albedo.clone());
        let material_map = TextureData::default_material().upload(ctx)?;
        partial.textures.push(material_map.clone());
        let sampler = ctx.create_sampler(&SamplerDesc::linear_wrap())?;
        partial.sampler = Some(sampler);

        let shadow = if desc.casts_shadow {
            let binding = create_binding(
                ctx,
                &format!("{} shadow", desc.name),
                shaders.get(ShaderKind::Shadow)?,
                passes.shadow,
                passes.mesh_format,
                std::mem::size_of::<ShadowConstants>() as u64,
                &[],
                &[],
            )?;
            partial.bindings.push(binding);
            Some(binding)
        } else {
            None
        };

        let gbuffer = create_binding(
            ctx,
            &format!("{} gbuffer", desc.name),
            shaders.get(ShaderKind::GBuffer)?,
            passes.gbuffer,
            passes.mesh_format,
            std::mem::size_of::<ObjectConstants>() as u64,
            &[albedo.handle, material_map.handle],
            &[sampler, sampler],
        )?;
        partial.bindings.push(gbuffer);

        log::debug!("Created material {}", desc.name);
        Ok(Self {
            name: desc.name.clone(),
            albedo,
            material_map,
            sampler,
            shadow,
            gbuffer,
            params: Mutex::new(desc.params),
        })
    }

    pub fn params(&self) -> SurfaceParams {
        *self.params.lock()
    }

    pub fn set_params(&self, params: SurfaceParams) {
        *self.params.lock() = params;
    }

    pub fn casts_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn albedo(&self) -> &Texture {
        &self.albedo
    }
}

/// Pipeline, constant buffer and table for one pass
#[allow(clippy::too_many_arguments)]
pub(super) fn create_binding(
    ctx: &mut RenderContext,
    label: &str,
    shader: crate::backend::ShaderHandle,
    pass: RenderPassHandle,
    vertex_format: VertexFormatHandle,
    constants_size: u64,
    textures: &[crate::backend::TextureHandle],
    samplers: &[SamplerHandle],
) -> RenderResult<PassBinding> {
    let pass_desc = ctx
        .render_pass_desc(pass)
        .cloned()
        .ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: pass.id(),
        })?;
    let mut desc = PipelineStateDesc::for_pass(label, shader, &pass_desc);
    desc.vertex_format = Some(vertex_format);
    desc.depth_stencil = DepthStencilDesc::read_write();
    desc.resource_layout = ResourceLayout::new(1, textures.len() as u32, 0);
    let pipeline = ctx.create_pipeline(&desc, pass)?;

    let constants = match ctx.create_buffer(
        1,
        constants_size,
        BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        label,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            ctx.destroy_pipeline(pipeline);
            return Err(e);
        }
    };

    let table = ctx.create_resource_table().and_then(|table| {
        let filled = ctx.set_constant_buffers(table, &[constants]).and_then(|_| {
            if textures.is_empty() {
                Ok(())
            } else {
                ctx.set_textures(table, textures, samplers)
            }
        });
        match filled {
            Ok(()) => Ok(table),
            Err(e) => {
                ctx.destroy_resource_table(table);
                Err(e)
            }
        }
    });
    match table {
        Ok(table) => Ok(PassBinding {
            pipeline,
            constants,
            table,
        }),
        Err(e) => {
            ctx.destroy_buffer(constants);
            ctx.destroy_pipeline(pipeline);
            Err(e)
        }
    }
}

impl Material for GBufferMaterial {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_passes(&self) -> PassTypeFlags {
        if self.shadow.is_some() {
            PassTypeFlags::SHADOW | PassTypeFlags::GBUFFER
        } else {
            PassTypeFlags::GBUFFER
        }
    }

    fn bind(
        &self,
        ctx: &mut RenderContext,
        pass: PassType,
        view: &DrawView,
        transform: &Mat4,
    ) -> RenderResult<()> {
        match pass {
            PassType::Shadow => {
                let Some(binding) = self.shadow else {
                    return Ok(());
                };
                binding.bind(
                    ctx,
                    &ShadowConstants {
                        light_mvp: view.view_projection * *transform,
                    },
                )
            }
            PassType::GBuffer => {
                let params = *self.params.lock();
                let constants = ObjectConstants {
                    mvp: view.view_projection * *transform,
                    model: *transform,
                    normal_matrix: transform.inverse().transpose(),
                    tint: params.tint,
                    params: Vec4::new(params.roughness, params.metallic, 0.0, 0.0),
                };
                self.gbuffer.bind(ctx, &constants)
            }
            _ => Ok(()),
        }
    }

    fn release(&self, ctx: &mut RenderContext) {
        if let Some(shadow) = &self.shadow {
            shadow.release(ctx);
        }
        self.gbuffer.release(ctx);
        ctx.destroy_sampler(self.sampler);
        ctx.destroy_texture(self.albedo.handle);
        ctx.destroy_texture(self.material_map.handle);
    }
}

static_assertions::assert_impl_all!(GBufferMaterial: Send, Sync);
