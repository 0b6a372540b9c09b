//! Frame renderer
//!
//! Owns every pass of the deferred chain and wires each pass's output into
//! the next one's input.

use std::sync::Arc;

use crate::backend::{TextureHandle, VertexFormatHandle};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{GBufferMaterial, GBufferMaterialDesc, Material, MaterialPasses, ShaderTable, VertexFormat};
use crate::scene::FrameParams;
use crate::EngineConfig;

use super::postprocess::{AntiAliasingPass, BloomPass, TonemapPass};
use super::{
    AtmospherePass, FramePass, GBufferPass, LightingPass, PassType, PresentPass, ShadowPass, UiPass,
};

fn output_of(pass: PassType, texture: Option<TextureHandle>) -> RenderResult<TextureHandle> {
    texture.ok_or_else(|| RenderError::usage(format!("{} has no output", pass.name())))
}

/// Runs shadow, gbuffer, lighting, atmosphere, bloom, tonemap,
/// anti-aliasing, UI and present, in that order, once per frame
pub struct FrameRenderer {
    shadow: ShadowPass,
    gbuffer: GBufferPass,
    lighting: LightingPass,
    atmosphere: AtmospherePass,
    bloom: BloomPass,
    tonemap: TonemapPass,
    anti_aliasing: AntiAliasingPass,
    ui: UiPass,
    present: PresentPass,
    mesh_format: VertexFormatHandle,
    default_material: Arc<GBufferMaterial>,
    width: u32,
    height: u32,
}

impl FrameRenderer {
    pub fn new(ctx: &mut RenderContext, config: &EngineConfig, shaders: &ShaderTable) -> RenderResult<Self> {
        let (width, height) = ctx.surface_size();
        let mut mesh = VertexFormat::mesh();
        let mesh_format = ctx.create_vertex_format(&mut mesh)?;

        let shadow = ShadowPass::new(ctx, config.shadow_map_size)?;
        let gbuffer = GBufferPass::new(ctx, width, height)?;
        let inputs = lighting_inputs(&shadow, &gbuffer)?;
        let lighting = LightingPass::new(ctx, shaders, width, height, &inputs)?;
        let hdr = output_of(PassType::DeferredLight, lighting.hdr_output())?;
        let atmosphere = AtmospherePass::new(ctx, shaders, hdr, inputs[GBUFFER_DEPTH])?;
        let bloom = BloomPass::new(ctx, shaders, config.bloom, hdr, width, height)?;
        let bloomed = output_of(PassType::Bloom, bloom.output())?;
        let tonemap = TonemapPass::new(ctx, shaders, config.tonemap, bloomed, width, height)?;
        let ldr = output_of(PassType::Tonemap, tonemap.output())?;
        let anti_aliasing = AntiAliasingPass::new(ctx, shaders, config.anti_aliasing, ldr, width, height)?;
        let resolved = output_of(PassType::AntiAliasing, anti_aliasing.output())?;
        let ui = UiPass::new(ctx, shaders, resolved)?;
        let present = PresentPass::new(ctx, shaders, resolved)?;

        let passes = MaterialPasses {
            shadow: shadow.target().pass,
            gbuffer: gbuffer.target().pass,
            mesh_format,
        };
        let default_material = Arc::new(GBufferMaterial::new(
            ctx,
            shaders,
            &passes,
            &GBufferMaterialDesc::default(),
        )?);

        log::info!("Frame renderer ready at {width}x{height}");
        Ok(Self {
            shadow,
            gbuffer,
            lighting,
            atmosphere,
            bloom,
            tonemap,
            anti_aliasing,
            ui,
            present,
            mesh_format,
            default_material,
            width,
            height,
        })
    }

    /// Render one frame; must be called between begin_frame and end_frame
    pub fn render(&self, ctx: &mut RenderContext, frame: &FrameParams) -> RenderResult<()> {
        let default_material: &dyn Material = self.default_material.as_ref();
        for pass in PassType::ORDER {
            match pass {
                PassType::Shadow => self.shadow.execute(ctx, frame, default_material)?,
                PassType::GBuffer => self.gbuffer.execute(ctx, frame, default_material)?,
                PassType::DeferredLight => self.lighting.execute(ctx, frame)?,
                PassType::Atmosphere => self.atmosphere.execute(ctx, frame)?,
                PassType::Bloom => self.bloom.execute(ctx)?,
                PassType::Tonemap => self.tonemap.execute(ctx)?,
                PassType::AntiAliasing => self.anti_aliasing.execute(ctx)?,
                PassType::Ui => self.ui.execute(ctx, frame)?,
                PassType::Present => self.present.execute(ctx)?,
            }
        }
        Ok(())
    }

    /// Recreate size-dependent targets and rebind every consumer
    pub fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        for pass in self.passes_mut() {
            pass.resize(ctx, width, height)?;
        }

        let inputs = lighting_inputs(&self.shadow, &self.gbuffer)?;
        self.lighting.set_inputs(ctx, &inputs)?;
        let hdr = output_of(PassType::DeferredLight, self.lighting.hdr_output())?;
        self.atmosphere.set_scene(ctx, hdr, inputs[GBUFFER_DEPTH])?;
        self.bloom.set_scene(ctx, hdr)?;
        let bloomed = output_of(PassType::Bloom, self.bloom.output())?;
        self.tonemap.set_input(ctx, bloomed)?;
        let ldr = output_of(PassType::Tonemap, self.tonemap.output())?;
        self.anti_aliasing.set_input(ctx, ldr)?;
        let resolved = output_of(PassType::AntiAliasing, self.anti_aliasing.output())?;
        self.ui.set_target(ctx, resolved)?;
        self.present.set_input(ctx, resolved)?;

        self.width = width;
        self.height = height;
        log::debug!("Frame renderer resized to {width}x{height}");
        Ok(())
    }

    fn passes_mut(&mut self) -> [&mut dyn FramePass; 9] {
        [
            &mut self.shadow,
            &mut self.gbuffer,
            &mut self.lighting,
            &mut self.atmosphere,
            &mut self.bloom,
            &mut self.tonemap,
            &mut self.anti_aliasing,
            &mut self.ui,
            &mut self.present,
        ]
    }

    /// Passes new materials build against; changes after a resize
    pub fn material_passes(&self) -> MaterialPasses {
        MaterialPasses {
            shadow: self.shadow.target().pass,
            gbuffer: self.gbuffer.target().pass,
            mesh_format: self.mesh_format,
        }
    }

    pub fn default_material(&self) -> Arc<dyn Material> {
        self.default_material.clone()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn shadow(&self) -> &ShadowPass {
        &self.shadow
    }

    pub fn gbuffer(&self) -> &GBufferPass {
        &self.gbuffer
    }

    pub fn lighting(&self) -> &LightingPass {
        &self.lighting
    }

    pub fn atmosphere(&self) -> &AtmospherePass {
        &self.atmosphere
    }

    pub fn bloom(&self) -> &BloomPass {
        &self.bloom
    }

    pub fn tonemap(&self) -> &TonemapPass {
        &self.tonemap
    }

    pub fn anti_aliasing(&self) -> &AntiAliasingPass {
        &self.anti_aliasing
    }

    pub fn ui(&self) -> &UiPass {
        &self.ui
    }

    /// Textures every pass writes, in pass order, excluding the backbuffer
    pub fn intermediate_targets(&self) -> Vec<TextureHandle> {
        let mut textures: Vec<TextureHandle> = self.shadow.shadow_map().into_iter().collect();
        textures.extend(self.gbuffer.textures());
        textures.extend(self.lighting.hdr_output());
        textures.extend(self.atmosphere.lookup_tables());
        textures.extend(self.bloom.output());
        textures.extend(self.tonemap.output());
        textures.extend(self.anti_aliasing.output());
        textures
    }

    pub fn release(&mut self, ctx: &mut RenderContext) {
        self.default_material.release(ctx);
        for pass in self.passes_mut().into_iter().rev() {
            pass.release(ctx);
        }
        log::debug!("Frame renderer released");
    }
}

/// Index of the gbuffer depth in the lighting inputs
const GBUFFER_DEPTH: usize = 3;

fn lighting_inputs(shadow: &ShadowPass, gbuffer: &GBufferPass) -> RenderResult<[TextureHandle; 5]> {
    let textures = gbuffer.textures();
    let shadow_map = output_of(PassType::Shadow, shadow.shadow_map())?;
    match textures.as_slice() {
        [albedo, normal, material, depth] => Ok([*albedo, *normal, *material, *depth, shadow_map]),
        _ => Err(RenderError::usage("gbuffer must have three colors and a depth target")),
    }
}
