//! Deferred rendering pipeline
//!
//! Every frame runs the same fixed chain of passes:
//! 1. Shadow - depth of shadow casters from the sun
//! 2. G-Buffer - albedo, normal, material and depth of opaque geometry
//! 3. Deferred light - fullscreen shading into an HDR target
//! 4. Atmosphere - transmittance and sky-view lookup tables, then the sky
//!    composited behind geometry in the HDR target
//! 5. Bloom - bright pass, separable blur, upsample and composite
//! 6. Tonemap - HDR to display range
//! 7. Anti-aliasing - FXAA or passthrough
//! 8. UI - world-space debug lines and screen-space overlay
//! 9. Present - copy to the backbuffer

pub mod atmosphere_pass;
pub mod fullscreen;
pub mod gbuffer_pass;
pub mod lighting_pass;
pub mod postprocess;
pub mod present_pass;
pub mod renderer;
pub mod shadow_pass;
pub mod ui_pass;

pub use atmosphere_pass::AtmospherePass;
pub use fullscreen::FullscreenPipeline;
pub use gbuffer_pass::GBufferPass;
pub use lighting_pass::LightingPass;
pub use present_pass::PresentPass;
pub use renderer::FrameRenderer;
pub use shadow_pass::ShadowPass;
pub use ui_pass::UiPass;

use bitflags::bitflags;

use crate::backend::{
    AttachmentDesc, FramebufferDesc, FramebufferHandle, LoadOp, RenderPassDesc, RenderPassHandle,
    TextureDesc, TextureFormat, TextureHandle, Viewport,
};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};

/// Passes of the frame in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassType {
    Shadow,
    GBuffer,
    DeferredLight,
    Atmosphere,
    Bloom,
    Tonemap,
    AntiAliasing,
    Ui,
    Present,
}

bitflags! {
    /// Set of passes, e.g. the passes a material takes part in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PassTypeFlags: u32 {
        const SHADOW = 1 << 0;
        const GBUFFER = 1 << 1;
        const DEFERRED_LIGHT = 1 << 2;
        const ATMOSPHERE = 1 << 3;
        const BLOOM = 1 << 4;
        const TONEMAP = 1 << 5;
        const ANTI_ALIASING = 1 << 6;
        const UI = 1 << 7;
        const PRESENT = 1 << 8;
    }
}

impl PassType {
    /// Execution order of a frame
    pub const ORDER: [PassType; 9] = [
        PassType::Shadow,
        PassType::GBuffer,
        PassType::DeferredLight,
        PassType::Atmosphere,
        PassType::Bloom,
        PassType::Tonemap,
        PassType::AntiAliasing,
        PassType::Ui,
        PassType::Present,
    ];

    pub fn flag(&self) -> PassTypeFlags {
        match self {
            PassType::Shadow => PassTypeFlags::SHADOW,
            PassType::GBuffer => PassTypeFlags::GBUFFER,
            PassType::DeferredLight => PassTypeFlags::DEFERRED_LIGHT,
            PassType::Atmosphere => PassTypeFlags::ATMOSPHERE,
            PassType::Bloom => PassTypeFlags::BLOOM,
            PassType::Tonemap => PassTypeFlags::TONEMAP,
            PassType::AntiAliasing => PassTypeFlags::ANTI_ALIASING,
            PassType::Ui => PassTypeFlags::UI,
            PassType::Present => PassTypeFlags::PRESENT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PassType::Shadow => "Shadow Pass",
            PassType::GBuffer => "G-Buffer Pass",
            PassType::DeferredLight => "Deferred Light Pass",
            PassType::Atmosphere => "Atmosphere Pass",
            PassType::Bloom => "Bloom Pass",
            PassType::Tonemap => "Tonemap Pass",
            PassType::AntiAliasing => "Anti-Aliasing Pass",
            PassType::Ui => "UI Pass",
            PassType::Present => "Present Pass",
        }
    }
}

/// A stage of the frame renderer
///
/// Each pass also has an inherent `execute` taking the inputs it needs.
pub trait FramePass {
    fn name(&self) -> &str;

    fn pass_type(&self) -> PassType;

    /// Recreate size-dependent targets; pipelines stay valid
    fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()>;

    /// Destroy every GPU resource the pass owns
    fn release(&mut self, ctx: &mut RenderContext);
}

/// Render pass, framebuffer and attachments a pass draws into
#[derive(Debug, Clone)]
pub struct PassTarget {
    pub pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub colors: Vec<TextureHandle>,
    pub depth: Option<TextureHandle>,
    pub width: u32,
    pub height: u32,
    /// Attachments were created by this target and are destroyed with it
    owned: bool,
}

impl PassTarget {
    /// Create attachments of the given formats plus a pass and framebuffer over them
    pub fn create(
        ctx: &mut RenderContext,
        label: &str,
        width: u32,
        height: u32,
        colors: &[(&str, TextureFormat)],
        depth: Option<(&str, TextureFormat)>,
    ) -> RenderResult<Self> {
        let (width, height) = (width.max(1), height.max(1));
        let mut textures = Vec::with_capacity(colors.len());
        for (name, format) in colors {
            let desc = TextureDesc::render_target(name, width, height, *format);
            match ctx.create_texture(&desc, None) {
                Ok(texture) => textures.push(texture),
                Err(e) => {
                    textures.into_iter().for_each(|t| ctx.destroy_texture(t));
                    return Err(e);
                }
            }
        }
        let depth_texture = match depth {
            Some((name, format)) => {
                let desc = TextureDesc::render_target(name, width, height, format);
                match ctx.create_texture(&desc, None) {
                    Ok(texture) => Some(texture),
                    Err(e) => {
                        textures.into_iter().for_each(|t| ctx.destroy_texture(t));
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let pass_desc = RenderPassDesc {
            label: Some(label.to_string()),
            color_attachments: colors
                .iter()
                .map(|(_, format)| AttachmentDesc::clear_store(*format))
                .collect(),
            depth_attachment: depth.map(|(_, format)| AttachmentDesc::clear_store(format)),
            viewport: Viewport::full(width, height),
        };
        let result = Self::build(ctx, pass_desc, textures.clone(), depth_texture, width, height, true);
        if result.is_err() {
            textures
                .into_iter()
                .chain(depth_texture)
                .for_each(|t| ctx.destroy_texture(t));
        }
        result
    }

    /// Pass and framebuffer over existing color textures, loading their contents
    pub fn wrap(
        ctx: &mut RenderContext,
        label: &str,
        colors: &[TextureHandle],
        load_op: LoadOp,
    ) -> RenderResult<Self> {
        let mut attachments = Vec::with_capacity(colors.len());
        let mut extent = None;
        for texture in colors {
            let desc = ctx.texture_desc(*texture).ok_or(RenderError::InvalidHandle {
                kind: "texture",
                id: texture.id(),
            })?;
            let mut attachment = AttachmentDesc::load_store(desc.format);
            attachment.load_op = load_op;
            attachments.push(attachment);
            extent.get_or_insert((desc.width, desc.height));
        }
        let (width, height) = extent.unwrap_or((1, 1));
        let pass_desc = RenderPassDesc {
            label: Some(label.to_string()),
            color_attachments: attachments,
            depth_attachment: None,
            viewport: Viewport::full(width, height),
        };
        Self::build(ctx, pass_desc, colors.to_vec(), None, width, height, false)
    }

    fn build(
        ctx: &mut RenderContext,
        pass_desc: RenderPassDesc,
        colors: Vec<TextureHandle>,
        depth: Option<TextureHandle>,
        width: u32,
        height: u32,
        owned: bool,
    ) -> RenderResult<Self> {
        let label = pass_desc.label.clone();
        let pass = ctx.create_render_pass(&pass_desc)?;
        let framebuffer = ctx.create_framebuffer(&FramebufferDesc {
            label,
            pass,
            color_targets: colors.clone(),
            depth_target: depth,
        });
        let framebuffer = match framebuffer {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                ctx.destroy_render_pass(pass);
                return Err(e);
            }
        };
        Ok(Self {
            pass,
            framebuffer,
            colors,
            depth,
            width,
            height,
            owned,
        })
    }

    pub fn color(&self, index: usize) -> Option<TextureHandle> {
        self.colors.get(index).copied()
    }

    pub fn pass_desc<'a>(&self, ctx: &'a RenderContext) -> RenderResult<&'a RenderPassDesc> {
        ctx.render_pass_desc(self.pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: self.pass.id(),
        })
    }

    /// Begin the pass with each attachment's own clear value
    pub fn begin(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        ctx.begin_render_pass(self.pass, self.framebuffer, &[])
    }

    pub fn release(&self, ctx: &mut RenderContext) {
        ctx.destroy_framebuffer(self.framebuffer);
        ctx.destroy_render_pass(self.pass);
        if self.owned {
            for texture in self.colors.iter().chain(self.depth.iter()) {
                ctx.destroy_texture(*texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn context() -> RenderContext {
        RenderContext::new(Box::new(HeadlessBackend::new(32, 32)), env!("CARGO_MANIFEST_DIR")).unwrap()
    }

    #[test]
    fn pass_flags_are_distinct() {
        let all = PassType::ORDER
            .iter()
            .fold(PassTypeFlags::empty(), |acc, p| acc | p.flag());
        assert_eq!(all, PassTypeFlags::all());
    }

    #[test]
    fn target_release_destroys_owned_textures() {
        let mut ctx = context();
        let target = PassTarget::create(
            &mut ctx,
            "test",
            16,
            8,
            &[("color", TextureFormat::Rgba8Unorm)],
            Some(("depth", TextureFormat::Depth32Float)),
        )
        .unwrap();
        assert_eq!(ctx.texture_count(), 2);
        target.release(&mut ctx);
        assert_eq!(ctx.texture_count(), 0);
    }

    #[test]
    fn wrapped_target_keeps_textures() {
        let mut ctx = context();
        let texture = ctx
            .create_texture(&TextureDesc::render_target("aa", 8, 8, TextureFormat::Rgba8Unorm), None)
            .unwrap();
        let target = PassTarget::wrap(&mut ctx, "ui", &[texture], LoadOp::Load).unwrap();
        assert_eq!((target.width, target.height), (8, 8));
        assert_eq!(
            target.pass_desc(&ctx).unwrap().color_attachments[0].load_op,
            LoadOp::Load
        );
        target.release(&mut ctx);
        assert_eq!(ctx.texture_count(), 1);
    }
}
