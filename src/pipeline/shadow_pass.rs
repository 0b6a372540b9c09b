//! Shadow map pass
//!
//! Renders the depth of every shadow-casting static draw from the sun's
//! point of view. The map is cleared every frame, so without a sun it reads
//! as fully lit.

use crate::backend::{PrimitiveTopologyType, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::resources::{DrawView, Material};
use crate::scene::FrameParams;

use super::{FramePass, PassTarget, PassType};

pub struct ShadowPass {
    target: PassTarget,
    size: u32,
}

impl ShadowPass {
    pub fn new(ctx: &mut RenderContext, size: u32) -> RenderResult<Self> {
        let size = size.max(1);
        let target = Self::create_target(ctx, size)?;
        log::debug!("Shadow map {size}x{size}");
        Ok(Self { target, size })
    }

    fn create_target(ctx: &mut RenderContext, size: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            PassType::Shadow.name(),
            size,
            size,
            &[],
            Some(("shadow_map", TextureFormat::Depth32Float)),
        )
    }

    pub fn shadow_map(&self) -> Option<TextureHandle> {
        self.target.depth
    }

    pub fn target(&self) -> &PassTarget {
        &self.target
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn execute(
        &self,
        ctx: &mut RenderContext,
        frame: &FrameParams,
        default_material: &dyn Material,
    ) -> RenderResult<()> {
        self.target.begin(ctx)?;
        let result = self.draw_casters(ctx, frame, default_material);
        ctx.end_render_pass()?;
        result
    }

    fn draw_casters(
        &self,
        ctx: &mut RenderContext,
        frame: &FrameParams,
        default_material: &dyn Material,
    ) -> RenderResult<()> {
        let Some(sun) = frame.sun() else {
            return Ok(());
        };
        let view = DrawView::new(sun.view_projection, frame.eye);
        let draws = frame.static_draws.lock();
        for draw in draws.iter() {
            if draw.topology.topology_type() != PrimitiveTopologyType::Triangle {
                continue;
            }
            let material = draw.material.as_deref().unwrap_or(default_material);
            if !material.supports_pass(PassType::Shadow) {
                continue;
            }
            material.bind(ctx, PassType::Shadow, &view, &draw.transform)?;
            ctx.draw(&draw.geometry.draw_command())?;
        }
        Ok(())
    }
}

impl FramePass for ShadowPass {
    fn name(&self) -> &str {
        PassType::Shadow.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Shadow
    }

    /// The shadow map does not follow the window size
    fn resize(&mut self, _ctx: &mut RenderContext, _width: u32, _height: u32) -> RenderResult<()> {
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.target.release(ctx);
    }
}
