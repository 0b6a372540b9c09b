//! G-Buffer generation pass for deferred rendering
//!
//! Renders geometry to multiple render targets (MRT):
//! - Albedo (base color)
//! - World-space normals (encoded)
//! - Material properties (roughness, metallic)
//! - Depth buffer

use crate::backend::{PrimitiveTopologyType, TextureFormat, TextureHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::resources::{DrawView, Material, VertexFormat};
use crate::scene::FrameParams;

use super::{FramePass, PassTarget, PassType};

/// G-Buffer generation pass for deferred rendering
pub struct GBufferPass {
    target: PassTarget,
    /// Stride every drawn geometry must have
    mesh_stride: u32,
}

impl GBufferPass {
    pub fn new(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<Self> {
        Ok(Self {
            target: Self::create_target(ctx, width, height)?,
            mesh_stride: VertexFormat::mesh().finalize(),
        })
    }

    fn create_target(ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<PassTarget> {
        PassTarget::create(
            ctx,
            PassType::GBuffer.name(),
            width,
            height,
            &[
                ("gbuffer_albedo", TextureFormat::Rgba8Unorm),
                // float for better normal precision
                ("gbuffer_normal", TextureFormat::Rgba16Float),
                ("gbuffer_material", TextureFormat::Rgba8Unorm),
            ],
            Some(("gbuffer_depth", TextureFormat::Depth32Float)),
        )
    }

    pub fn target(&self) -> &PassTarget {
        &self.target
    }

    /// Albedo, normal, material and depth, in the order the lighting pass binds them
    pub fn textures(&self) -> Vec<TextureHandle> {
        self.target
            .colors
            .iter()
            .copied()
            .chain(self.target.depth)
            .collect()
    }

    pub fn execute(
        &self,
        ctx: &mut RenderContext,
        frame: &FrameParams,
        default_material: &dyn Material,
    ) -> RenderResult<()> {
        self.target.begin(ctx)?;
        let result = self.draw_opaque(ctx, frame, default_material);
        ctx.end_render_pass()?;
        result
    }

    fn draw_opaque(
        &self,
        ctx: &mut RenderContext,
        frame: &FrameParams,
        default_material: &dyn Material,
    ) -> RenderResult<()> {
        let view = DrawView::new(frame.view_projection(), frame.eye);
        let draws = frame.static_draws.lock();
        for draw in draws.iter() {
            if draw.topology.topology_type() != PrimitiveTopologyType::Triangle {
                log::trace!("Skipping non-triangle draw {}", draw.name);
                continue;
            }
            if draw.geometry.stride != self.mesh_stride {
                log::trace!(
                    "Skipping draw {}: stride {} is not the mesh layout",
                    draw.name,
                    draw.geometry.stride
                );
                continue;
            }
            let material = draw.material.as_deref().unwrap_or(default_material);
            if !material.supports_pass(PassType::GBuffer) {
                continue;
            }
            material.bind(ctx, PassType::GBuffer, &view, &draw.transform)?;
            ctx.draw(&draw.geometry.draw_command())?;
        }
        Ok(())
    }
}

impl FramePass for GBufferPass {
    fn name(&self) -> &str {
        PassType::GBuffer.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::GBuffer
    }

    fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        let target = Self::create_target(ctx, width, height)?;
        self.target.release(ctx);
        self.target = target;
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.target.release(ctx);
    }
}
