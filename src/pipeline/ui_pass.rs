//! UI pass
//!
//! Draws inline colored geometry on top of the anti-aliased image: first
//! the frame's dynamic draws with the camera, then the GUI draws in screen
//! pixels with the origin in the top-left corner.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    clip_space_correction, BlendDesc, BlendState, BufferHandle, BufferUsage, LoadOp,
    PipelineHandle, PipelineStateDesc, PrimitiveTopology, PrimitiveTopologyType, RasterizerDesc,
    ResourceLayout, ResourceTableHandle, ShaderHandle, TextureHandle, VertexFormatHandle,
};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::resources::{ShaderKind, ShaderTable, VertexFormat};
use crate::scene::{DynamicDrawCall, FrameParams};
use crate::BackendType;

use super::{FramePass, PassTarget, PassType};

const GUI_NEAR: f32 = 0.1;
const GUI_FAR: f32 = 10_000.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ColorConstants {
    pub view_projection: Mat4,
    pub model: Mat4,
    pub color: Vec4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ColorConstants>(), 144);

/// Screen-space projection for GUI geometry given in pixels
///
/// x grows right and y grows down from the top-left corner; the geometry
/// sits one unit in front of the camera.
pub fn gui_projection(width: u32, height: u32, backend: BackendType) -> Mat4 {
    let ortho = Mat4::orthographic_rh(
        0.0,
        width.max(1) as f32,
        height.max(1) as f32,
        0.0,
        GUI_NEAR,
        GUI_FAR,
    );
    clip_space_correction(backend) * ortho * Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0))
}

pub struct UiPass {
    target: PassTarget,
    vertex_format: VertexFormatHandle,
    stride: u32,
    lines: PipelineHandle,
    triangles: PipelineHandle,
    constants: BufferHandle,
    table: ResourceTableHandle,
}

impl UiPass {
    /// Draws into `color`, keeping its contents
    pub fn new(ctx: &mut RenderContext, shaders: &ShaderTable, color: TextureHandle) -> RenderResult<Self> {
        let shader = shaders.get(ShaderKind::ConstantColor)?;
        let mut format = VertexFormat::position_color();
        let vertex_format = ctx.create_vertex_format(&mut format)?;
        let target = PassTarget::wrap(ctx, PassType::Ui.name(), &[color], LoadOp::Load)?;

        let lines = match Self::create_pipeline(ctx, shader, &target, vertex_format, PrimitiveTopology::LineList) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                target.release(ctx);
                return Err(e);
            }
        };
        let triangles =
            match Self::create_pipeline(ctx, shader, &target, vertex_format, PrimitiveTopology::TriangleList) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    ctx.destroy_pipeline(lines);
                    target.release(ctx);
                    return Err(e);
                }
            };

        let constants = ctx.create_buffer(
            1,
            std::mem::size_of::<ColorConstants>() as u64,
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            "ui constants",
        );
        let table = constants.and_then(|constants| {
            let table = ctx.create_resource_table()?;
            match ctx.set_constant_buffers(table, &[constants]) {
                Ok(()) => Ok((constants, table)),
                Err(e) => {
                    ctx.destroy_resource_table(table);
                    ctx.destroy_buffer(constants);
                    Err(e)
                }
            }
        });
        let (constants, table) = match table {
            Ok(pair) => pair,
            Err(e) => {
                ctx.destroy_pipeline(triangles);
                ctx.destroy_pipeline(lines);
                target.release(ctx);
                return Err(e);
            }
        };

        Ok(Self {
            target,
            vertex_format,
            stride: format.stride(),
            lines,
            triangles,
            constants,
            table,
        })
    }

    fn create_pipeline(
        ctx: &mut RenderContext,
        shader: ShaderHandle,
        target: &PassTarget,
        vertex_format: VertexFormatHandle,
        topology: PrimitiveTopology,
    ) -> RenderResult<PipelineHandle> {
        let pass_desc = target.pass_desc(ctx)?.clone();
        let label = match topology.topology_type() {
            PrimitiveTopologyType::Line => "UI Lines",
            _ => "UI Triangles",
        };
        let mut desc = PipelineStateDesc::for_pass(label, shader, &pass_desc);
        desc.vertex_format = Some(vertex_format);
        desc.topology = topology;
        desc.rasterizer = RasterizerDesc::no_cull();
        desc.blend = BlendDesc {
            blend: Some(BlendState::alpha_blending()),
            ..Default::default()
        };
        desc.resource_layout = ResourceLayout::new(1, 0, 0);
        ctx.create_pipeline(&desc, target.pass)
    }

    pub fn vertex_format(&self) -> VertexFormatHandle {
        self.vertex_format
    }

    /// Point the pass at a new color texture, e.g. after a resize
    pub fn set_target(&mut self, ctx: &mut RenderContext, color: TextureHandle) -> RenderResult<()> {
        let target = PassTarget::wrap(ctx, PassType::Ui.name(), &[color], LoadOp::Load)?;
        self.target.release(ctx);
        self.target = target;
        Ok(())
    }

    pub fn execute(&self, ctx: &mut RenderContext, frame: &FrameParams) -> RenderResult<()> {
        self.target.begin(ctx)?;
        let result = self.draw_lists(ctx, frame);
        ctx.end_render_pass()?;
        result
    }

    fn draw_lists(&self, ctx: &mut RenderContext, frame: &FrameParams) -> RenderResult<()> {
        let world = frame.view_projection();
        for draw in frame.dynamic_draws.lock().iter() {
            self.draw_one(ctx, &world, draw)?;
        }

        let screen = gui_projection(self.target.width, self.target.height, frame.backend);
        for draw in frame.gui_draws.lock().iter() {
            self.draw_one(ctx, &screen, draw)?;
        }
        Ok(())
    }

    fn draw_one(
        &self,
        ctx: &mut RenderContext,
        view_projection: &Mat4,
        draw: &DynamicDrawCall,
    ) -> RenderResult<()> {
        if draw.is_empty() {
            return Ok(());
        }
        let pipeline = match draw.topology.topology_type() {
            PrimitiveTopologyType::Line => self.lines,
            PrimitiveTopologyType::Triangle => self.triangles,
            PrimitiveTopologyType::Point => {
                log::trace!("Skipping point draw {}", draw.name);
                return Ok(());
            }
        };
        let constants = ColorConstants {
            view_projection: *view_projection,
            model: draw.transform,
            color: draw.color,
        };
        ctx.set_pipeline(pipeline)?;
        ctx.update_buffer(self.constants, 0, bytemuck::bytes_of(&constants))?;
        ctx.bind_resource_table(self.table)?;
        ctx.draw_dynamic(draw.vertex_bytes(), self.stride, &draw.indices)
    }
}

impl FramePass for UiPass {
    fn name(&self) -> &str {
        PassType::Ui.name()
    }

    fn pass_type(&self) -> PassType {
        PassType::Ui
    }

    /// The target follows the anti-aliasing output; see [`UiPass::set_target`]
    fn resize(&mut self, _ctx: &mut RenderContext, _width: u32, _height: u32) -> RenderResult<()> {
        Ok(())
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        ctx.destroy_resource_table(self.table);
        ctx.destroy_buffer(self.constants);
        ctx.destroy_pipeline(self.triangles);
        ctx.destroy_pipeline(self.lines);
        self.target.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gui_projection_maps_pixels_to_clip_space() {
        let projection = gui_projection(200, 100, BackendType::Dx12);
        let top_left = projection.project_point3(Vec3::ZERO);
        let bottom_right = projection.project_point3(Vec3::new(200.0, 100.0, 0.0));
        assert!((top_left.x + 1.0).abs() < 1e-5 && (top_left.y - 1.0).abs() < 1e-5);
        assert!((bottom_right.x - 1.0).abs() < 1e-5 && (bottom_right.y + 1.0).abs() < 1e-5);
        assert!(top_left.z >= 0.0 && top_left.z <= 1.0);
    }

    #[test]
    fn gui_projection_flips_on_vulkan() {
        let projection = gui_projection(200, 100, BackendType::Vulkan);
        let top_left = projection.project_point3(Vec3::ZERO);
        assert!((top_left.y + 1.0).abs() < 1e-5);
    }
}
