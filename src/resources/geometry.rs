//! Model data and GPU geometry
//!
//! Model parsers fill a [`ModelData`]; [`create_geometry`] interleaves its
//! vertices according to the model's vertex format and uploads vertex and
//! index buffers.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::{
    AttributeSemantic, BufferHandle, BufferUsage, DrawCommand, IndexBufferView, IndexFormat,
    VertexBufferView, VertexFormatHandle,
};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};

use super::VertexFormat;

/// One vertex with every attribute a format may select
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub color: Vec4,
    pub uv: Vec2,
    pub joints: [u32; 4],
    pub weights: Vec4,
}

impl Default for ModelVertex {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            normal: Vec3::Y,
            tangent: Vec3::X,
            color: Vec4::ONE,
            uv: Vec2::ZERO,
            joints: [0; 4],
            weights: Vec4::new(1.0, 0.0, 0.0, 0.0),
        }
    }
}

impl ModelVertex {
    pub fn new(position: Vec3, normal: Vec3, tangent: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            tangent,
            uv,
            ..Default::default()
        }
    }

    fn write_attribute(&self, semantic: AttributeSemantic, components: usize, out: &mut Vec<u8>) {
        let floats: [f32; 4] = match semantic {
            AttributeSemantic::Position => self.position.extend(1.0).to_array(),
            AttributeSemantic::Normal => self.normal.extend(0.0).to_array(),
            AttributeSemantic::Tangent => self.tangent.extend(0.0).to_array(),
            AttributeSemantic::Binormal => self.normal.cross(self.tangent).extend(0.0).to_array(),
            AttributeSemantic::Color => self.color.to_array(),
            AttributeSemantic::Uv => [self.uv.x, self.uv.y, 0.0, 0.0],
            AttributeSemantic::Weights => self.weights.to_array(),
            AttributeSemantic::Joints => {
                out.extend_from_slice(bytemuck::cast_slice(&self.joints[..components]));
                return;
            }
        };
        out.extend_from_slice(bytemuck::cast_slice(&floats[..components]));
    }
}

/// Joint of a skinned model
#[derive(Debug, Clone, PartialEq)]
pub struct Joint {
    pub name: String,
    pub parent: Option<usize>,
    pub inverse_bind: Mat4,
}

/// Joint hierarchy; parents precede their children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Skeleton {
    pub joints: Vec<Joint>,
}

impl Skeleton {
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    /// Find a joint index by name
    pub fn find(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|j| j.name == name)
    }
}

/// CPU-side model as produced by a model parser
#[derive(Debug, Clone)]
pub struct ModelData {
    pub name: String,
    pub vertices: Vec<ModelVertex>,
    pub indices: Vec<u16>,
    pub vertex_format: VertexFormat,
    pub skeleton: Option<Skeleton>,
}

impl ModelData {
    pub fn new(name: &str, vertex_format: VertexFormat) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
            indices: Vec::new(),
            vertex_format,
            skeleton: None,
        }
    }

    /// Vertices packed per the model's vertex format
    pub fn interleave(&self) -> RenderResult<Vec<u8>> {
        let mut format = self.vertex_format.clone();
        let stride = format.finalize();
        if stride == 0 {
            return Err(RenderError::UnfinalizedVertexFormat);
        }
        let mut bytes = Vec::with_capacity(self.vertices.len() * stride as usize);
        for vertex in &self.vertices {
            for (semantic, attribute) in format.attributes() {
                vertex.write_attribute(semantic, attribute.component_count() as usize, &mut bytes);
            }
        }
        Ok(bytes)
    }

    /// Unit cube centered at the origin
    pub fn cube() -> Self {
        let mut model = Self::new("cube", VertexFormat::mesh());
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        for (normal, tangent) in faces {
            let bitangent = normal.cross(tangent);
            let base = model.vertices.len() as u16;
            let corners = [
                (Vec2::new(-0.5, -0.5), Vec2::new(0.0, 1.0)),
                (Vec2::new(0.5, -0.5), Vec2::new(1.0, 1.0)),
                (Vec2::new(0.5, 0.5), Vec2::new(1.0, 0.0)),
                (Vec2::new(-0.5, 0.5), Vec2::new(0.0, 0.0)),
            ];
            for (corner, uv) in corners {
                let position = normal * 0.5 + tangent * corner.x + bitangent * corner.y;
                model
                    .vertices
                    .push(ModelVertex::new(position, normal, tangent, uv));
            }
            model
                .indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        model
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u16) -> Self {
        let mut model = Self::new("plane", VertexFormat::mesh());
        let subdivisions = subdivisions.max(1);
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let position = Vec3::new(
                    -width / 2.0 + x as f32 * step_x,
                    0.0,
                    -depth / 2.0 + z as f32 * step_z,
                );
                let uv = Vec2::new(
                    x as f32 / subdivisions as f32,
                    z as f32 / subdivisions as f32,
                );
                model
                    .vertices
                    .push(ModelVertex::new(position, Vec3::Y, Vec3::X, uv));
            }
        }
        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                model.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }
        model
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u16, rings: u16) -> Self {
        let mut model = Self::new("sphere", VertexFormat::mesh());
        let segments = segments.max(3);
        let rings = rings.max(2);
        let segment_angle = std::f32::consts::TAU / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                let tangent = Vec3::new(-theta.sin(), 0.0, theta.cos());
                let uv = Vec2::new(
                    segment as f32 / segments as f32,
                    ring as f32 / rings as f32,
                );
                model
                    .vertices
                    .push(ModelVertex::new(normal * 0.5, normal, tangent, uv));
            }
        }
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                model.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }
        model
    }
}

/// Uploaded vertex/index buffers of one model
#[derive(Debug, Clone)]
pub struct Geometry {
    pub name: String,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: Option<BufferHandle>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertex_format: VertexFormatHandle,
    pub stride: u32,
}

impl Geometry {
    /// Draw of the whole geometry
    pub fn draw_command(&self) -> DrawCommand {
        DrawCommand {
            vertex_buffer: Some(VertexBufferView {
                buffer: self.vertex_buffer,
                offset: 0,
            }),
            index_buffer: self.index_buffer.map(|buffer| IndexBufferView {
                buffer,
                offset: 0,
                format: IndexFormat::Uint16,
            }),
            element_count: if self.index_buffer.is_some() {
                self.index_count
            } else {
                self.vertex_count
            },
            instance_count: 1,
        }
    }

    pub fn release(&self, ctx: &mut RenderContext) {
        ctx.destroy_buffer(self.vertex_buffer);
        if let Some(index_buffer) = self.index_buffer {
            ctx.destroy_buffer(index_buffer);
        }
    }
}

/// Upload `model` into GPU buffers
pub fn create_geometry(ctx: &mut RenderContext, model: &ModelData) -> RenderResult<Geometry> {
    if model.vertices.is_empty() {
        return Err(RenderError::usage(format!(
            "model {} has no vertices",
            model.name
        )));
    }
    if let Some(bad) = model
        .indices
        .iter()
        .find(|&&i| i as usize >= model.vertices.len())
    {
        return Err(RenderError::usage(format!(
            "model {} index {} out of range ({} vertices)",
            model.name,
            bad,
            model.vertices.len()
        )));
    }

    let mut format = model.vertex_format.clone();
    let vertex_format = ctx.create_vertex_format(&mut format)?;
    let stride = format.stride();
    let vertices = model.interleave()?;

    let vertex_buffer = ctx.create_buffer_with_data(
        &vertices,
        stride as u64,
        BufferUsage::VERTEX | BufferUsage::COPY_DST,
        &format!("{} vertices", model.name),
    )?;
    let index_buffer = if model.indices.is_empty() {
        None
    } else {
        let created = ctx.create_buffer_with_data(
            bytemuck::cast_slice(&model.indices),
            IndexFormat::Uint16.size(),
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            &format!("{} indices", model.name),
        );
        match created {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                ctx.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        }
    };

    log::debug!(
        "Created geometry {} ({} vertices, {} indices, stride {})",
        model.name,
        model.vertices.len(),
        model.indices.len(),
        stride
    );
    Ok(Geometry {
        name: model.name.clone(),
        vertex_buffer,
        index_buffer,
        vertex_count: model.vertices.len() as u32,
        index_count: model.indices.len() as u32,
        vertex_format,
        stride,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttributeFormat, HeadlessBackend};

    fn context() -> RenderContext {
        RenderContext::new(Box::new(HeadlessBackend::new(8, 8)), ".").unwrap()
    }

    #[test]
    fn cube_faces_point_outward() {
        let cube = ModelData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        for triangle in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| cube.vertices[triangle[i] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            assert!(face_normal.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn sphere_winding_is_counter_clockwise_from_outside() {
        let sphere = ModelData::sphere(8, 6);
        let mut checked = 0;
        for triangle in sphere.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| sphere.vertices[triangle[i] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            if face_normal.length() > 1e-6 {
                let centroid = (a.position + b.position + c.position) / 3.0;
                assert!(face_normal.dot(centroid) > 0.0);
                checked += 1;
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn interleave_follows_format_order() {
        let mut model = ModelData::new(
            "tri",
            VertexFormat::new()
                .with(AttributeSemantic::Uv, AttributeFormat::Float32x2)
                .with(AttributeSemantic::Position, AttributeFormat::Float32x3),
        );
        model.vertices.push(ModelVertex::new(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::Y,
            Vec3::X,
            Vec2::new(0.25, 0.75),
        ));
        let bytes = model.interleave().unwrap();
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(floats, &[0.25, 0.75, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn create_geometry_uploads_both_buffers() {
        let mut ctx = context();
        let before = ctx.buffer_count();
        let geometry = create_geometry(&mut ctx, &ModelData::cube()).unwrap();
        assert_eq!(geometry.stride, 60);
        assert_eq!(geometry.draw_command().element_count, 36);
        assert_eq!(ctx.buffer_count(), before + 2);

        let bytes = ctx.read_buffer(geometry.vertex_buffer).unwrap();
        assert_eq!(bytes.len(), 24 * 60);
        geometry.release(&mut ctx);
        assert_eq!(ctx.buffer_count(), before);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut ctx = context();
        let mut model = ModelData::cube();
        model.indices.push(100);
        assert!(create_geometry(&mut ctx, &model).is_err());
    }
}
