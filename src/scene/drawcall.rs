//! Draw requests queued by entities for the renderer

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::PrimitiveTopology;
use crate::resources::{Geometry, Material};

/// A draw of GPU-resident geometry through a material
#[derive(Clone)]
pub struct StaticDrawCall {
    pub name: String,
    pub transform: Mat4,
    /// `None` draws with the renderer's default material
    pub material: Option<Arc<dyn Material>>,
    pub geometry: Arc<Geometry>,
    pub topology: PrimitiveTopology,
}

impl StaticDrawCall {
    pub fn new(name: impl Into<String>, geometry: Arc<Geometry>, transform: Mat4) -> Self {
        Self {
            name: name.into(),
            transform,
            material: None,
            geometry,
            topology: PrimitiveTopology::TriangleList,
        }
    }

    pub fn with_material(mut self, material: Arc<dyn Material>) -> Self {
        self.material = Some(material);
        self
    }
}

impl std::fmt::Debug for StaticDrawCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDrawCall")
            .field("name", &self.name)
            .field("material", &self.material.as_ref().map(|m| m.name().to_string()))
            .field("geometry", &self.geometry.name)
            .field("topology", &self.topology)
            .finish()
    }
}

/// Vertex of inline debug and overlay geometry (position + color)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl ColorVertex {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
        }
    }
}

static_assertions::const_assert_eq!(std::mem::size_of::<ColorVertex>(), 24);

/// A draw whose vertices are uploaded every frame
#[derive(Debug, Clone)]
pub struct DynamicDrawCall {
    pub name: String,
    pub transform: Mat4,
    pub vertices: Vec<ColorVertex>,
    /// Empty draws every vertex in order
    pub indices: Vec<u16>,
    /// Multiplied with the vertex colors; alpha blends the result
    pub color: Vec4,
    pub topology: PrimitiveTopology,
}

impl DynamicDrawCall {
    /// Line list through `points` taken pairwise
    pub fn lines(name: impl Into<String>, transform: Mat4, points: &[Vec3], color: Vec3) -> Self {
        Self {
            name: name.into(),
            transform,
            vertices: points.iter().map(|p| ColorVertex::new(*p, color)).collect(),
            indices: Vec::new(),
            color: Vec4::ONE,
            topology: PrimitiveTopology::LineList,
        }
    }

    /// Indexed triangle list of one flat color
    pub fn triangles(
        name: impl Into<String>,
        transform: Mat4,
        positions: &[Vec3],
        indices: &[u16],
        color: Vec4,
    ) -> Self {
        Self {
            name: name.into(),
            transform,
            vertices: positions.iter().map(|p| ColorVertex::new(*p, Vec3::ONE)).collect(),
            indices: indices.to_vec(),
            color,
            topology: PrimitiveTopology::TriangleList,
        }
    }

    /// Axis-aligned screen rectangle for the gui list, in pixels
    pub fn rect(name: impl Into<String>, min: glam::Vec2, max: glam::Vec2, color: Vec4) -> Self {
        let positions = [
            Vec3::new(min.x, min.y, 0.0),
            Vec3::new(max.x, min.y, 0.0),
            Vec3::new(max.x, max.y, 0.0),
            Vec3::new(min.x, max.y, 0.0),
        ];
        Self::triangles(name, Mat4::IDENTITY, &positions, &[0, 2, 1, 0, 3, 2], color)
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_use_one_vertex_per_point() {
        let draw = DynamicDrawCall::lines(
            "axis",
            Mat4::IDENTITY,
            &[Vec3::ZERO, Vec3::X, Vec3::ZERO, Vec3::Y],
            Vec3::new(1.0, 0.0, 0.0),
        );
        assert_eq!(draw.vertices.len(), 4);
        assert_eq!(draw.vertex_bytes().len(), 4 * 24);
        assert_eq!(draw.topology, PrimitiveTopology::LineList);
    }

    #[test]
    fn rect_is_two_triangles() {
        let draw = DynamicDrawCall::rect("panel", glam::Vec2::ZERO, glam::Vec2::splat(10.0), Vec4::ONE);
        assert_eq!(draw.indices.len(), 6);
        assert!(draw.indices.iter().all(|&i| (i as usize) < draw.vertices.len()));
    }
}
