//! Vertex memory layouts
//!
//! A [`VertexFormat`] is an ordered list of attributes. Attributes are packed
//! back to back in declaration order; [`VertexFormat::finalize`] assigns
//! offsets and shader locations and computes the stride. A format is usable
//! by a pipeline only once its stride is nonzero.

use crate::backend::{AttributeFormat, AttributeSemantic, VertexAttribute, VertexLayout};
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexFormat {
    attributes: Vec<(AttributeSemantic, AttributeFormat)>,
    layout: Option<VertexLayout>,
}

impl VertexFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attribute; invalidates a previous finalize
    pub fn add_attribute(&mut self, semantic: AttributeSemantic, format: AttributeFormat) -> &mut Self {
        self.attributes.push((semantic, format));
        self.layout = None;
        self
    }

    /// Builder form of [`Self::add_attribute`]
    pub fn with(mut self, semantic: AttributeSemantic, format: AttributeFormat) -> Self {
        self.add_attribute(semantic, format);
        self
    }

    /// Assign offsets and locations; returns the stride
    pub fn finalize(&mut self) -> u32 {
        let mut offset = 0;
        let attributes = self
            .attributes
            .iter()
            .enumerate()
            .map(|(location, &(semantic, format))| {
                let attribute = VertexAttribute {
                    semantic,
                    format,
                    location: location as u32,
                    offset,
                };
                offset += format.component_count() * format.component_size();
                attribute
            })
            .collect();
        self.layout = Some(VertexLayout {
            stride: offset,
            attributes,
        });
        offset
    }

    /// Joint indices must be integer and every other attribute float
    pub fn validate(&self) -> RenderResult<()> {
        for &(semantic, format) in &self.attributes {
            if format.is_integer() != (semantic == AttributeSemantic::Joints) {
                return Err(RenderError::InvalidFormatCombination(format!(
                    "{semantic:?} attribute cannot use {format:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.stride() > 0
    }

    /// Stride in bytes; zero until finalized
    pub fn stride(&self) -> u32 {
        self.layout.as_ref().map_or(0, |l| l.stride)
    }

    pub fn layout(&self) -> Option<&VertexLayout> {
        self.layout.as_ref().filter(|l| l.stride > 0)
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn has(&self, semantic: AttributeSemantic) -> bool {
        self.attributes.iter().any(|(s, _)| *s == semantic)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (AttributeSemantic, AttributeFormat)> + '_ {
        self.attributes.iter().copied()
    }

    /// position, normal, tangent, color, uv
    pub fn mesh() -> Self {
        let mut format = Self::new()
            .with(AttributeSemantic::Position, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Normal, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Tangent, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Color, AttributeFormat::Float32x4)
            .with(AttributeSemantic::Uv, AttributeFormat::Float32x2);
        format.finalize();
        format
    }

    /// [`Self::mesh`] plus joint indices and skin weights
    pub fn skinned() -> Self {
        let mut format = Self::mesh()
            .with(AttributeSemantic::Joints, AttributeFormat::Uint32x4)
            .with(AttributeSemantic::Weights, AttributeFormat::Float32x4);
        format.finalize();
        format
    }

    /// position, color; used for debug and GUI geometry
    pub fn position_color() -> Self {
        let mut format = Self::new()
            .with(AttributeSemantic::Position, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Color, AttributeFormat::Float32x3);
        format.finalize();
        format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_sum_of_attribute_sizes() {
        let mut format = VertexFormat::new();
        format
            .add_attribute(AttributeSemantic::Position, AttributeFormat::Float32x3)
            .add_attribute(AttributeSemantic::Uv, AttributeFormat::Float32x2)
            .add_attribute(AttributeSemantic::Joints, AttributeFormat::Uint32x4);
        assert_eq!(format.finalize(), 12 + 8 + 16);
    }

    #[test]
    fn offsets_are_packed_in_declaration_order() {
        let format = VertexFormat::skinned();
        let layout = format.layout().unwrap();
        let mut expected = 0;
        for (i, attribute) in layout.attributes.iter().enumerate() {
            assert_eq!(attribute.location, i as u32);
            assert_eq!(attribute.offset, expected);
            expected += attribute.format.size();
        }
        assert_eq!(layout.stride, expected);
    }

    #[test]
    fn empty_format_is_not_finalized() {
        let mut format = VertexFormat::new();
        assert_eq!(format.finalize(), 0);
        assert!(!format.is_finalized());
        assert!(format.layout().is_none());
    }

    #[test]
    fn adding_after_finalize_requires_finalize_again() {
        let mut format = VertexFormat::position_color();
        assert_eq!(format.stride(), 24);
        format.add_attribute(AttributeSemantic::Uv, AttributeFormat::Float32x2);
        assert!(!format.is_finalized());
        assert_eq!(format.finalize(), 32);
    }

    #[test]
    fn integer_formats_are_reserved_for_joints() {
        let mixed = VertexFormat::new()
            .with(AttributeSemantic::Position, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Joints, AttributeFormat::Float32x4)
            .with(AttributeSemantic::Color, AttributeFormat::Uint32x4);
        assert!(matches!(
            mixed.validate(),
            Err(RenderError::InvalidFormatCombination(_))
        ));

        let float_joints = VertexFormat::new()
            .with(AttributeSemantic::Position, AttributeFormat::Float32x3)
            .with(AttributeSemantic::Joints, AttributeFormat::Float32x4);
        assert!(float_joints.validate().is_err());

        let integer_color = VertexFormat::new().with(AttributeSemantic::Color, AttributeFormat::Uint32x4);
        assert!(integer_color.validate().is_err());

        for format in [VertexFormat::mesh(), VertexFormat::skinned(), VertexFormat::position_color()] {
            format.validate().unwrap();
        }
    }

    #[test]
    fn joints_are_the_only_integer_attribute() {
        let format = VertexFormat::skinned();
        for (semantic, attr_format) in format.attributes() {
            assert_eq!(
                attr_format.is_integer(),
                semantic == AttributeSemantic::Joints
            );
        }
    }
}
