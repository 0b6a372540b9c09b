//! Resource management
//!
//! Handles vertex formats, geometry, shaders, textures and materials.

mod geometry;
mod material;
mod parallax_material;
mod shader;
mod texture;
mod unlit_material;
mod vertex_format;

pub use geometry::*;
pub use material::*;
pub use parallax_material::*;
pub use shader::*;
pub use texture::*;
pub use unlit_material::*;
pub use vertex_format::*;
