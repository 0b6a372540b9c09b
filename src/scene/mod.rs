//! Scene management
//!
//! Entities, lights and the camera produce one [`FrameParams`] per frame;
//! the renderer consumes it.

mod atmosphere;
mod camera;
mod drawcall;
mod entities;
mod frame_params;
mod light;
mod transform;

pub use atmosphere::*;
pub use camera::*;
pub use drawcall::*;
pub use entities::*;
pub use frame_params::*;
pub use light::*;
pub use transform::*;
