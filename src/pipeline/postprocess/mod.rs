//! Post-processing effects
//!
//! Everything between the HDR lighting result and the UI overlay. Each
//! effect owns its targets and reads its input through a fullscreen table
//! that is rebound when the input is recreated.

mod antialiasing;
mod bloom;
mod gaussian_blur;
mod tonemapping;

pub use antialiasing::{AntiAliasingPass, FxaaConstants};
pub use bloom::{BloomConstants, BloomPass};
pub use gaussian_blur::{BlurConstants, GaussianBlur};
pub use tonemapping::{TonemapConstants, TonemapPass};
