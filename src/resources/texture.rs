//! Texture loading
//!
//! Images are decoded completely on the CPU before anything is created on
//! the GPU, so a load that fails leaves no texture behind.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView};

use crate::backend::{TextureDesc, TextureFormat, TextureHandle, TextureState, TextureUsage};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};

/// Decoded texture data
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode an image file
    pub fn from_file(path: &Path) -> RenderResult<Self> {
        if !path.is_file() {
            return Err(RenderError::AssetNotFound(path.to_path_buf()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let img = image::open(path).map_err(|e| RenderError::AssetDecode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_image(img, &name))
    }

    /// Decode an in-memory image
    pub fn from_bytes(bytes: &[u8], name: &str) -> RenderResult<Self> {
        let img = image::load_from_memory(bytes).map_err(|e| RenderError::AssetDecode {
            path: PathBuf::from(name),
            reason: e.to_string(),
        })?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// A 1x1 texture of one color
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Material map that leaves roughness and metallic to the material constants
    pub fn default_material() -> Self {
        let mut data = Self::solid_color([255, 255, 255, 255], "default_material");
        data.format = TextureFormat::Rgba8Unorm;
        data
    }

    /// Normal map facing straight out of the surface, at full height
    pub fn flat_normal() -> Self {
        let mut data = Self::solid_color([128, 128, 255, 255], "flat_normal");
        data.format = TextureFormat::Rgba8Unorm;
        data
    }

    /// 8x8-cell checkerboard
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if is_even { &color1 } else { &color2 });
            }
        }
        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            data,
            name: "checkerboard".to_string(),
        }
    }

    /// Upload to the GPU
    pub fn upload(&self, ctx: &mut RenderContext) -> RenderResult<Texture> {
        let desc = TextureDesc {
            label: Some(self.name.clone()),
            width: self.width,
            height: self.height,
            mip_levels: 1,
            format: self.format,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            initial_state: TextureState::ShaderRead,
            clear_value: None,
        };
        let handle = ctx.create_texture(&desc, Some(&self.data))?;
        Ok(Texture {
            handle,
            width: self.width,
            height: self.height,
            format: self.format,
            name: self.name.clone(),
        })
    }
}

/// A sampled texture owned by a material or the engine
#[derive(Debug, Clone)]
pub struct Texture {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub name: String,
}

impl Texture {
    pub fn release(self, ctx: &mut RenderContext) {
        ctx.destroy_texture(self.handle);
    }
}

/// Loads textures by file name relative to the asset root
pub struct TextureLoader;

impl TextureLoader {
    /// Directory textures are looked up in
    pub fn directory(root: &Path) -> PathBuf {
        root.join("data").join("textures")
    }

    /// Resolve a texture file name; absolute paths are used as given
    pub fn resolve(root: &Path, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Self::directory(root).join(path)
        }
    }

    /// Decode and upload `filename`
    ///
    /// An empty name yields the default white albedo. Missing or undecodable
    /// files return an error without creating any GPU resource.
    pub fn load(ctx: &mut RenderContext, filename: &str) -> RenderResult<Texture> {
        if filename.is_empty() {
            return TextureData::white().upload(ctx);
        }
        let path = Self::resolve(ctx.root_path(), filename);
        let data = TextureData::from_file(&path).inspect_err(|e| {
            log::warn!("Texture {filename} not loaded: {e}");
        })?;
        log::debug!(
            "Decoded {} ({}x{})",
            path.display(),
            data.width,
            data.height
        );
        data.upload(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn context() -> RenderContext {
        RenderContext::new(Box::new(HeadlessBackend::new(8, 8)), std::env::temp_dir()).unwrap()
    }

    #[test]
    fn checkerboard_alternates_every_eight_pixels() {
        let data = TextureData::checkerboard(16, [255; 4], [0, 0, 0, 255]);
        assert_eq!(data.data.len(), 16 * 16 * 4);
        assert_eq!(&data.data[0..4], &[255; 4]);
        assert_eq!(&data.data[8 * 4..8 * 4 + 4], &[0, 0, 0, 255]);
    }

    #[test]
    fn missing_file_creates_nothing() {
        let mut ctx = context();
        let result = TextureLoader::load(&mut ctx, "does_not_exist.png");
        assert!(matches!(result, Err(RenderError::AssetNotFound(_))));
        assert_eq!(ctx.texture_count(), 0);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            TextureData::from_bytes(b"not an image", "junk"),
            Err(RenderError::AssetDecode { .. })
        ));
    }

    #[test]
    fn empty_name_loads_default_albedo() {
        let mut ctx = context();
        let texture = TextureLoader::load(&mut ctx, "").unwrap();
        assert_eq!((texture.width, texture.height), (1, 1));
        assert_eq!(ctx.texture_count(), 1);
        texture.release(&mut ctx);
        assert_eq!(ctx.texture_count(), 0);
    }
}
