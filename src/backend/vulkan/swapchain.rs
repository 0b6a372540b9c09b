//! Swap-chain creation and recreation

use ash::vk;

use crate::backend::types::TextureFormat;
use crate::error::{RenderError, RenderResult};

use super::{conversion, VulkanBackend};

/// Presentable images and the layout each one was last left in
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub layouts: Vec<vk::ImageLayout>,
    pub format: vk::Format,
    pub engine_format: TextureFormat,
    pub extent: vk::Extent2D,
    pub current: u32,
}

impl Swapchain {
    pub fn empty() -> Self {
        Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            layouts: Vec::new(),
            format: vk::Format::UNDEFINED,
            engine_format: TextureFormat::Bgra8Unorm,
            extent: vk::Extent2D::default(),
            current: 0,
        }
    }

    pub fn current_image(&self) -> Option<(vk::Image, vk::ImageView)> {
        let index = self.current as usize;
        Some((*self.images.get(index)?, *self.views.get(index)?))
    }
}

fn swapchain_error(e: vk::Result) -> RenderError {
    RenderError::Initialization(format!("swap chain: {e:?}"))
}

/// Prefer a linear format: tonemapping writes display-ready values
fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, TextureFormat)> {
    let supported = |f: &vk::SurfaceFormatKHR| conversion::texture_format_back(f.format).map(|t| (*f, t));
    formats
        .iter()
        .filter_map(supported)
        .find(|(_, format)| !matches!(format, TextureFormat::Bgra8UnormSrgb | TextureFormat::Rgba8UnormSrgb))
        .or_else(|| formats.iter().find_map(supported))
}

impl VulkanBackend {
    /// Build (or rebuild) the swap chain at `width`x`height`
    ///
    /// Waits for the device to go idle; framebuffers that render into the
    /// back buffer are dropped and rebuilt lazily.
    pub(super) fn create_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.wait_idle_internal();
        self.destroy_swapchain_views();
        self.forget_backbuffer_framebuffers();

        let capabilities = unsafe {
            self.surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .map_err(swapchain_error)?;
        let formats = unsafe {
            self.surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
        .map_err(swapchain_error)?;
        let present_modes = unsafe {
            self.surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
        .map_err(swapchain_error)?;

        let (format, engine_format) = choose_format(&formats).ok_or_else(|| {
            RenderError::InvalidFormatCombination(format!("no supported swap-chain format in {formats:?}"))
        })?;

        let present_mode = if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .copied()
                .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                .or_else(|| present_modes.iter().copied().find(|&m| m == vk::PresentModeKHR::IMMEDIATE))
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                height: height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old = self.swapchain.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { self.swapchain_fn.create_swapchain(&create_info, None) }.map_err(swapchain_error)?;
        if old != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn.destroy_swapchain(old, None) };
        }
        self.swapchain.handle = handle;

        let images = unsafe { self.swapchain_fn.get_swapchain_images(handle) }.map_err(swapchain_error)?;
        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { self.device.create_image_view(&view_info, None) }.map_err(swapchain_error)?;
            views.push(view);
        }

        self.swapchain.layouts = vec![vk::ImageLayout::UNDEFINED; images.len()];
        self.swapchain.images = images;
        self.swapchain.views = views;
        self.swapchain.format = format.format;
        self.swapchain.engine_format = engine_format;
        self.swapchain.extent = extent;
        self.swapchain.current = 0;
        log::info!(
            "Swap chain {}x{} {:?} {:?} ({} images)",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            self.swapchain.images.len()
        );
        Ok(())
    }

    pub(super) fn destroy_swapchain_views(&mut self) {
        for view in self.swapchain.views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        self.swapchain.images.clear();
        self.swapchain.layouts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn linear_formats_win_over_srgb() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        let (_, format) = choose_format(&formats).unwrap();
        assert_eq!(format, TextureFormat::Bgra8Unorm);
    }

    #[test]
    fn srgb_is_used_when_nothing_else_is_offered() {
        let formats = [
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            surface_format(vk::Format::R8G8B8A8_SRGB),
        ];
        let (_, format) = choose_format(&formats).unwrap();
        assert_eq!(format, TextureFormat::Rgba8UnormSrgb);
        assert!(choose_format(&[surface_format(vk::Format::R5G6B5_UNORM_PACK16)]).is_none());
    }
}
