//! Vulkan backend implementation using ash
//!
//! Commands are recorded straight into one primary command buffer with a
//! single frame in flight. Buffers live in host-visible memory from
//! gpu-allocator: a buffer the recording frame has not touched yet is
//! written through its mapping, otherwise the update is recorded with
//! `vkCmdUpdateBuffer`, suspending and resuming the current render pass so
//! earlier draws keep the old contents.

mod barriers;
mod conversion;
mod debug;
mod instance;
mod shader;
mod swapchain;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CString;
use std::sync::Arc;

use ash::khr::{surface, swapchain as khr_swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use crate::backend::reflect::{self, BindingKind, BoundResource};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::BackendType;

use barriers::BarrierBatch;
use shader::VkShader;
use swapchain::Swapchain;

/// Handle id reserved for the swap-chain texture
const BACKBUFFER_ID: u64 = 1;

/// Largest payload `vkCmdUpdateBuffer` accepts in one call
const MAX_INLINE_UPDATE: usize = 65536;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    /// Sampled view; depth-only for depth-stencil formats
    view: vk::ImageView,
    /// View covering every aspect, used as a framebuffer attachment
    attachment_view: vk::ImageView,
    allocation: Allocation,
    format: TextureFormat,
    width: u32,
    height: u32,
    layout: vk::ImageLayout,
}

impl VkTexture {
    fn views(&self) -> Vec<vk::ImageView> {
        if self.view == self.attachment_view {
            vec![self.view]
        } else {
            vec![self.view, self.attachment_view]
        }
    }
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, BindingKind>,
}

struct VkRenderPass {
    desc: RenderPassDesc,
    /// Load ops as declared
    clear: vk::RenderPass,
    /// Every attachment loaded; continues a pass split by a buffer update
    resume: vk::RenderPass,
}

struct VkFramebuffer {
    pass: u64,
    attachments: Vec<u64>,
    /// Built on first use; back-buffer targets get one per swap-chain image
    built: HashMap<u32, (vk::Framebuffer, vk::Extent2D)>,
}

impl VkFramebuffer {
    fn uses_backbuffer(&self) -> bool {
        self.attachments.contains(&BACKBUFFER_ID)
    }
}

struct CachedSet {
    set: vk::DescriptorSet,
    buffers: Vec<u64>,
}

struct ActivePass {
    framebuffer: vk::Framebuffer,
    resume: vk::RenderPass,
    extent: vk::Extent2D,
    pipeline: Option<u64>,
    splits: u32,
}

/// Objects the GPU may still reference, destroyed once the frame fence signals
enum Retired {
    Buffer(vk::Buffer, Allocation),
    Texture {
        image: vk::Image,
        views: Vec<vk::ImageView>,
        allocation: Allocation,
    },
    Sampler(vk::Sampler),
    DescriptorSet(vk::DescriptorSet),
    Framebuffer(vk::Framebuffer),
    Pipeline(VkPipeline),
    RenderPass(vk::RenderPass),
}

fn out_of_memory(what: &str, e: impl std::fmt::Display) -> RenderError {
    RenderError::OutOfMemory(format!("{what}: {e}"))
}

fn vk_error(what: &str, e: vk::Result) -> RenderError {
    match e {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            RenderError::OutOfMemory(format!("{what}: {e:?}"))
        }
        vk::Result::ERROR_SURFACE_LOST_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SurfaceLost,
        _ => RenderError::Initialization(format!("{what}: {e:?}")),
    }
}

fn pad_to_word(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    if data.len() % 4 == 0 {
        data.into()
    } else {
        let mut padded = data.to_vec();
        padded.resize(data.len().next_multiple_of(4), 0);
        padded.into()
    }
}

fn clamp_scissor(rect: &ScissorRect, extent: vk::Extent2D) -> vk::Rect2D {
    let x = rect.x.min(extent.width);
    let y = rect.y.min(extent.height);
    vk::Rect2D {
        offset: vk::Offset2D {
            x: x as i32,
            y: y as i32,
        },
        extent: vk::Extent2D {
            width: rect.width.min(extent.width - x),
            height: rect.height.min(extent.height - y),
        },
    }
}

pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<instance::DebugMessenger>,
    debug_labels: Option<ash::ext::debug_utils::Device>,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    limits: vk::PhysicalDeviceLimits,
    device: ash::Device,
    queue: vk::Queue,
    swapchain_fn: khr_swapchain::Device,
    swapchain: Swapchain,
    vsync: bool,
    allocator: Option<Allocator>,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    descriptor_pool: vk::DescriptorPool,

    /// Frame commands are being recorded
    recording: bool,
    /// The last submission may still be executing
    submitted: bool,
    /// A rendered swap-chain image waits for present
    present_pending: bool,

    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    samplers: HashMap<u64, vk::Sampler>,
    shaders: HashMap<u64, VkShader>,
    vertex_formats: HashMap<u64, VertexLayout>,
    pipelines: HashMap<u64, VkPipeline>,
    render_passes: HashMap<u64, VkRenderPass>,
    framebuffers: HashMap<u64, VkFramebuffer>,
    tables: HashMap<u64, ResourceTableDesc>,
    descriptor_sets: HashMap<(u64, u64), CachedSet>,
    next_id: u64,

    active_pass: Option<ActivePass>,
    /// Buffers the recording frame reads or writes on the GPU
    frame_buffers: HashSet<u64>,
    /// One entry per pushed marker: whether it reached the command buffer
    markers: Vec<bool>,
    retired: Vec<Retired>,
}

impl VulkanBackend {
    pub fn new(window: Arc<Window>, vsync: bool) -> RenderResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RenderError::Initialization(format!("Vulkan loader: {e}")))?;
        let display = window
            .display_handle()
            .map_err(|e| RenderError::Initialization(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::Initialization(e.to_string()))?
            .as_raw();

        let (instance, debug) = instance::create_instance(&entry, display)?;
        let surface_fn = surface::Instance::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
            .map_err(|e| vk_error("surface", e))?;

        let (physical_device, queue_family) = instance::pick_physical_device(&instance, &surface_fn, surface)?;
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;
        let device = instance::create_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let debug_labels = debug
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::Initialization(format!("allocator: {e}")))?;

        let swapchain_fn = khr_swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| vk_error("command pool", e))?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("command buffer", e))?
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::Initialization("no command buffer allocated".into()))?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available =
            unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(|e| vk_error("semaphore", e))?;
        let render_finished =
            unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(|e| vk_error("semaphore", e))?;
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = unsafe { device.create_fence(&fence_info, None) }.map_err(|e| vk_error("fence", e))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 4096,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1024,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 4096,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 4096,
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(2048)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
            .map_err(|e| vk_error("descriptor pool", e))?;

        let mut backend = Self {
            _entry: entry,
            instance,
            debug,
            debug_labels,
            surface_fn,
            surface,
            physical_device,
            limits,
            device,
            queue,
            swapchain_fn,
            swapchain: Swapchain::empty(),
            vsync,
            allocator: Some(allocator),
            command_pool,
            command_buffer,
            image_available,
            render_finished,
            in_flight,
            descriptor_pool,
            recording: false,
            submitted: false,
            present_pending: false,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            vertex_formats: HashMap::new(),
            pipelines: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            tables: HashMap::new(),
            descriptor_sets: HashMap::new(),
            next_id: BACKBUFFER_ID + 1,
            active_pass: None,
            frame_buffers: HashSet::new(),
            markers: Vec::new(),
            retired: Vec::new(),
        };

        let size = window.inner_size();
        backend.create_swapchain(size.width.max(1), size.height.max(1))?;
        Ok(backend)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&mut self) -> RenderResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| RenderError::Initialization("allocator already released".into()))
    }

    fn free_allocation(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free allocation: {e}");
            }
        }
    }

    /// Block until the last submission finished, then release retired objects
    fn wait_for_submission(&mut self) {
        if self.submitted {
            if let Err(e) = unsafe { self.device.wait_for_fences(&[self.in_flight], true, u64::MAX) } {
                log::error!("Waiting for the frame fence failed: {e:?}");
            }
            self.submitted = false;
        }
        if !self.recording {
            self.collect_retired();
        }
    }

    fn wait_idle_internal(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("vkDeviceWaitIdle failed: {e:?}");
        }
        self.submitted = false;
        if !self.recording {
            self.collect_retired();
        }
    }

    fn retire(&mut self, item: Retired) {
        if self.recording || self.submitted {
            self.retired.push(item);
        } else {
            self.destroy_retired(item);
        }
    }

    fn collect_retired(&mut self) {
        for item in std::mem::take(&mut self.retired) {
            self.destroy_retired(item);
        }
    }

    fn destroy_retired(&mut self, item: Retired) {
        unsafe {
            match item {
                Retired::Buffer(buffer, allocation) => {
                    self.device.destroy_buffer(buffer, None);
                    self.free_allocation(allocation);
                }
                Retired::Texture {
                    image,
                    views,
                    allocation,
                } => {
                    for view in views {
                        self.device.destroy_image_view(view, None);
                    }
                    self.device.destroy_image(image, None);
                    self.free_allocation(allocation);
                }
                Retired::Sampler(sampler) => self.device.destroy_sampler(sampler, None),
                Retired::DescriptorSet(set) => {
                    if let Err(e) = self.device.free_descriptor_sets(self.descriptor_pool, &[set]) {
                        log::warn!("Failed to free descriptor set: {e:?}");
                    }
                }
                Retired::Framebuffer(framebuffer) => self.device.destroy_framebuffer(framebuffer, None),
                Retired::Pipeline(pipeline) => {
                    self.device.destroy_pipeline(pipeline.pipeline, None);
                    self.device.destroy_pipeline_layout(pipeline.layout, None);
                    self.device.destroy_descriptor_set_layout(pipeline.set_layout, None);
                }
                Retired::RenderPass(pass) => self.device.destroy_render_pass(pass, None),
            }
        }
    }

    /// Record and submit a one-off command buffer, waiting for it to finish
    fn immediate(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> RenderResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("command buffer", e))?
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::usage("no command buffer allocated"))?;

        let result = unsafe {
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin).and_then(|_| {
                record(&self.device, cmd);
                self.device.end_command_buffer(cmd)?;
                let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                self.device.queue_submit(self.queue, &[submit], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)
            })
        };
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result.map_err(|e| vk_error("immediate submit", e))
    }

    fn submit_barriers(&self, batch: &BarrierBatch) {
        if batch.is_empty() {
            return;
        }
        if self.recording {
            batch.submit(&self.device, self.command_buffer);
        } else if let Err(e) = self.immediate(|device, cmd| batch.submit(device, cmd)) {
            log::error!("Layout transition failed: {e}");
        }
    }

    /// Host-visible buffer with memory bound
    fn create_raw_buffer(
        &mut self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<(vk::Buffer, Allocation)> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(|e| vk_error("buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: MemoryLocation::CpuToGpu,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| out_of_memory(name, e))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
            return Err(vk_error("bind buffer memory", e));
        }
        Ok((buffer, allocation))
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: TextureFormat,
        aspect_mask: vk::ImageAspectFlags,
    ) -> RenderResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(conversion::texture_format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.create_image_view(&info, None) }.map_err(|e| vk_error("image view", e))
    }

    /// Image, memory and views for `desc`, left in `UNDEFINED` layout
    fn create_image(&mut self, desc: &TextureDesc) -> RenderResult<VkTexture> {
        let (width, height) = (desc.width.max(1), desc.height.max(1));
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conversion::texture_format(desc.format))
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conversion::texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.map_err(|e| vk_error("image", e))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let name = desc.label.as_deref().unwrap_or("texture");
        let allocation = self.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| out_of_memory(name, e))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let views = unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .map_err(|e| vk_error("bind image memory", e))
            .and_then(|_| {
                let view = self.create_view(image, desc.format, conversion::view_aspect_mask(desc.format))?;
                if !desc.format.has_stencil() {
                    return Ok((view, view));
                }
                match self.create_view(image, desc.format, conversion::aspect_mask(desc.format)) {
                    Ok(attachment_view) => Ok((view, attachment_view)),
                    Err(e) => {
                        unsafe { self.device.destroy_image_view(view, None) };
                        Err(e)
                    }
                }
            });
        match views {
            Ok((view, attachment_view)) => Ok(VkTexture {
                image,
                view,
                attachment_view,
                allocation,
                format: desc.format,
                width,
                height,
                layout: vk::ImageLayout::UNDEFINED,
            }),
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_allocation(allocation);
                Err(e)
            }
        }
    }

    /// Copy `data` into mip 0 of `texture`, leaving it in `final_layout`
    fn upload_texture(&mut self, texture: &VkTexture, data: &[u8], final_layout: vk::ImageLayout) -> RenderResult<()> {
        let (staging, mut allocation) =
            self.create_raw_buffer("texture staging", data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let result = match allocation.mapped_slice_mut() {
            Some(mapped) => {
                mapped[..data.len()].copy_from_slice(data);
                let aspect = conversion::aspect_mask(texture.format);
                let extent = vk::Extent3D {
                    width: texture.width,
                    height: texture.height,
                    depth: 1,
                };
                self.immediate(|device, cmd| {
                    let mut to_transfer = BarrierBatch::new();
                    to_transfer.add_image_barrier(
                        texture.image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        aspect,
                    );
                    to_transfer.submit(device, cmd);
                    let region = vk::BufferImageCopy::default()
                        .image_subresource(vk::ImageSubresourceLayers {
                            aspect_mask: aspect,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .image_extent(extent);
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            cmd,
                            staging,
                            texture.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                    let mut to_final = BarrierBatch::new();
                    to_final.add_image_barrier(
                        texture.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        final_layout,
                        aspect,
                    );
                    to_final.submit(device, cmd);
                })
            }
            None => Err(RenderError::usage("staging memory is not host visible")),
        };
        unsafe { self.device.destroy_buffer(staging, None) };
        self.free_allocation(allocation);
        result
    }

    fn build_render_pass(&self, desc: &RenderPassDesc, resume: bool) -> RenderResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .color_attachments
            .iter()
            .chain(desc.depth_attachment.iter())
            .map(|attachment| {
                let layout = barriers::image_layout(TextureState::attachment_for(attachment.format));
                let load = if resume {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    conversion::load_op(attachment.load_op)
                };
                let store = conversion::store_op(attachment.store_op);
                let (stencil_load, stencil_store) = if attachment.format.has_stencil() {
                    (load, store)
                } else {
                    (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
                };
                vk::AttachmentDescription::default()
                    .format(conversion::texture_format(attachment.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(load)
                    .store_op(store)
                    .stencil_load_op(stencil_load)
                    .stencil_store_op(stencil_store)
                    .initial_layout(layout)
                    .final_layout(layout)
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color_attachments.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.color_attachments.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages)
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));
        unsafe { self.device.create_render_pass(&info, None) }.map_err(|e| vk_error("render pass", e))
    }

    /// Framebuffer for the current swap-chain image, built on first use
    fn resolve_framebuffer(&mut self, id: u64) -> RenderResult<(vk::Framebuffer, vk::Extent2D)> {
        let fb = self.framebuffers.get(&id).ok_or(RenderError::InvalidHandle {
            kind: "framebuffer",
            id,
        })?;
        let key = if fb.uses_backbuffer() {
            self.swapchain.current
        } else {
            0
        };
        if let Some(&built) = fb.built.get(&key) {
            return Ok(built);
        }

        let pass = self.render_passes.get(&fb.pass).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: fb.pass,
        })?;
        let mut views = Vec::with_capacity(fb.attachments.len());
        let mut extent: Option<vk::Extent2D> = None;
        for &attachment in &fb.attachments {
            let (view, width, height) = if attachment == BACKBUFFER_ID {
                let (_, view) = self.swapchain.current_image().ok_or(RenderError::SurfaceLost)?;
                (view, self.swapchain.extent.width, self.swapchain.extent.height)
            } else {
                let texture = self.textures.get(&attachment).ok_or(RenderError::InvalidHandle {
                    kind: "texture",
                    id: attachment,
                })?;
                (texture.attachment_view, texture.width, texture.height)
            };
            views.push(view);
            extent = Some(match extent {
                Some(e) => vk::Extent2D {
                    width: e.width.min(width),
                    height: e.height.min(height),
                },
                None => vk::Extent2D { width, height },
            });
        }
        let extent = extent.unwrap_or(vk::Extent2D {
            width: (pass.desc.viewport.width as u32).max(1),
            height: (pass.desc.viewport.height as u32).max(1),
        });

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(pass.clear)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer =
            unsafe { self.device.create_framebuffer(&info, None) }.map_err(|e| vk_error("framebuffer", e))?;
        if let Some(fb) = self.framebuffers.get_mut(&id) {
            fb.built.insert(key, (framebuffer, extent));
        }
        Ok((framebuffer, extent))
    }

    /// Drop framebuffers that reference swap-chain images
    fn forget_backbuffer_framebuffers(&mut self) {
        let stale: Vec<vk::Framebuffer> = self
            .framebuffers
            .values_mut()
            .filter(|fb| fb.uses_backbuffer())
            .flat_map(|fb| fb.built.drain().map(|(_, (framebuffer, _))| framebuffer))
            .collect();
        for framebuffer in stale {
            self.retire(Retired::Framebuffer(framebuffer));
        }
    }

    fn forget_descriptor_sets(&mut self, matches: impl Fn(u64, u64) -> bool) {
        let keys: Vec<(u64, u64)> = self
            .descriptor_sets
            .keys()
            .filter(|(table, pipeline)| matches(*table, *pipeline))
            .copied()
            .collect();
        for key in keys {
            if let Some(cached) = self.descriptor_sets.remove(&key) {
                self.retire(Retired::DescriptorSet(cached.set));
            }
        }
    }

    /// Descriptor set binding `table` for `pipeline`; `None` when the
    /// pipeline's shader reads no resources
    fn descriptor_set(&mut self, table: u64, pipeline: u64) -> RenderResult<Option<(vk::DescriptorSet, Vec<u64>)>> {
        if let Some(cached) = self.descriptor_sets.get(&(table, pipeline)) {
            return Ok(Some((cached.set, cached.buffers.clone())));
        }
        let p = self.pipelines.get(&pipeline).ok_or(RenderError::InvalidHandle {
            kind: "pipeline",
            id: pipeline,
        })?;
        if p.bindings.is_empty() {
            return Ok(None);
        }
        let desc = self.tables.get(&table).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table,
        })?;

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut buffers = Vec::new();
        for (&binding, &kind) in &p.bindings {
            let resource = reflect::resolve_binding(desc, binding).ok_or_else(|| {
                RenderError::ResourceLayoutMismatch(format!("table {table} has nothing for binding {binding}"))
            })?;
            let ty = conversion::descriptor_type(kind);
            match (kind, resource) {
                (BindingKind::UniformBuffer | BindingKind::StorageBuffer, BoundResource::Buffer(handle)) => {
                    let buffer = self.buffers.get(&handle.0).ok_or(RenderError::InvalidHandle {
                        kind: "buffer",
                        id: handle.0,
                    })?;
                    buffer_infos.push((
                        binding,
                        ty,
                        vk::DescriptorBufferInfo {
                            buffer: buffer.buffer,
                            offset: 0,
                            range: vk::WHOLE_SIZE,
                        },
                    ));
                    buffers.push(handle.0);
                }
                (BindingKind::Texture { .. }, BoundResource::Texture(handle)) => {
                    let texture = self.textures.get(&handle.0).ok_or(RenderError::InvalidHandle {
                        kind: "texture",
                        id: handle.0,
                    })?;
                    image_infos.push((
                        binding,
                        ty,
                        vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: texture.view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        },
                    ));
                }
                (BindingKind::Sampler { .. }, BoundResource::Sampler(handle)) => {
                    let sampler = self.samplers.get(&handle.0).ok_or(RenderError::InvalidHandle {
                        kind: "sampler",
                        id: handle.0,
                    })?;
                    image_infos.push((
                        binding,
                        ty,
                        vk::DescriptorImageInfo {
                            sampler: *sampler,
                            image_view: vk::ImageView::null(),
                            image_layout: vk::ImageLayout::UNDEFINED,
                        },
                    ));
                }
                (kind, resource) => {
                    return Err(RenderError::ResourceLayoutMismatch(format!(
                        "binding {binding} expects {kind:?} but table {table} provides {resource:?}"
                    )));
                }
            }
        }

        let set_layouts = [p.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    RenderError::DescriptorHeapExhausted {
                        requested: 1,
                        available: 0,
                    }
                }
                e => vk_error("descriptor set", e),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::usage("no descriptor set allocated"))?;

        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .map(|(binding, ty, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info))
            })
            .chain(image_infos.iter().map(|(binding, ty, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info))
            }))
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        self.descriptor_sets.insert(
            (table, pipeline),
            CachedSet {
                set,
                buffers: buffers.clone(),
            },
        );
        Ok(Some((set, buffers)))
    }

    /// Record an update of a buffer the frame already uses
    fn record_buffer_update(&mut self, id: u64, offset: u64, data: &[u8]) -> RenderResult<()> {
        let buffer = self
            .buffers
            .get(&id)
            .map(|b| b.buffer)
            .ok_or(RenderError::InvalidHandle { kind: "buffer", id })?;
        let cmd = self.command_buffer;

        let suspended = self.active_pass.is_some();
        if suspended {
            unsafe { self.device.cmd_end_render_pass(cmd) };
        }
        barriers::buffer_update_barrier(&self.device, cmd, buffer, true);
        for (index, chunk) in data.chunks(MAX_INLINE_UPDATE).enumerate() {
            let chunk_offset = offset + (index * MAX_INLINE_UPDATE) as u64;
            unsafe { self.device.cmd_update_buffer(cmd, buffer, chunk_offset, chunk) };
        }
        barriers::buffer_update_barrier(&self.device, cmd, buffer, false);

        // Bound pipeline, descriptor sets and dynamic state survive the split
        if let Some(active) = self.active_pass.as_mut() {
            active.splits += 1;
            let begin = vk::RenderPassBeginInfo::default()
                .render_pass(active.resume)
                .framebuffer(active.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: active.extent,
                });
            unsafe {
                self.device
                    .cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE)
            };
        }
        self.frame_buffers.insert(id);
        Ok(())
    }
}

impl BufferApi for VulkanBackend {
    fn buffer_alignment(&self, usage: BufferUsage) -> u64 {
        if usage.contains(BufferUsage::UNIFORM) {
            self.limits.min_uniform_buffer_offset_alignment.max(256)
        } else {
            4
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc, size: u64, data: Option<&[u8]>) -> RenderResult<BufferHandle> {
        let size = size.max(4);
        if let Some(data) = data {
            if data.len() as u64 > size {
                return Err(RenderError::usage(format!(
                    "initial data of {} bytes exceeds buffer size {size}",
                    data.len()
                )));
            }
        }
        let name = desc.label.as_deref().unwrap_or("buffer");
        let (buffer, mut allocation) = self.create_raw_buffer(name, size, conversion::buffer_usage(desc.usage))?;
        if let Some(data) = data {
            match allocation.mapped_slice_mut() {
                Some(mapped) => mapped[..data.len()].copy_from_slice(data),
                None => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    self.free_allocation(allocation);
                    return Err(RenderError::usage("buffer memory is not host visible"));
                }
            }
        }
        let id = self.allocate_id();
        log::debug!("VulkanBackend: buffer {id} {:?} ({size} bytes)", desc.label);
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let size = self
            .buffers
            .get(&buffer.0)
            .map(|b| b.size)
            .ok_or(RenderError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if offset + data.len() as u64 > size {
            return Err(RenderError::usage(format!(
                "update of {} bytes at offset {offset} does not fit buffer {} ({size} bytes)",
                data.len(),
                buffer.0
            )));
        }

        if self.recording && self.frame_buffers.contains(&buffer.0) {
            let data = pad_to_word(data);
            if offset % 4 != 0 || offset + data.len() as u64 > size {
                return Err(RenderError::usage(format!(
                    "buffer {} is in use this frame; updates need 4-byte alignment",
                    buffer.0
                )));
            }
            return self.record_buffer_update(buffer.0, offset, &data);
        }

        self.wait_for_submission();
        let target = self.buffers.get_mut(&buffer.0).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let mapped = target
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| RenderError::usage("buffer memory is not host visible"))?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> RenderResult<Vec<u8>> {
        if self.recording && self.frame_buffers.contains(&buffer.0) {
            return Err(RenderError::usage(format!(
                "buffer {} is used by the frame being recorded",
                buffer.0
            )));
        }
        self.wait_for_submission();
        let source = self.buffers.get(&buffer.0).ok_or(RenderError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if offset + size > source.size {
            return Err(RenderError::usage(format!(
                "read of {size} bytes at offset {offset} exceeds buffer {}",
                buffer.0
            )));
        }
        let mapped = source
            .allocation
            .mapped_slice()
            .ok_or_else(|| RenderError::usage("buffer memory is not host visible"))?;
        Ok(mapped[offset as usize..(offset + size) as usize].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.remove(&buffer.0) {
            self.forget_descriptor_sets(|_, _| true);
            self.retire(Retired::Buffer(b.buffer, b.allocation));
            log::debug!("VulkanBackend: destroyed buffer {}", buffer.0);
        }
    }
}

impl TextureApi for VulkanBackend {
    fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> RenderResult<TextureHandle> {
        let mut texture = self.create_image(desc)?;
        let target = barriers::image_layout(desc.initial_state);

        let uploaded = match data {
            Some(_) if desc.format.is_depth() => {
                log::warn!("Ignoring initial data for depth texture {:?}", desc.label);
                Ok(false)
            }
            Some(data) => {
                let final_layout = if target == vk::ImageLayout::UNDEFINED {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                } else {
                    target
                };
                self.upload_texture(&texture, data, final_layout).map(|_| {
                    texture.layout = final_layout;
                    true
                })
            }
            None => Ok(false),
        };
        match uploaded {
            Ok(false) if target != vk::ImageLayout::UNDEFINED => {
                let mut batch = BarrierBatch::new();
                batch.add_image_barrier(
                    texture.image,
                    vk::ImageLayout::UNDEFINED,
                    target,
                    conversion::aspect_mask(desc.format),
                );
                self.submit_barriers(&batch);
                texture.layout = target;
            }
            Ok(_) => {}
            Err(e) => {
                let views = texture.views();
                self.retire(Retired::Texture {
                    image: texture.image,
                    views,
                    allocation: texture.allocation,
                });
                return Err(e);
            }
        }

        let id = self.allocate_id();
        log::debug!(
            "VulkanBackend: texture {id} {:?} {}x{} {:?}",
            desc.label,
            texture.width,
            texture.height,
            desc.format
        );
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn transition_texture(&mut self, texture: TextureHandle, before: TextureState, after: TextureState) {
        if self.active_pass.is_some() {
            log::warn!("Ignoring transition of texture {} inside a render pass", texture.0);
            return;
        }
        let new_layout = barriers::image_layout(after);
        if new_layout == vk::ImageLayout::UNDEFINED {
            return;
        }

        let mut batch = BarrierBatch::new();
        if texture.0 == BACKBUFFER_ID {
            // Swap-chain images are never sampled; they stay attachments until present
            if !self.recording || after.is_shader_readable() {
                return;
            }
            let index = self.swapchain.current as usize;
            let (Some(&image), Some(layout)) =
                (self.swapchain.images.get(index), self.swapchain.layouts.get_mut(index))
            else {
                return;
            };
            batch.add_image_barrier(image, *layout, new_layout, vk::ImageAspectFlags::COLOR);
            *layout = new_layout;
        } else {
            let Some(tex) = self.textures.get_mut(&texture.0) else {
                log::warn!("Transition of unknown texture {}", texture.0);
                return;
            };
            batch.add_image_barrier(tex.image, tex.layout, new_layout, conversion::aspect_mask(tex.format));
            tex.layout = new_layout;
        }
        log::trace!("VulkanBackend: texture {} {:?} -> {:?}", texture.0, before, after);
        self.submit_barriers(&batch);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let address_mode = conversion::address_mode(desc.address_mode);
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(conversion::filter(desc.mag_filter))
            .min_filter(conversion::filter(desc.min_filter))
            .mipmap_mode(conversion::mipmap_mode(desc.mipmap_filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(conversion::compare_op).unwrap_or(vk::CompareOp::NEVER))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device.create_sampler(&info, None) }.map_err(|e| vk_error("sampler", e))?;
        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture.0 == BACKBUFFER_ID {
            return;
        }
        if let Some(t) = self.textures.remove(&texture.0) {
            self.forget_descriptor_sets(|_, _| true);
            let views = t.views();
            self.retire(Retired::Texture {
                image: t.image,
                views,
                allocation: t.allocation,
            });
            log::debug!("VulkanBackend: destroyed texture {}", texture.0);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(s) = self.samplers.remove(&sampler.0) {
            self.forget_descriptor_sets(|_, _| true);
            self.retire(Retired::Sampler(s));
        }
    }
}

impl ShaderApi for VulkanBackend {
    fn shader_extensions(&self) -> &'static [&'static str] {
        &["_vert.spirv", "_frag.spirv", ".wgsl"]
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> RenderResult<ShaderHandle> {
        let shader = self.load_shader(desc)?;
        let id = self.allocate_id();
        log::debug!(
            "VulkanBackend: shader {id} {} ({} bindings)",
            desc.label,
            shader.bindings.len()
        );
        self.shaders.insert(id, shader);
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        // Pipelines keep no reference to their modules
        if let Some(s) = self.shaders.remove(&shader.0) {
            self.destroy_vk_shader(s);
        }
    }
}

impl PipelineApi for VulkanBackend {
    fn create_vertex_format(&mut self, layout: &VertexLayout) -> RenderResult<VertexFormatHandle> {
        if layout.stride == 0 {
            return Err(RenderError::UnfinalizedVertexFormat);
        }
        let id = self.allocate_id();
        self.vertex_formats.insert(id, layout.clone());
        Ok(VertexFormatHandle(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineStateDesc, pass: RenderPassHandle) -> RenderResult<PipelineHandle> {
        let render_pass = self
            .render_passes
            .get(&pass.0)
            .map(|p| p.clear)
            .ok_or(RenderError::InvalidHandle {
                kind: "render pass",
                id: pass.0,
            })?;
        let shader = self.shaders.get(&desc.shader.0).ok_or(RenderError::InvalidHandle {
            kind: "shader",
            id: desc.shader.0,
        })?;

        let (vertex_bindings, vertex_attributes) = match desc.vertex_format {
            Some(format) => {
                let layout = self
                    .vertex_formats
                    .get(&format.0)
                    .ok_or(RenderError::InvalidHandle {
                        kind: "vertex format",
                        id: format.0,
                    })?;
                let attributes: Vec<vk::VertexInputAttributeDescription> = layout
                    .attributes
                    .iter()
                    .map(|a| vk::VertexInputAttributeDescription {
                        location: a.location,
                        binding: 0,
                        format: conversion::vertex_format(a.format),
                        offset: a.offset,
                    })
                    .collect();
                let binding = vk::VertexInputBindingDescription {
                    binding: 0,
                    stride: layout.stride,
                    input_rate: vk::VertexInputRate::VERTEX,
                };
                (vec![binding], attributes)
            }
            None => (Vec::new(), Vec::new()),
        };

        let bindings = shader.bindings.clone();
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|(&binding, &kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(conversion::descriptor_type(kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let set_layout = unsafe { self.device.create_descriptor_set_layout(&set_layout_info, None) }
            .map_err(|e| RenderError::PipelineCreation(format!("descriptor set layout: {e:?}")))?;
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match unsafe { self.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(RenderError::PipelineCreation(format!("pipeline layout: {e:?}")));
            }
        };

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = shader
            .stages()
            .map(|(stage, s)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(s.module)
                    .name(&s.entry)
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conversion::topology(desc.topology));
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let front_face = if crate::backend::flips_winding(BackendType::Vulkan) {
            desc.rasterizer.front_face.flipped()
        } else {
            desc.rasterizer.front_face
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(conversion::polygon_mode(desc.rasterizer.fill_mode))
            .cull_mode(conversion::cull_mode(desc.rasterizer.cull_mode))
            .front_face(conversion::front_face(front_face))
            .line_width(1.0);

        if desc.sample_count > 1 {
            log::warn!(
                "Pipeline {:?} requests {} samples; rendering single-sampled",
                desc.label,
                desc.sample_count
            );
        }
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .alpha_to_coverage_enable(desc.blend.alpha_to_coverage);

        let depth = &desc.depth_stencil;
        let depth_test = desc.depth_format.is_some() && depth.depth_test;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_test && depth.depth_write)
            .depth_compare_op(conversion::compare_op(depth.compare));

        let blend_attachments = vec![conversion::color_blend_attachment(&desc.blend); desc.color_formats.len()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let created = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                log::error!("Pipeline {:?} failed: {e:?}", desc.label);
                None
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe {
                self.device.destroy_pipeline_layout(layout, None);
                self.device.destroy_descriptor_set_layout(set_layout, None);
            }
            return Err(RenderError::PipelineCreation(format!(
                "vkCreateGraphicsPipelines failed for {:?}",
                desc.label
            )));
        };

        let id = self.allocate_id();
        log::debug!("VulkanBackend: pipeline {id} {:?}", desc.label);
        self.pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                layout,
                set_layout,
                bindings,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(p) = self.pipelines.remove(&pipeline.0) {
            self.forget_descriptor_sets(|_, p| p == pipeline.0);
            self.retire(Retired::Pipeline(p));
        }
    }
}

impl RenderPassApi for VulkanBackend {
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> RenderResult<RenderPassHandle> {
        let clear = self.build_render_pass(desc, false)?;
        let resume = match self.build_render_pass(desc, true) {
            Ok(pass) => pass,
            Err(e) => {
                unsafe { self.device.destroy_render_pass(clear, None) };
                return Err(e);
            }
        };
        let id = self.allocate_id();
        self.render_passes.insert(
            id,
            VkRenderPass {
                desc: desc.clone(),
                clear,
                resume,
            },
        );
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> RenderResult<FramebufferHandle> {
        if !self.render_passes.contains_key(&desc.pass.0) {
            return Err(RenderError::InvalidHandle {
                kind: "render pass",
                id: desc.pass.0,
            });
        }
        for texture in desc.attachments() {
            if texture.0 != BACKBUFFER_ID && !self.textures.contains_key(&texture.0) {
                return Err(RenderError::InvalidHandle {
                    kind: "texture",
                    id: texture.0,
                });
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            VkFramebuffer {
                pass: desc.pass.0,
                attachments: desc.attachments().map(|t| t.0).collect(),
                built: HashMap::new(),
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn begin_render_pass(
        &mut self,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> RenderResult<()> {
        if !self.recording {
            return Err(RenderError::usage("begin_render_pass outside of a frame"));
        }
        if self.active_pass.is_some() {
            return Err(RenderError::usage("begin_render_pass while a pass is recording"));
        }
        let (vk_framebuffer, extent) = self.resolve_framebuffer(framebuffer.0)?;
        let render_pass = self.render_passes.get(&pass.0).ok_or(RenderError::InvalidHandle {
            kind: "render pass",
            id: pass.0,
        })?;

        let clears: Vec<vk::ClearValue> = render_pass
            .desc
            .color_attachments
            .iter()
            .chain(render_pass.desc.depth_attachment.iter())
            .enumerate()
            .map(|(index, attachment)| {
                let value = clear_values.get(index).copied().unwrap_or(if attachment.format.is_depth() {
                    ClearValue::DEPTH_ONE
                } else {
                    ClearValue::TRANSPARENT_BLACK
                });
                conversion::clear_value(&value)
            })
            .collect();

        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.clear)
            .framebuffer(vk_framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clears);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &begin, vk::SubpassContents::INLINE)
        };
        self.active_pass = Some(ActivePass {
            framebuffer: vk_framebuffer,
            resume: render_pass.resume,
            extent,
            pipeline: None,
            splits: 0,
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> RenderResult<()> {
        let active = self
            .active_pass
            .take()
            .ok_or_else(|| RenderError::usage("end_render_pass without a recording pass"))?;
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
        if active.splits > 0 {
            log::trace!("VulkanBackend: pass split {} time(s) by buffer updates", active.splits);
        }
        Ok(())
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        if let Some(p) = self.render_passes.remove(&pass.0) {
            self.retire(Retired::RenderPass(p.clear));
            self.retire(Retired::RenderPass(p.resume));
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer.0) {
            for (_, (built, _)) in fb.built {
                self.retire(Retired::Framebuffer(built));
            }
        }
    }
}

impl ResourceTableApi for VulkanBackend {
    fn create_resource_table(&mut self) -> RenderResult<ResourceTableHandle> {
        let id = self.allocate_id();
        self.tables.insert(id, ResourceTableDesc::default());
        Ok(ResourceTableHandle(id))
    }

    fn write_resource_table(&mut self, table: ResourceTableHandle, desc: &ResourceTableDesc) -> RenderResult<()> {
        let entry = self.tables.get_mut(&table.0).ok_or(RenderError::InvalidHandle {
            kind: "resource table",
            id: table.0,
        })?;
        *entry = desc.clone();
        self.forget_descriptor_sets(|t, _| t == table.0);
        Ok(())
    }

    fn bind_resource_table(&mut self, table: ResourceTableHandle) -> RenderResult<()> {
        let pipeline = self
            .active_pass
            .as_ref()
            .and_then(|p| p.pipeline)
            .ok_or_else(|| RenderError::usage("bind_resource_table without a bound pipeline"))?;
        let Some((set, buffers)) = self.descriptor_set(table.0, pipeline)? else {
            return Ok(());
        };
        let layout = self
            .pipelines
            .get(&pipeline)
            .map(|p| p.layout)
            .ok_or(RenderError::InvalidHandle {
                kind: "pipeline",
                id: pipeline,
            })?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
        }
        self.frame_buffers.extend(buffers);
        Ok(())
    }

    fn destroy_resource_table(&mut self, table: ResourceTableHandle) {
        self.tables.remove(&table.0);
        self.forget_descriptor_sets(|t, _| t == table.0);
    }
}

impl CommandApi for VulkanBackend {
    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        let vk_pipeline = self
            .pipelines
            .get(&pipeline.0)
            .map(|p| p.pipeline)
            .ok_or(RenderError::InvalidHandle {
                kind: "pipeline",
                id: pipeline.0,
            })?;
        let active = self
            .active_pass
            .as_mut()
            .ok_or_else(|| RenderError::usage("set_pipeline outside of a render pass"))?;
        unsafe {
            self.device
                .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, vk_pipeline)
        };
        active.pipeline = Some(pipeline.0);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        if !self.recording {
            return;
        }
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(self.command_buffer, 0, &[vk_viewport]) };
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        let Some(active) = self.active_pass.as_ref() else {
            return;
        };
        let scissor = clamp_scissor(rect, active.extent);
        unsafe { self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
    }

    fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()> {
        let active = self
            .active_pass
            .as_ref()
            .ok_or_else(|| RenderError::usage("draw outside of a render pass"))?;
        if active.pipeline.is_none() {
            return Err(RenderError::usage("draw without a bound pipeline"));
        }
        let cmd = self.command_buffer;
        let instances = draw.instance_count.max(1);

        if let Some(view) = draw.vertex_buffer {
            let buffer = self.buffers.get(&view.buffer.0).ok_or(RenderError::InvalidHandle {
                kind: "buffer",
                id: view.buffer.0,
            })?;
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[view.offset])
            };
            self.frame_buffers.insert(view.buffer.0);
        }
        match draw.index_buffer {
            Some(view) => {
                let buffer = self.buffers.get(&view.buffer.0).ok_or(RenderError::InvalidHandle {
                    kind: "buffer",
                    id: view.buffer.0,
                })?;
                unsafe {
                    self.device.cmd_bind_index_buffer(
                        cmd,
                        buffer.buffer,
                        view.offset,
                        conversion::index_type(view.format),
                    );
                    self.device
                        .cmd_draw_indexed(cmd, draw.element_count, instances, 0, 0, 0);
                }
                self.frame_buffers.insert(view.buffer.0);
            }
            None => unsafe { self.device.cmd_draw(cmd, draw.element_count, instances, 0, 0) },
        }
        Ok(())
    }

    fn push_marker(&mut self, label: &str) {
        let forwarded = match (&self.debug_labels, self.recording && self.active_pass.is_none()) {
            (Some(labels), true) => match CString::new(label) {
                Ok(name) => {
                    let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe { labels.cmd_begin_debug_utils_label(self.command_buffer, &info) };
                    true
                }
                Err(_) => false,
            },
            _ => false,
        };
        self.markers.push(forwarded);
    }

    fn pop_marker(&mut self) {
        if self.markers.pop() == Some(true) && self.active_pass.is_none() {
            if let Some(labels) = &self.debug_labels {
                unsafe { labels.cmd_end_debug_utils_label(self.command_buffer) };
            }
        }
    }
}

impl FrameApi for VulkanBackend {
    fn begin_frame(&mut self) -> RenderResult<FrameInfo> {
        if self.recording {
            return Err(RenderError::usage("begin_frame while a frame is recording"));
        }
        self.wait_for_submission();

        let acquired = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            )
        };
        let index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swap chain is suboptimal");
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swap chain out of date, recreating");
                let extent = self.swapchain.extent;
                if let Err(e) = self.create_swapchain(extent.width, extent.height) {
                    log::error!("Swap chain recreation failed: {e}");
                }
                return Err(RenderError::SurfaceLost);
            }
            Err(e) => return Err(vk_error("acquire", e)),
        };
        self.swapchain.current = index;

        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| vk_error("reset command buffer", e))?;
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin)
                .map_err(|e| vk_error("begin command buffer", e))?;
        }
        self.recording = true;
        self.frame_buffers.clear();
        self.markers.clear();

        Ok(FrameInfo {
            backbuffer: TextureHandle(BACKBUFFER_ID),
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
        })
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        if self.active_pass.is_some() {
            return Err(RenderError::usage("end_frame while a pass is recording"));
        }
        if !self.recording {
            return Err(RenderError::usage("end_frame without begin_frame"));
        }
        let cmd = self.command_buffer;
        if let Some(labels) = &self.debug_labels {
            for forwarded in self.markers.drain(..) {
                if forwarded {
                    unsafe { labels.cmd_end_debug_utils_label(cmd) };
                }
            }
        }
        self.transition_texture(
            TextureHandle(BACKBUFFER_ID),
            TextureState::RenderTarget,
            TextureState::Present,
        );
        self.recording = false;

        let wait_semaphores = [self.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished];
        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| vk_error("end command buffer", e))?;
            self.device
                .reset_fences(&[self.in_flight])
                .map_err(|e| vk_error("reset fence", e))?;
            self.device
                .queue_submit(self.queue, &[submit], self.in_flight)
                .map_err(|e| vk_error("queue submit", e))?;
        }
        self.submitted = true;
        self.present_pending = true;
        Ok(())
    }

    fn present(&mut self) -> RenderResult<()> {
        if !std::mem::take(&mut self.present_pending) {
            return Ok(());
        }
        let wait_semaphores = [self.render_finished];
        let swapchains = [self.swapchain.handle];
        let indices = [self.swapchain.current];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.swapchain_fn.queue_present(self.queue, &info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                let extent = self.swapchain.extent;
                self.create_swapchain(extent.width, extent.height)
            }
            Err(e) => Err(vk_error("present", e)),
        }
    }

    fn backbuffer(&self) -> TextureHandle {
        TextureHandle(BACKBUFFER_ID)
    }

    fn backbuffer_format(&self) -> TextureFormat {
        self.swapchain.engine_format
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if self.recording {
            log::warn!("Ignoring resize to {width}x{height} while a frame is recording");
            return;
        }
        if let Err(e) = self.create_swapchain(width, height) {
            log::error!("Swap chain resize to {width}x{height} failed: {e}");
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    fn wait_idle(&mut self) {
        self.wait_idle_internal();
    }
}

impl GraphicsBackend for VulkanBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.recording = false;
        self.active_pass = None;
        self.wait_idle_internal();

        let pipelines: Vec<_> = self.pipelines.drain().map(|(_, p)| p).collect();
        for pipeline in pipelines {
            self.destroy_retired(Retired::Pipeline(pipeline));
        }
        let passes: Vec<_> = self.render_passes.drain().map(|(_, p)| p).collect();
        for pass in passes {
            self.destroy_retired(Retired::RenderPass(pass.clear));
            self.destroy_retired(Retired::RenderPass(pass.resume));
        }
        let framebuffers: Vec<_> = self
            .framebuffers
            .drain()
            .flat_map(|(_, fb)| fb.built.into_values().map(|(framebuffer, _)| framebuffer))
            .collect();
        for framebuffer in framebuffers {
            self.destroy_retired(Retired::Framebuffer(framebuffer));
        }
        let shaders: Vec<_> = self.shaders.drain().map(|(_, s)| s).collect();
        for shader in shaders {
            self.destroy_vk_shader(shader);
        }
        let samplers: Vec<_> = self.samplers.drain().map(|(_, s)| s).collect();
        for sampler in samplers {
            self.destroy_retired(Retired::Sampler(sampler));
        }
        let textures: Vec<_> = self.textures.drain().map(|(_, t)| t).collect();
        for texture in textures {
            let views = texture.views();
            self.destroy_retired(Retired::Texture {
                image: texture.image,
                views,
                allocation: texture.allocation,
            });
        }
        let buffers: Vec<_> = self.buffers.drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            self.destroy_retired(Retired::Buffer(buffer.buffer, buffer.allocation));
        }
        self.descriptor_sets.clear();

        // The allocator must go before the device it allocates from
        drop(self.allocator.take());
        self.destroy_swapchain_views();

        unsafe {
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.image_available, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_fence(self.in_flight, None);
            self.swapchain_fn.destroy_swapchain(self.swapchain.handle, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug.utils.destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_padding_rounds_to_four() {
        assert_eq!(pad_to_word(&[1, 2, 3]).len(), 4);
        assert_eq!(pad_to_word(&[1, 2, 3, 4, 5, 6, 7, 8]).len(), 8);
    }

    #[test]
    fn scissor_is_clamped_to_the_render_area() {
        let extent = vk::Extent2D {
            width: 100,
            height: 50,
        };
        let rect = clamp_scissor(
            &ScissorRect {
                x: 80,
                y: 10,
                width: 40,
                height: 100,
            },
            extent,
        );
        assert_eq!(rect.offset.x, 80);
        assert_eq!(rect.extent.width, 20);
        assert_eq!(rect.extent.height, 40);

        let outside = clamp_scissor(
            &ScissorRect {
                x: 200,
                y: 0,
                width: 10,
                height: 10,
            },
            extent,
        );
        assert_eq!(outside.extent.width, 0);
    }
}
