//! In-memory device, surface and recorder used by the unit tests.
//!
//! Handles are unique counters, so "non-null" and "destroyed exactly once" are checkable.
//! Destroying a handle that is not live panics, which turns double-frees and stale handles into
//! test failures.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;

use super::{CommandRecorder, GpuDevice, PresentationSurface};

pub(crate) const DEVICE_LOCAL_TYPE: u32 = 0;
pub(crate) const HOST_VISIBLE_TYPE: u32 = 1;
/// Surface-owned handles (swapchains and their images) start here, far above device handles.
const SURFACE_HANDLE_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kind {
    Image,
    Buffer,
    Memory,
    ImageView,
    Sampler,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    PipelineLayout,
    ShaderModule,
    Pipeline,
    DescriptorPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Create(Kind, u64),
    Destroy(Kind, u64),
    WaitIdle,
    /// Logged by a [`MockSurface`] that shares the device's log.
    CreateSwapchain(u64),
    DestroySwapchain(u64),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageRecord {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub image_type: vk::ImageType,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SamplerRecord {
    pub mag_filter: vk::Filter,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
}

#[derive(Debug, Clone)]
pub(crate) struct RenderPassRecord {
    pub formats: Vec<vk::Format>,
    pub final_layouts: Vec<vk::ImageLayout>,
}

#[derive(Debug, Clone)]
pub(crate) struct FramebufferRecord {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineRecord {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    /// Width/height of the first baked viewport, if any.
    pub fixed_viewport: Option<(f32, f32)>,
    pub dynamic_states: Vec<vk::DynamicState>,
}

#[derive(Debug, Clone)]
pub(crate) struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub views: Vec<vk::ImageView>,
    pub samplers: Vec<vk::Sampler>,
    pub buffers: Vec<vk::Buffer>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    live: HashMap<Kind, HashSet<u64>>,
    created: HashMap<Kind, usize>,
    fail_at: HashMap<Kind, usize>,
    events: Rc<RefCell<Vec<Event>>>,
    images: HashMap<u64, ImageRecord>,
    buffer_sizes: HashMap<u64, u64>,
    memory: HashMap<u64, (u32, u64)>,
    mapped: HashMap<u64, Box<[u8]>>,
    samplers: HashMap<u64, SamplerRecord>,
    render_passes: HashMap<u64, RenderPassRecord>,
    framebuffers: HashMap<u64, FramebufferRecord>,
    pipelines: HashMap<u64, PipelineRecord>,
    writes: Vec<DescriptorWrite>,
}

impl MockState {
    fn create(&mut self, kind: Kind) -> VkResult<u64> {
        let count = self.created.entry(kind).or_default();
        *count += 1;
        if self.fail_at.get(&kind) == Some(count) {
            self.fail_at.remove(&kind);
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.entry(kind).or_default().insert(raw);
        self.events.borrow_mut().push(Event::Create(kind, raw));
        Ok(raw)
    }

    fn destroy(&mut self, kind: Kind, raw: u64) {
        let removed = self.live.entry(kind).or_default().remove(&raw);
        assert!(removed, "destroying {kind:?} {raw:#x} that is not live");
        self.events.borrow_mut().push(Event::Destroy(kind, raw));
    }
}

//==================================================================================================
// SECTION: MockDevice
//==================================================================================================

pub(crate) struct MockDevice {
    state: RefCell<MockState>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MockDevice {
    pub fn new() -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        Self {
            state: RefCell::new(MockState::default()),
            memory_properties,
        }
    }

    /// Makes the `n`-th creation of `kind` from now on fail with `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_nth(&self, kind: Kind, n: usize) {
        let mut state = self.state.borrow_mut();
        let already = state.created.get(&kind).copied().unwrap_or(0);
        state.fail_at.insert(kind, already + n);
    }

    pub fn fail_next(&self, kind: Kind) {
        self.fail_nth(kind, 1);
    }

    pub fn live(&self, kind: Kind) -> usize {
        self.state.borrow().live.get(&kind).map_or(0, HashSet::len)
    }

    pub fn total_live(&self) -> usize {
        self.state.borrow().live.values().map(HashSet::len).sum()
    }

    pub fn is_live<H: Handle>(&self, kind: Kind, handle: H) -> bool {
        self.state
            .borrow()
            .live
            .get(&kind)
            .is_some_and(|set| set.contains(&handle.as_raw()))
    }

    pub fn created(&self, kind: Kind) -> usize {
        self.state.borrow().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.borrow().clone()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state
            .borrow()
            .events
            .borrow()
            .iter()
            .filter(|e| **e == Event::WaitIdle)
            .count()
    }

    pub fn image(&self, image: vk::Image) -> ImageRecord {
        self.state.borrow().images[&image.as_raw()]
    }

    pub fn sampler(&self, sampler: vk::Sampler) -> SamplerRecord {
        self.state.borrow().samplers[&sampler.as_raw()]
    }

    pub fn render_pass(&self, render_pass: vk::RenderPass) -> RenderPassRecord {
        self.state.borrow().render_passes[&render_pass.as_raw()].clone()
    }

    pub fn framebuffer(&self, framebuffer: vk::Framebuffer) -> FramebufferRecord {
        self.state.borrow().framebuffers[&framebuffer.as_raw()].clone()
    }

    pub fn pipeline(&self, pipeline: vk::Pipeline) -> PipelineRecord {
        self.state.borrow().pipelines[&pipeline.as_raw()].clone()
    }

    pub fn writes(&self) -> Vec<DescriptorWrite> {
        self.state.borrow().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }
}

impl GpuDevice for MockDevice {
    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Image)?;
        state.images.insert(
            raw,
            ImageRecord {
                format: info.format,
                extent: info.extent,
                usage: info.usage,
                image_type: info.image_type,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.borrow_mut().destroy(Kind::Image, image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let extent = self.state.borrow().images[&image.as_raw()].extent;
        vk::MemoryRequirements {
            size: u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth) * 8,
            alignment: 256,
            memory_type_bits: 0b11,
        }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Buffer)?;
        state.buffer_sizes.insert(raw, info.size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.borrow_mut().destroy(Kind::Buffer, buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.state.borrow().buffer_sizes[&buffer.as_raw()],
            alignment: 256,
            memory_type_bits: 0b11,
        }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Memory)?;
        state
            .memory
            .insert(raw, (info.memory_type_index, info.allocation_size));
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.mapped.contains_key(&memory.as_raw()),
            "freeing memory that is still mapped"
        );
        state.destroy(Kind::Memory, memory.as_raw());
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        assert!(self.is_live(Kind::Image, image) && self.is_live(Kind::Memory, memory));
        Ok(())
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        assert!(self.is_live(Kind::Buffer, buffer) && self.is_live(Kind::Memory, memory));
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8> {
        let mut state = self.state.borrow_mut();
        let (type_index, allocation_size) = state.memory[&memory.as_raw()];
        if type_index != HOST_VISIBLE_TYPE || size > allocation_size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let backing = state
            .mapped
            .entry(memory.as_raw())
            .or_insert_with(|| vec![0u8; allocation_size as usize].into_boxed_slice());
        Ok(backing.as_mut_ptr())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.state.borrow_mut().mapped.remove(&memory.as_raw());
        assert!(removed.is_some(), "unmapping memory that is not mapped");
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        assert!(
            info.image.as_raw() >= SURFACE_HANDLE_BASE || self.is_live(Kind::Image, info.image),
            "view over a dead image"
        );
        let raw = self.state.borrow_mut().create(Kind::ImageView)?;
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state
            .borrow_mut()
            .destroy(Kind::ImageView, view.as_raw());
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Sampler)?;
        state.samplers.insert(
            raw,
            SamplerRecord {
                mag_filter: info.mag_filter,
                address_mode_u: info.address_mode_u,
                address_mode_v: info.address_mode_v,
                address_mode_w: info.address_mode_w,
                border_color: info.border_color,
                compare_enable: info.compare_enable == vk::TRUE,
                compare_op: info.compare_op,
            },
        );
        Ok(vk::Sampler::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state
            .borrow_mut()
            .destroy(Kind::Sampler, sampler.as_raw());
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        // SAFETY: the attachment array is borrowed by `info` for the duration of this call.
        let attachments = unsafe {
            std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
        };
        let record = RenderPassRecord {
            formats: attachments.iter().map(|a| a.format).collect(),
            final_layouts: attachments.iter().map(|a| a.final_layout).collect(),
        };
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::RenderPass)?;
        state.render_passes.insert(raw, record);
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .borrow_mut()
            .destroy(Kind::RenderPass, render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        // SAFETY: the attachment array is borrowed by `info` for the duration of this call.
        let attachments = unsafe {
            std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
        };
        for view in attachments {
            assert!(
                self.is_live(Kind::ImageView, *view),
                "framebuffer over a dead view"
            );
        }
        assert!(self.is_live(Kind::RenderPass, info.render_pass));
        let record = FramebufferRecord {
            render_pass: info.render_pass,
            attachments: attachments.to_vec(),
            width: info.width,
            height: info.height,
        };
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Framebuffer)?;
        state.framebuffers.insert(raw, record);
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state
            .borrow_mut()
            .destroy(Kind::Framebuffer, framebuffer.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        let raw = self.state.borrow_mut().create(Kind::DescriptorSetLayout)?;
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .borrow_mut()
            .destroy(Kind::DescriptorSetLayout, layout.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        let raw = self.state.borrow_mut().create(Kind::PipelineLayout)?;
        Ok(vk::PipelineLayout::from_raw(raw))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state
            .borrow_mut()
            .destroy(Kind::PipelineLayout, layout.as_raw());
    }

    fn create_shader_module(&self, _code: &[u32]) -> VkResult<vk::ShaderModule> {
        let raw = self.state.borrow_mut().create(Kind::ShaderModule)?;
        Ok(vk::ShaderModule::from_raw(raw))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state
            .borrow_mut()
            .destroy(Kind::ShaderModule, module.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        // SAFETY: state structs are borrowed by `info` for the duration of this call.
        let (fixed_viewport, dynamic_states) = unsafe {
            let viewport = info
                .p_viewport_state
                .as_ref()
                .filter(|vs| vs.viewport_count > 0 && !vs.p_viewports.is_null())
                .map(|vs| {
                    let v = &*vs.p_viewports;
                    (v.width, v.height)
                });
            let dynamic = info
                .p_dynamic_state
                .as_ref()
                .filter(|ds| !ds.p_dynamic_states.is_null())
                .map(|ds| {
                    std::slice::from_raw_parts(
                        ds.p_dynamic_states,
                        ds.dynamic_state_count as usize,
                    )
                    .to_vec()
                })
                .unwrap_or_default();
            (viewport, dynamic)
        };
        assert!(self.is_live(Kind::RenderPass, info.render_pass));
        assert!(self.is_live(Kind::PipelineLayout, info.layout));
        let record = PipelineRecord {
            render_pass: info.render_pass,
            layout: info.layout,
            fixed_viewport,
            dynamic_states,
        };
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Pipeline)?;
        state.pipelines.insert(raw, record);
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state
            .borrow_mut()
            .destroy(Kind::Pipeline, pipeline.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        _info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let raw = self.state.borrow_mut().create(Kind::DescriptorPool)?;
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state
            .borrow_mut()
            .destroy(Kind::DescriptorPool, pool.as_raw());
    }

    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        assert!(self.is_live(Kind::DescriptorPool, info.descriptor_pool));
        let mut state = self.state.borrow_mut();
        Ok((0..info.descriptor_set_count)
            .map(|_| {
                state.next_handle += 1;
                vk::DescriptorSet::from_raw(state.next_handle)
            })
            .collect())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.borrow_mut();
        for write in writes {
            let count = write.descriptor_count as usize;
            // SAFETY: info arrays are borrowed by the writes for the duration of this call.
            let (views, samplers, buffers) = unsafe {
                if write.p_image_info.is_null() {
                    let buffers = std::slice::from_raw_parts(write.p_buffer_info, count)
                        .iter()
                        .map(|b| b.buffer)
                        .collect();
                    (Vec::new(), Vec::new(), buffers)
                } else {
                    let infos = std::slice::from_raw_parts(write.p_image_info, count);
                    (
                        infos.iter().map(|i| i.image_view).collect(),
                        infos.iter().map(|i| i.sampler).collect(),
                        Vec::new(),
                    )
                }
            };
            state.writes.push(DescriptorWrite {
                set: write.dst_set,
                binding: write.dst_binding,
                ty: write.descriptor_type,
                views,
                samplers,
                buffers,
            });
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.state.borrow().events.borrow_mut().push(Event::WaitIdle);
        Ok(())
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }
}

//==================================================================================================
// SECTION: MockSurface
//==================================================================================================

#[derive(Default)]
struct SurfaceState {
    next_handle: u64,
    live: HashSet<u64>,
    images: HashMap<u64, Vec<vk::Image>>,
    last_extent: Option<vk::Extent2D>,
    last_min_image_count: u32,
    fail_next: bool,
    log: Option<Rc<RefCell<Vec<Event>>>>,
}

/// Surface with settable capabilities. Start unlocked (current extent = u32::MAX).
pub(crate) struct MockSurface {
    capabilities: RefCell<vk::SurfaceCapabilitiesKHR>,
    formats: Vec<vk::SurfaceFormatKHR>,
    state: RefCell<SurfaceState>,
}

impl MockSurface {
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };
        Self {
            capabilities: RefCell::new(capabilities),
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            state: RefCell::new(SurfaceState {
                next_handle: SURFACE_HANDLE_BASE,
                ..Default::default()
            }),
        }
    }

    pub fn with_formats(mut self, formats: Vec<vk::SurfaceFormatKHR>) -> Self {
        self.formats = formats;
        self
    }

    pub fn set_image_count_range(&self, min: u32, max: u32) {
        let mut caps = self.capabilities.borrow_mut();
        caps.min_image_count = min;
        caps.max_image_count = max;
    }

    /// Locks the surface to `extent`, as a compositor that dictates window size would.
    pub fn lock_extent(&self, extent: vk::Extent2D) {
        self.capabilities.borrow_mut().current_extent = extent;
    }

    /// Logs swapchain creation and destruction into `device`'s event log, so the relative order of
    /// surface and device calls is observable.
    pub fn share_log(&self, device: &MockDevice) {
        self.state.borrow_mut().log = Some(Rc::clone(&device.state.borrow().events));
    }

    pub fn fail_next_swapchain(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn last_extent(&self) -> Option<vk::Extent2D> {
        self.state.borrow().last_extent
    }

    pub fn last_min_image_count(&self) -> u32 {
        self.state.borrow().last_min_image_count
    }
}

impl PresentationSurface for MockSurface {
    fn surface(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(0xfeed)
    }

    fn capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(*self.capabilities.borrow())
    }

    fn formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.formats.clone())
    }

    fn present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(vec![vk::PresentModeKHR::FIFO])
    }

    fn sharing_queue_families(&self) -> Vec<u32> {
        vec![0]
    }

    fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.next_handle += 1;
        let raw = state.next_handle;
        let base = state.next_handle * 0x100;
        let images = (0..info.min_image_count)
            .map(|i| vk::Image::from_raw(base + u64::from(i)))
            .collect();
        state.live.insert(raw);
        state.images.insert(raw, images);
        state.last_extent = Some(info.image_extent);
        state.last_min_image_count = info.min_image_count;
        if let Some(log) = &state.log {
            log.borrow_mut().push(Event::CreateSwapchain(raw));
        }
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        Ok(self.state.borrow().images[&swapchain.as_raw()].clone())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        let removed = state.live.remove(&swapchain.as_raw());
        assert!(removed, "destroying a swapchain that is not live");
        if let Some(log) = &state.log {
            log.borrow_mut().push(Event::DestroySwapchain(swapchain.as_raw()));
        }
    }
}

//==================================================================================================
// SECTION: MockRecorder
//==================================================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct BarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

#[derive(Debug, Clone)]
pub(crate) enum Cmd {
    Barrier {
        src: vk::PipelineStageFlags,
        dst: vk::PipelineStageFlags,
        images: Vec<BarrierRecord>,
    },
    BeginPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
    },
    EndPass,
    BindPipeline(vk::Pipeline),
    BindVertex(vk::Buffer),
    BindIndex(vk::Buffer, vk::IndexType),
    BindSets(vk::PipelineLayout, Vec<vk::DescriptorSet>),
    Viewport(f32, f32),
    Scissor(u32, u32),
    PushConstants(Vec<u8>),
    Clear(vk::Image),
    Draw(u32),
    DrawIndexed(u32),
}

#[derive(Default)]
pub(crate) struct MockRecorder {
    pub cmds: Vec<Cmd>,
}

impl MockRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render passes begun, in order.
    pub fn passes(&self) -> Vec<vk::RenderPass> {
        self.cmds
            .iter()
            .filter_map(|c| match c {
                Cmd::BeginPass { render_pass, .. } => Some(*render_pass),
                _ => None,
            })
            .collect()
    }

    pub fn barriers(&self) -> Vec<(vk::PipelineStageFlags, vk::PipelineStageFlags, BarrierRecord)> {
        self.cmds
            .iter()
            .filter_map(|c| match c {
                Cmd::Barrier { src, dst, images } => Some((*src, *dst, images[0])),
                _ => None,
            })
            .collect()
    }
}

impl CommandRecorder for MockRecorder {
    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.cmds.push(Cmd::Barrier {
            src: src_stage,
            dst: dst_stage,
            images: image_barriers
                .iter()
                .map(|b| BarrierRecord {
                    image: b.image,
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_access: b.src_access_mask,
                    dst_access: b.dst_access_mask,
                })
                .collect(),
        });
    }

    fn begin_render_pass(&mut self, info: &vk::RenderPassBeginInfo<'_>) {
        self.cmds.push(Cmd::BeginPass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            width: info.render_area.extent.width,
            height: info.render_area.extent.height,
        });
    }

    fn end_render_pass(&mut self) {
        self.cmds.push(Cmd::EndPass);
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.cmds.push(Cmd::BindPipeline(pipeline));
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.cmds.push(Cmd::BindVertex(buffer));
    }

    fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.cmds.push(Cmd::BindIndex(buffer, index_type));
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.cmds.push(Cmd::BindSets(layout, sets.to_vec()));
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.cmds.push(Cmd::Viewport(viewport.width, viewport.height));
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.cmds
            .push(Cmd::Scissor(scissor.extent.width, scissor.extent.height));
    }

    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        bytes: &[u8],
    ) {
        self.cmds.push(Cmd::PushConstants(bytes.to_vec()));
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        _layout: vk::ImageLayout,
        _color: vk::ClearColorValue,
    ) {
        self.cmds.push(Cmd::Clear(image));
    }

    fn draw(&mut self, vertex_count: u32, _instance_count: u32) {
        self.cmds.push(Cmd::Draw(vertex_count));
    }

    fn draw_indexed(&mut self, index_count: u32, _instance_count: u32) {
        self.cmds.push(Cmd::DrawIndexed(index_count));
    }
}
