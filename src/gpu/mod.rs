//! Seams between the frame-resource code and the native graphics API.
//!
//! Components never call `ash` directly. They go through these traits so the same lifecycle code
//! drives a real device ([`AshDevice`]) and the in-memory mock used by the unit tests.

use ash::prelude::VkResult;
use ash::vk;

mod ash_device;
#[cfg(test)]
pub(crate) mod mock;

pub use ash_device::{AshDevice, AshRecorder, AshSurface};

//==================================================================================================
// SECTION: Device
//==================================================================================================

/// Resource creation and destruction on a logical device.
///
/// Create calls take the raw `vk::*CreateInfo` structs so call sites read like plain ash code.
/// Destroy calls must tolerate being handed handles that the device produced earlier; callers are
/// responsible for never passing null handles (every component null-checks before destroying).
pub trait GpuDevice {
    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Maps `size` bytes from the start of `memory`. The pointer stays valid until `unmap_memory`.
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>)
    -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    /// Blocks until every queue on the device is idle.
    fn wait_idle(&self) -> VkResult<()>;

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;
    /// Depth format chosen for this device at startup.
    fn depth_format(&self) -> vk::Format;
}

//==================================================================================================
// SECTION: Presentation Surface
//==================================================================================================

/// The window surface plus the swapchain entry points bound to it.
pub trait PresentationSurface {
    fn surface(&self) -> vk::SurfaceKHR;
    fn capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>>;
    /// Queue families that access swapchain images. More than one means concurrent sharing.
    fn sharing_queue_families(&self) -> Vec<u32>;

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>)
    -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
}

//==================================================================================================
// SECTION: Command Recording
//==================================================================================================

/// Per-frame command recording handle. Provided and submitted by the frame driver.
pub trait CommandRecorder {
    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn begin_render_pass(&mut self, info: &vk::RenderPassBeginInfo<'_>);
    fn end_render_pass(&mut self);
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize);
    fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn set_viewport(&mut self, viewport: vk::Viewport);
    fn set_scissor(&mut self, scissor: vk::Rect2D);
    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    );
    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
    );
    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32);
}

/// Full-image color subresource range, the only kind of range the passes here use.
pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Viewport covering `extent` with the standard [0, 1] depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport::default()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
}

/// Scissor covering `extent`.
pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D::default()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent)
}
