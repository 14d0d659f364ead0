use ash::prelude::VkResult;
use ash::vk;

use log::*;

use super::{CommandRecorder, GpuDevice, PresentationSurface};
use crate::error::{Result, VkResultExt};

const DEPTH_FORMAT_CANDIDATES: &[vk::Format] = &[
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

//==================================================================================================
// SECTION: AshDevice
//==================================================================================================

/// [`GpuDevice`] over a live `ash::Device`.
#[derive(Clone)]
pub struct AshDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    depth_format: vk::Format,
}

impl AshDevice {
    /// Wraps `device`, caching the physical device's memory properties and its depth format.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Result<Self> {
        // SAFETY: `instance` and `physical_device` are valid for the lifetime of the device.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let depth_format = get_supported_format(
            instance,
            physical_device,
            DEPTH_FORMAT_CANDIDATES,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
        .step("depth format query")?;
        debug!("Depth format: {:?}", depth_format);

        Ok(Self {
            device,
            memory_properties,
            depth_format,
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

/// First candidate with the requested optimal-tiling features.
fn get_supported_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates.iter().cloned().find(|f| {
        // SAFETY: `physical_device` was enumerated from `instance`.
        let properties =
            unsafe { instance.get_physical_device_format_properties(physical_device, *f) };
        properties.optimal_tiling_features.contains(features)
    })
}

impl GpuDevice for AshDevice {
    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        // SAFETY: `info` is a fully initialised create-info with no dangling pointers.
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        // SAFETY: callers guarantee the image is no longer referenced by in-flight work.
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: `image` was created by this device.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        // SAFETY: `info` is a fully initialised create-info.
        unsafe { self.device.create_buffer(info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: callers guarantee the buffer is idle.
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: `buffer` was created by this device.
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        // SAFETY: `info` names a memory type index resolved against this device.
        unsafe { self.device.allocate_memory(info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: every object bound to `memory` has already been destroyed.
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        // SAFETY: `memory` was sized from the image's requirements.
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        // SAFETY: `memory` was sized from the buffer's requirements.
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut u8> {
        // SAFETY: `memory` is host-visible and not currently mapped.
        unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .map(|ptr| ptr.cast())
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: `memory` is currently mapped.
        unsafe { self.device.unmap_memory(memory) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        // SAFETY: `info.image` is a live image created by this device.
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: no framebuffer or descriptor in flight still uses the view.
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        // SAFETY: `info` is a fully initialised create-info.
        unsafe { self.device.create_sampler(info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: callers guarantee the sampler is idle.
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        // SAFETY: attachment, subpass and dependency arrays outlive this call.
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: callers guarantee the render pass is idle.
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        // SAFETY: attachment views are live and match the render pass.
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: callers guarantee the framebuffer is idle.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        // SAFETY: binding array outlives this call.
        unsafe { self.device.create_descriptor_set_layout(info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: callers guarantee the layout is idle.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        // SAFETY: set layouts referenced by `info` are live.
        unsafe { self.device.create_pipeline_layout(info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: callers guarantee the layout is idle.
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: `code` is SPIR-V read through `ash::util::read_spv`.
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: modules are only destroyed after pipeline creation returned.
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        // SAFETY: every state struct referenced by `info` outlives this call.
        unsafe {
            match self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            ) {
                Ok(pipelines) => Ok(pipelines[0]),
                Err((mut pipelines, err)) => {
                    for pipeline in pipelines.drain(..) {
                        if pipeline != vk::Pipeline::null() {
                            self.device.destroy_pipeline(pipeline, None);
                        }
                    }
                    Err(err)
                }
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: callers guarantee the pipeline is idle.
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        // SAFETY: pool size array outlives this call.
        unsafe { self.device.create_descriptor_pool(info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: sets allocated from the pool are no longer in use.
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        // SAFETY: pool and layouts referenced by `info` are live.
        unsafe { self.device.allocate_descriptor_sets(info) }
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: the sets are not bound in any command buffer still pending on the device.
        unsafe { self.device.update_descriptor_sets(writes, &[]) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        // SAFETY: `device_wait_idle` only requires a valid device.
        unsafe { self.device.device_wait_idle() }
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }
}

//==================================================================================================
// SECTION: AshSurface
//==================================================================================================

/// [`PresentationSurface`] over a `VkSurfaceKHR` and the swapchain device extension.
pub struct AshSurface {
    surface_instance: ash::khr::surface::Instance,
    swapchain_device: ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    queue_families: Vec<u32>,
}

impl AshSurface {
    /// `queue_families` lists graphics then present; duplicates collapse to exclusive sharing.
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        queue_families: &[u32],
    ) -> Self {
        let mut families = queue_families.to_vec();
        families.dedup();
        Self {
            surface_instance: ash::khr::surface::Instance::new(entry, instance),
            swapchain_device: ash::khr::swapchain::Device::new(instance, device),
            physical_device,
            surface,
            queue_families: families,
        }
    }

    pub fn swapchain_device(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_device
    }

    /// Destroys the surface itself. Call after every swapchain on it is gone.
    pub fn destroy_surface(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            // SAFETY: no swapchain still references the surface.
            unsafe { self.surface_instance.destroy_surface(self.surface, None) };
            self.surface = vk::SurfaceKHR::null();
        }
    }
}

impl PresentationSurface for AshSurface {
    fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        // SAFETY: surface and physical device are live.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
    }

    fn formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        // SAFETY: surface and physical device are live.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
    }

    fn present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        // SAFETY: surface and physical device are live.
        unsafe {
            self.surface_instance
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
    }

    fn sharing_queue_families(&self) -> Vec<u32> {
        self.queue_families.clone()
    }

    fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        // SAFETY: `info.surface` is this surface and the queue family slice outlives the call.
        unsafe { self.swapchain_device.create_swapchain(info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        // SAFETY: `swapchain` was created through this loader.
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: the device is idle and the swapchain views are already destroyed.
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) }
    }
}

//==================================================================================================
// SECTION: AshRecorder
//==================================================================================================

/// [`CommandRecorder`] writing into a command buffer that is in the recording state.
pub struct AshRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> AshRecorder<'a> {
    /// `command_buffer` must already be between `begin_command_buffer` and `end_command_buffer`.
    pub fn new(device: &'a ash::Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
        }
    }
}

// SAFETY (applies to every method below): the command buffer is in the recording state for the
// lifetime of the recorder, and every handle passed in is owned by a live component.
impl CommandRecorder for AshRecorder<'_> {
    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            );
        }
    }

    fn begin_render_pass(&mut self, info: &vk::RenderPassBeginInfo<'_>) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, info, vk::SubpassContents::INLINE);
        }
    }

    fn end_render_pass(&mut self) {
        // SAFETY: see impl-level note.
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) }
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[buffer], &[offset]);
        }
    }

    fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.command_buffer, buffer, offset, index_type);
        }
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, std::slice::from_ref(&viewport));
        }
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_set_scissor(self.command_buffer, 0, std::slice::from_ref(&scissor));
        }
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    ) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_push_constants(self.command_buffer, layout, stages, offset, bytes);
        }
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
    ) {
        let range = super::color_range();
        // SAFETY: see impl-level note.
        unsafe {
            self.device.cmd_clear_color_image(
                self.command_buffer,
                image,
                layout,
                &color,
                std::slice::from_ref(&range),
            );
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_draw(self.command_buffer, vertex_count, instance_count, 0, 0);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        // SAFETY: see impl-level note.
        unsafe {
            self.device
                .cmd_draw_indexed(self.command_buffer, index_count, instance_count, 0, 0, 0);
        }
    }
}
