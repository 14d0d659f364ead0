//! Owning handle bundles for device images, buffers, render passes and framebuffers.
//!
//! Every bundle is filled progressively by `create` and emptied by `destroy`. A failed `create`
//! leaves whatever it already made live; the owner must call `destroy` before retrying.

use std::ptr::copy_nonoverlapping as memcpy;

use ash::vk;
use ash::vk::Handle;
use log::*;

use crate::error::{RenderError, Result, VkResultExt};
use crate::gpu::GpuDevice;

//==================================================================================================
// SECTION: Memory Type Resolution
//==================================================================================================

/// Lowest memory type index allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..properties.memory_type_count)
        .find(|&i| {
            let type_filter_met = (type_bits & (1 << i)) != 0;
            let properties_met = properties.memory_types[i as usize]
                .property_flags
                .contains(required);
            type_filter_met && properties_met
        })
        .ok_or(RenderError::NoMemoryType {
            type_bits,
            required,
        })
}

//==================================================================================================
// SECTION: Images
//==================================================================================================

/// Everything needed to build a [`GpuImage`].
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    /// Used in logs and error steps, e.g. "shadow map".
    pub name: &'static str,
    pub image_type: vk::ImageType,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    pub fn new_2d(
        name: &'static str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            name,
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            usage,
            aspect,
        }
    }

    pub fn new_3d(
        name: &'static str,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            name,
            image_type: vk::ImageType::TYPE_3D,
            extent,
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

/// A device-local image, its bound memory and a single whole-image view.
///
/// Non-null `memory` or `view` implies non-null `image`, and `memory` is bound to `image`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

impl GpuImage {
    /// Creates image → memory (bound) → view. Stops at the first failure without rolling back.
    pub fn create(&mut self, device: &dyn GpuDevice, desc: &ImageDesc) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive(desc.name));
        }
        self.format = desc.format;
        self.extent = desc.extent;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);
        self.image = device
            .create_image(&image_info)
            .step(format!("{} image", desc.name))?;

        let requirements = device.image_memory_requirements(self.image);
        let memory_type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        self.memory = device
            .allocate_memory(&alloc_info)
            .step(format!("{} memory", desc.name))?;
        device
            .bind_image_memory(self.image, self.memory)
            .step(format!("{} memory bind", desc.name))?;

        let view_type = if desc.image_type == vk::ImageType::TYPE_3D {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(desc.aspect)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(subresource_range);
        self.view = device
            .create_image_view(&view_info)
            .step(format!("{} view", desc.name))?;

        debug!(
            "Created {} ({:?}, {}x{}x{}).",
            desc.name, desc.format, desc.extent.width, desc.extent.height, desc.extent.depth
        );
        Ok(())
    }

    /// Releases view → image → memory. Safe on empty or partially created state.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        if !self.view.is_null() {
            device.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if !self.image.is_null() {
            device.destroy_image(self.image);
            self.image = vk::Image::null();
        }
        if !self.memory.is_null() {
            device.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
    }

    /// True if any handle is still held.
    pub fn is_live(&self) -> bool {
        !self.image.is_null() || !self.memory.is_null() || !self.view.is_null()
    }

    /// True if every handle is held.
    pub fn is_complete(&self) -> bool {
        !self.image.is_null() && !self.memory.is_null() && !self.view.is_null()
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

//==================================================================================================
// SECTION: Buffers
//==================================================================================================

/// A buffer and its dedicated memory allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn create(
        &mut self,
        device: &dyn GpuDevice,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive(name));
        }
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        self.buffer = device
            .create_buffer(&buffer_info)
            .step(format!("{name} buffer"))?;
        self.size = size;

        let requirements = device.buffer_memory_requirements(self.buffer);
        let memory_type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        self.memory = device
            .allocate_memory(&alloc_info)
            .step(format!("{name} memory"))?;
        device
            .bind_buffer_memory(self.buffer, self.memory)
            .step(format!("{name} memory bind"))?;
        Ok(())
    }

    /// Copies `bytes` into a host-visible buffer through a transient mapping.
    pub fn upload(&self, device: &dyn GpuDevice, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::UniformOverflow {
                len: bytes.len(),
                size: self.size,
            });
        }
        let ptr = device
            .map_memory(self.memory, self.size)
            .step("buffer upload map")?;
        // SAFETY: the mapping covers `self.size` bytes, which is at least `bytes.len()`.
        unsafe { memcpy(bytes.as_ptr(), ptr, bytes.len()) };
        device.unmap_memory(self.memory);
        Ok(())
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        if !self.buffer.is_null() {
            device.destroy_buffer(self.buffer);
            self.buffer = vk::Buffer::null();
        }
        if !self.memory.is_null() {
            device.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
        self.size = 0;
    }

    pub fn is_live(&self) -> bool {
        !self.buffer.is_null() || !self.memory.is_null()
    }
}

//--------------------------------------------------------------------------------------------------
// Subsection: Persistently Mapped Uniforms
//--------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct UniformSlot {
    buffer: GpuBuffer,
    mapped: *mut u8,
}

/// One host-visible uniform buffer per frame-in-flight slot, each mapped for its whole lifetime.
///
/// Writes land in device-visible memory immediately (coherent), but the caller must make sure the
/// GPU is done with a slot before writing it again. Waiting on that slot's fence is enough.
#[derive(Debug, Default)]
pub struct PersistentUniformBuffer {
    slots: Vec<UniformSlot>,
    size: vk::DeviceSize,
}

impl PersistentUniformBuffer {
    pub fn create(
        &mut self,
        device: &dyn GpuDevice,
        name: &'static str,
        size: vk::DeviceSize,
        slot_count: usize,
    ) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive(name));
        }
        self.size = size;
        for _ in 0..slot_count {
            self.slots.push(UniformSlot {
                buffer: GpuBuffer::default(),
                mapped: std::ptr::null_mut(),
            });
            let slot = self
                .slots
                .last_mut()
                .ok_or(RenderError::NotCreated(name))?;
            slot.buffer.create(
                device,
                name,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            slot.mapped = device
                .map_memory(slot.buffer.memory, size)
                .step(format!("{name} map"))?;
        }
        Ok(())
    }

    /// Copies `bytes` into the slot's mapping.
    pub fn write(&self, slot: usize, bytes: &[u8]) -> Result<()> {
        let target = self.slot(slot)?;
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::UniformOverflow {
                len: bytes.len(),
                size: self.size,
            });
        }
        // SAFETY: `mapped` covers `self.size` bytes for as long as the slot is live, and the
        // caller has waited for the GPU to finish with this slot.
        unsafe { memcpy(bytes.as_ptr(), target.mapped, bytes.len()) };
        Ok(())
    }

    /// Current contents of the slot's mapping.
    pub fn read(&self, slot: usize) -> Result<&[u8]> {
        let target = self.slot(slot)?;
        // SAFETY: the mapping is valid and `self.size` bytes long while the slot is live.
        Ok(unsafe { std::slice::from_raw_parts(target.mapped, self.size as usize) })
    }

    pub fn buffer(&self, slot: usize) -> vk::Buffer {
        self.slots
            .get(slot)
            .map_or(vk::Buffer::null(), |s| s.buffer.buffer)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_live(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for mut slot in self.slots.drain(..) {
            if !slot.mapped.is_null() {
                device.unmap_memory(slot.buffer.memory);
            }
            slot.buffer.destroy(device);
        }
        self.size = 0;
    }

    fn slot(&self, slot: usize) -> Result<&UniformSlot> {
        self.slots
            .get(slot)
            .filter(|s| !s.mapped.is_null())
            .ok_or(RenderError::SlotOutOfRange {
                slot,
                count: self.slots.len(),
            })
    }
}

//==================================================================================================
// SECTION: Render Passes and Framebuffers
//==================================================================================================

/// A render pass plus the attachment formats it was built against.
#[derive(Clone, Debug, Default)]
pub struct RenderPassResource {
    pub handle: vk::RenderPass,
    pub formats: Vec<vk::Format>,
}

impl RenderPassResource {
    pub fn create(
        &mut self,
        device: &dyn GpuDevice,
        name: &'static str,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[vk::SubpassDescription<'_>],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive(name));
        }
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);
        self.handle = device
            .create_render_pass(&create_info)
            .step(format!("{name} render pass"))?;
        self.formats = attachments.iter().map(|a| a.format).collect();
        Ok(())
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        if !self.handle.is_null() {
            device.destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
        self.formats.clear();
    }

    pub fn is_live(&self) -> bool {
        !self.handle.is_null()
    }
}

/// A framebuffer, valid only for the extent and views it was built with.
#[derive(Clone, Debug, Default)]
pub struct FramebufferResource {
    pub handle: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

impl FramebufferResource {
    pub fn create(
        device: &dyn GpuDevice,
        name: &'static str,
        render_pass: &RenderPassResource,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        debug_assert_eq!(
            attachments.len(),
            render_pass.formats.len(),
            "{name}: attachment count does not match the render pass"
        );
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = device
            .create_framebuffer(&create_info)
            .step(format!("{name} framebuffer"))?;
        Ok(Self {
            handle,
            render_pass: render_pass.handle,
            attachments: attachments.to_vec(),
            extent,
        })
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        if !self.handle.is_null() {
            device.destroy_framebuffer(self.handle);
            self.handle = vk::Framebuffer::null();
        }
        self.render_pass = vk::RenderPass::null();
        self.attachments.clear();
        self.extent = vk::Extent2D::default();
    }
}
