use ash::vk;

use crate::error::Result;
use crate::gpu::GpuDevice;
use crate::resource::{GpuImage, ImageDesc};

/// The depth buffer shared by the main scene pass, sized to the swapchain extent.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthResource {
    pub image: GpuImage,
}

impl DepthResource {
    pub fn create(&mut self, device: &dyn GpuDevice, extent: vk::Extent2D) -> Result<()> {
        let desc = ImageDesc::new_2d(
            "depth",
            extent,
            device.depth_format(),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        );
        self.image.create(device, &desc)
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.image.destroy(device);
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }

    pub fn format(&self) -> vk::Format {
        self.image.format
    }

    pub fn is_live(&self) -> bool {
        self.image.is_live()
    }
}
