use ash::vk;
use ash::vk::Handle;
use log::*;

use crate::error::{RenderError, Result, VkResultExt};
use crate::gpu::{GpuDevice, PresentationSurface};

/// The presentable image chain, its per-image views and the negotiated format and extent.
#[derive(Clone, Debug, Default)]
pub struct SwapchainResourceSet {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
}

impl SwapchainResourceSet {
    /// Negotiates with the surface and creates the swapchain.
    ///
    /// The surface's locked extent wins over `requested_extent`. Views are made separately by
    /// [`Self::create_views`]; a failure there leaves the swapchain live until [`Self::destroy`].
    pub fn create(
        &mut self,
        surface: &dyn PresentationSurface,
        requested_extent: vk::Extent2D,
    ) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive("swapchain"));
        }
        let capabilities = surface.capabilities().step("surface capabilities")?;
        let formats = surface.formats().step("surface formats")?;
        let present_modes = surface.present_modes().step("surface present modes")?;

        // Callers needing a particular format/colour space must check `self.format` themselves.
        let surface_format = *formats.first().ok_or(RenderError::NoSurfaceFormats)?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&capabilities, requested_extent);
        let image_count = choose_image_count(&capabilities);

        let queue_family_indices = surface.sharing_queue_families();
        let image_sharing_mode = if queue_family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(image_sharing_mode)
            .queue_family_indices(if image_sharing_mode == vk::SharingMode::CONCURRENT {
                &queue_family_indices
            } else {
                &[]
            })
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        self.swapchain = surface
            .create_swapchain(&create_info)
            .step("swapchain creation")?;
        self.format = surface_format.format;
        self.color_space = surface_format.color_space;
        self.extent = extent;
        self.images = surface
            .swapchain_images(self.swapchain)
            .step("swapchain image query")?;

        info!(
            "Created swapchain: {} images, {}x{}, {:?}, {:?}.",
            self.images.len(),
            extent.width,
            extent.height,
            self.format,
            present_mode
        );
        Ok(())
    }

    /// One 2D colour view per swapchain image.
    pub fn create_views(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if !self.views.is_empty() {
            return Err(RenderError::StillLive("swapchain views"));
        }
        let subresource_range = crate::gpu::color_range();
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(subresource_range);
            let view = device
                .create_image_view(&create_info)
                .step("swapchain image view")?;
            self.views.push(view);
        }
        Ok(())
    }

    pub fn destroy_views(&mut self, device: &dyn GpuDevice) {
        for view in self.views.drain(..) {
            if !view.is_null() {
                device.destroy_image_view(view);
            }
        }
    }

    /// Views first, then the swapchain. No-op on handles that were never created.
    pub fn destroy(&mut self, device: &dyn GpuDevice, surface: &dyn PresentationSurface) {
        self.destroy_views(device);
        if !self.swapchain.is_null() {
            surface.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }

    pub fn is_live(&self) -> bool {
        !self.swapchain.is_null() || !self.views.is_empty()
    }
}

/// `min + 1`, clamped to `max` unless `max` is 0 (unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }
    image_count
}

/// The surface's current extent when it is locked, otherwise `requested` unchanged.
///
/// `requested` is deliberately not clamped to the surface's min/max image extent.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        requested
    }
}

pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .cloned()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::{Kind, MockDevice, MockSurface};

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.min_image_count = 7;
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 8);
    }

    #[test]
    fn locked_extent_is_authoritative() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };
        assert_eq!(choose_extent(&caps, EXTENT).width, 1024);

        caps.current_extent.width = u32::MAX;
        caps.max_image_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        // Requested extent passes through without clamping.
        assert_eq!(choose_extent(&caps, EXTENT), EXTENT);
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn create_uses_first_format_and_one_view_per_image() {
        let device = MockDevice::new();
        let surface = MockSurface::new();
        let mut set = SwapchainResourceSet::default();
        set.create(&surface, EXTENT).unwrap();
        set.create_views(&device).unwrap();

        assert_eq!(set.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(set.extent, EXTENT);
        assert_eq!(set.images.len(), 3);
        assert_eq!(set.views.len(), 3);
        assert!(set.views.iter().all(|v| !v.is_null()));
        assert_eq!(surface.last_min_image_count(), 3);

        set.destroy(&device, &surface);
        assert!(set.swapchain.is_null());
        assert!(set.views.is_empty() && set.images.is_empty());
        assert_eq!(surface.live_swapchains(), 0);
        assert_eq!(device.live(Kind::ImageView), 0);
    }

    #[test]
    fn no_formats_is_an_error() {
        let surface = MockSurface::new().with_formats(Vec::new());
        let mut set = SwapchainResourceSet::default();
        assert!(matches!(
            set.create(&surface, EXTENT),
            Err(RenderError::NoSurfaceFormats)
        ));
        assert!(!set.is_live());
    }

    #[test]
    fn view_failure_leaves_swapchain_for_explicit_destroy() {
        let device = MockDevice::new();
        let surface = MockSurface::new();
        let mut set = SwapchainResourceSet::default();
        set.create(&surface, EXTENT).unwrap();
        device.fail_nth(Kind::ImageView, 2);

        let err = set.create_views(&device).unwrap_err();
        assert_eq!(err.failed_step(), Some("swapchain image view"));
        assert_eq!(surface.live_swapchains(), 1);
        assert_eq!(device.live(Kind::ImageView), 1);
        assert!(matches!(
            set.create(&surface, EXTENT),
            Err(RenderError::StillLive("swapchain"))
        ));

        set.destroy(&device, &surface);
        assert_eq!(surface.live_swapchains(), 0);
        assert_eq!(device.total_live(), 0);
    }

    #[test]
    fn destroy_on_empty_set_is_a_no_op() {
        let device = MockDevice::new();
        let surface = MockSurface::new();
        let mut set = SwapchainResourceSet::default();
        set.destroy(&device, &surface);
        assert!(device.events().is_empty());
    }
}
