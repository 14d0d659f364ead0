//! Froxel grid and half-resolution scattering targets.
//!
//! Only their lifecycle lives here: creation at the current extent, first-use layout transition,
//! teardown on resize. The compute passes that fill them are recorded elsewhere and read/write
//! them in `GENERAL`.

use ash::vk;
use log::*;

use crate::config::RendererConfig;
use crate::error::Result;
use crate::gpu::{CommandRecorder, GpuDevice, color_range};
use crate::resource::{GpuImage, ImageDesc};

pub const DENSITY_FORMAT: vk::Format = vk::Format::R16_SFLOAT;
pub const LIGHT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const SCATTERING_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Scattering, transmittance and history are raymarched at half the swapchain extent.
pub fn raymarch_extent(extent: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width / 2).max(1),
        height: (extent.height / 2).max(1),
    }
}

#[derive(Debug, Default)]
pub struct VolumetricResources {
    pub density: GpuImage,
    pub light: GpuImage,
    pub scattering: GpuImage,
    pub transmittance: GpuImage,
    pub history: GpuImage,
    prepared: bool,
}

impl VolumetricResources {
    /// Creates the froxel volumes and raymarch targets. Does nothing when volumetrics are off.
    ///
    /// On failure the images created so far stay live; call [`VolumetricResources::destroy`].
    pub fn create(
        &mut self,
        device: &dyn GpuDevice,
        config: &RendererConfig,
        extent: vk::Extent2D,
    ) -> Result<()> {
        if !config.volumetrics.enabled {
            debug!("Volumetrics disabled, skipping froxel resources.");
            return Ok(());
        }
        self.prepared = false;

        let grid = vk::Extent3D {
            width: config.froxel_grid.width.max(1),
            height: config.froxel_grid.height.max(1),
            depth: config.froxel_grid.depth.max(1),
        };
        let froxel_usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED;
        let density = ImageDesc::new_3d("froxel density", grid, DENSITY_FORMAT, froxel_usage);
        self.density.create(device, &density)?;
        let light = ImageDesc::new_3d("froxel light", grid, LIGHT_FORMAT, froxel_usage);
        self.light.create(device, &light)?;

        let half = raymarch_extent(extent);
        let target_usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST;
        let target = |name| {
            ImageDesc::new_2d(
                name,
                half,
                SCATTERING_FORMAT,
                target_usage,
                vk::ImageAspectFlags::COLOR,
            )
        };
        self.scattering.create(device, &target("volumetric scattering"))?;
        self.transmittance
            .create(device, &target("volumetric transmittance"))?;
        self.history.create(device, &target("volumetric history"))?;

        info!(
            "Volumetrics ready: {}x{}x{} froxels, {}x{} raymarch.",
            grid.width, grid.height, grid.depth, half.width, half.height
        );
        Ok(())
    }

    /// First-use transition of every image to `GENERAL`, then scattering cleared to 0 and
    /// transmittance to 1 so an unfilled frame composites as clear air.
    pub fn prepare(&mut self, recorder: &mut dyn CommandRecorder) {
        if self.prepared || !self.is_complete() {
            return;
        }
        let to_general = |image: vk::Image| {
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range())
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_WRITE)
        };
        let transitions = [
            to_general(self.scattering.image),
            to_general(self.transmittance.image),
            to_general(self.history.image),
            to_general(self.density.image),
            to_general(self.light.image),
        ];
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &transitions,
        );

        recorder.clear_color_image(
            self.scattering.image,
            vk::ImageLayout::GENERAL,
            vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 0.0],
            },
        );
        recorder.clear_color_image(
            self.transmittance.image,
            vk::ImageLayout::GENERAL,
            vk::ClearColorValue {
                float32: [1.0, 1.0, 1.0, 1.0],
            },
        );

        let cleared = |image: vk::Image| {
            vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::GENERAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range())
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
        };
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            &[cleared(self.scattering.image), cleared(self.transmittance.image)],
        );
        self.prepared = true;
        trace!("Volumetric targets transitioned to GENERAL.");
    }

    /// Raymarch targets first, then the froxel volumes. Safe on partial or empty state.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.history.destroy(device);
        self.transmittance.destroy(device);
        self.scattering.destroy(device);
        self.light.destroy(device);
        self.density.destroy(device);
        self.prepared = false;
    }

    pub fn is_live(&self) -> bool {
        [
            &self.density,
            &self.light,
            &self.scattering,
            &self.transmittance,
            &self.history,
        ]
        .iter()
        .any(|image| image.is_live())
    }

    pub fn is_complete(&self) -> bool {
        [
            &self.density,
            &self.light,
            &self.scattering,
            &self.transmittance,
            &self.history,
        ]
        .iter()
        .all(|image| image.is_complete())
    }

    /// Scattering and transmittance views for the composite, or `None` when not fully created.
    pub fn composite_views(&self) -> Option<(vk::ImageView, vk::ImageView)> {
        self.is_complete()
            .then(|| (self.scattering.view, self.transmittance.view))
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::{Cmd, Kind, MockDevice, MockRecorder};

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1920,
        height: 1080,
    };

    #[test]
    fn raymarch_targets_are_half_resolution() {
        let device = MockDevice::new();
        let mut volumetrics = VolumetricResources::default();
        volumetrics
            .create(&device, &RendererConfig::default(), EXTENT)
            .unwrap();
        assert!(volumetrics.is_complete());

        let scattering = device.image(volumetrics.scattering.image);
        assert_eq!((scattering.extent.width, scattering.extent.height), (960, 540));
        assert!(scattering.usage.contains(vk::ImageUsageFlags::STORAGE));

        let density = device.image(volumetrics.density.image);
        assert_eq!(density.image_type, vk::ImageType::TYPE_3D);
        assert_eq!(density.format, DENSITY_FORMAT);
        assert_eq!(
            (density.extent.width, density.extent.height, density.extent.depth),
            (160, 96, 160)
        );
        assert_eq!(
            raymarch_extent(vk::Extent2D {
                width: 1,
                height: 3
            }),
            vk::Extent2D {
                width: 1,
                height: 1
            }
        );
    }

    #[test]
    fn disabled_allocates_nothing() {
        let device = MockDevice::new();
        let mut config = RendererConfig::default();
        config.volumetrics.enabled = false;
        let mut volumetrics = VolumetricResources::default();
        volumetrics.create(&device, &config, EXTENT).unwrap();
        assert_eq!(device.total_live(), 0);
        assert!(volumetrics.composite_views().is_none());

        let mut recorder = MockRecorder::new();
        volumetrics.prepare(&mut recorder);
        assert!(recorder.cmds.is_empty());
    }

    #[test]
    fn prepare_runs_once_and_clears_transmittance_to_one() {
        let device = MockDevice::new();
        let mut volumetrics = VolumetricResources::default();
        volumetrics
            .create(&device, &RendererConfig::default(), EXTENT)
            .unwrap();

        let mut recorder = MockRecorder::new();
        volumetrics.prepare(&mut recorder);
        let barriers = recorder.barriers();
        assert_eq!(barriers[0].2.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[0].2.new_layout, vk::ImageLayout::GENERAL);
        let cleared: Vec<_> = recorder
            .cmds
            .iter()
            .filter_map(|c| match c {
                Cmd::Clear(image) => Some(*image),
                _ => None,
            })
            .collect();
        assert_eq!(
            cleared,
            vec![volumetrics.scattering.image, volumetrics.transmittance.image]
        );

        let mut second = MockRecorder::new();
        volumetrics.prepare(&mut second);
        assert!(second.cmds.is_empty());
    }

    #[test]
    fn partial_failure_is_destroyable() {
        let device = MockDevice::new();
        // Third image is scattering.
        device.fail_nth(Kind::Image, 3);
        let mut volumetrics = VolumetricResources::default();
        let err = volumetrics
            .create(&device, &RendererConfig::default(), EXTENT)
            .unwrap_err();
        assert_eq!(err.failed_step(), Some("volumetric scattering image"));
        assert!(volumetrics.is_live());
        assert!(volumetrics.composite_views().is_none());

        volumetrics.destroy(&device);
        assert!(!volumetrics.is_live());
        assert_eq!(device.total_live(), 0);
    }
}
