//! Renderer tuning parameters loaded from JSON, with mtime-driven hot reload.
//!
//! Every section uses `#[serde(default)]`, so a file that only overrides `"bloom"` is valid.
//! Consumers never see the watcher's state change under them: each reload produces a fresh
//! immutable [`Arc<RendererConfig>`] snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::*;
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};

//==================================================================================================
// SECTION: Sections
//==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FroxelGridConfig {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub near: f32,
    pub far: f32,
}

impl Default for FroxelGridConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 96,
            depth: 160,
            near: 0.5,
            far: 250.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FogConfig {
    /// Base extinction coefficient, per metre.
    pub base_density: f32,
    pub density_scale: f32,
    pub color: [f32; 3],
    pub albedo: f32,
    /// Henyey-Greenstein anisotropy.
    pub phase_g: f32,
}

impl Default for FogConfig {
    fn default() -> Self {
        Self {
            base_density: 0.015,
            density_scale: 1.0,
            color: [0.4, 0.5, 0.6],
            albedo: 0.92,
            phase_g: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LightsConfig {
    pub intensity_scale: f32,
    pub radius_scale: f32,
    pub attenuation_falloff: f32,
    pub neon_intensity_multiplier: f32,
    pub neon_radius_multiplier: f32,
}

impl Default for LightsConfig {
    fn default() -> Self {
        Self {
            intensity_scale: 0.1,
            radius_scale: 5.0,
            attenuation_falloff: 0.01,
            neon_intensity_multiplier: 2.0,
            neon_radius_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkyLightConfig {
    pub enabled: bool,
    /// Not necessarily normalized.
    pub direction: [f32; 3],
    pub color: [f32; 3],
    pub intensity: f32,
    pub scattering_boost: f32,
}

impl Default for SkyLightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            direction: [0.3, -0.6, 0.4],
            color: [1.0, 0.95, 0.85],
            intensity: 0.8,
            scattering_boost: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CullingConfig {
    pub max_distance: f32,
    pub frustum_margin: f32,
    pub near_camera_always_keep: f32,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            max_distance: 320.0,
            frustum_margin: 50.0,
            near_camera_always_keep: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RaymarchConfig {
    pub steps: u32,
    pub step_size_multiplier: f32,
    pub jitter_amount: f32,
}

impl Default for RaymarchConfig {
    fn default() -> Self {
        Self {
            steps: 80,
            step_size_multiplier: 1.0,
            jitter_amount: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemporalConfig {
    /// History weight; 0 disables reprojection blending.
    pub blend_alpha: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositingConfig {
    pub scattering_multiplier: f32,
    pub transmittance_floor: f32,
    pub transmittance_mix: f32,
    pub chromatic_aberration_strength: f32,
}

impl Default for CompositingConfig {
    fn default() -> Self {
        Self {
            scattering_multiplier: 1.0,
            transmittance_floor: 0.7,
            transmittance_mix: 0.5,
            chromatic_aberration_strength: 0.002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnamorphicBloomConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub intensity: f32,
    pub blur_radius: f32,
    pub aspect_ratio: f32,
    pub sample_count: u32,
}

impl Default for AnamorphicBloomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.3,
            intensity: 0.8,
            blur_radius: 3.0,
            aspect_ratio: 3.0,
            sample_count: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolumetricsConfig {
    pub enabled: bool,
}

impl Default for VolumetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    /// Edge length of the square shadow map. Read once at startup.
    pub map_size: u32,
    /// Half-width of the light's orthographic frustum, in metres.
    pub coverage: f32,
    pub distance: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            map_size: 2048,
            coverage: 200.0,
            distance: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BloomConfig {
    /// Number of downsample levels. Read once at startup.
    pub mip_count: u32,
    pub threshold: f32,
    pub intensity: f32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            mip_count: 5,
            threshold: 1.0,
            intensity: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TonemapConfig {
    pub exposure: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub color_temperature: f32,
    pub vignette_strength: f32,
    pub vignette_radius: f32,
    pub grain_strength: f32,
}

impl Default for TonemapConfig {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            contrast: 1.05,
            saturation: 1.1,
            color_temperature: 0.5,
            vignette_strength: 0.3,
            vignette_radius: 0.8,
            grain_strength: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub output_enabled: bool,
    pub output_frame_interval: u32,
    /// Draws the shadow-map preview overlay in the composite pass.
    pub show_shadow_map: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            output_enabled: true,
            output_frame_interval: 60,
            show_shadow_map: false,
        }
    }
}

//==================================================================================================
// SECTION: Root
//==================================================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    pub froxel_grid: FroxelGridConfig,
    pub fog: FogConfig,
    pub lights: LightsConfig,
    pub sky_light: SkyLightConfig,
    pub culling: CullingConfig,
    pub raymarch: RaymarchConfig,
    pub temporal: TemporalConfig,
    pub compositing: CompositingConfig,
    pub anamorphic_bloom: AnamorphicBloomConfig,
    pub volumetrics: VolumetricsConfig,
    pub shadow: ShadowConfig,
    pub bloom: BloomConfig,
    pub tonemap: TonemapConfig,
    pub debug: DebugConfig,
}

impl RendererConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Whether switching from `self` to `other` changes the shape of GPU resources, so the
    /// driver must run a full recreation rather than just picking up new uniforms.
    pub fn requires_recreation(&self, other: &RendererConfig) -> bool {
        self.volumetrics.enabled != other.volumetrics.enabled
            || self.froxel_grid.width != other.froxel_grid.width
            || self.froxel_grid.height != other.froxel_grid.height
            || self.froxel_grid.depth != other.froxel_grid.depth
    }

    /// Rejects values no GPU resource can be created with.
    pub fn validate(&self) -> Result<()> {
        if self.bloom.mip_count == 0 {
            return Err(RenderError::InvalidConfig {
                field: "bloom.mip_count",
                reason: "must be at least 1",
            });
        }
        if self.shadow.map_size == 0 {
            return Err(RenderError::InvalidConfig {
                field: "shadow.map_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Fields that are fixed after startup and differ in `other`.
    pub fn startup_only_changes(&self, other: &RendererConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.bloom.mip_count != other.bloom.mip_count {
            changed.push("bloom.mip_count");
        }
        if self.shadow.map_size != other.shadow.map_size {
            changed.push("shadow.map_size");
        }
        changed
    }
}

//==================================================================================================
// SECTION: Watcher
//==================================================================================================

/// Owns the current snapshot and the file it came from.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<RendererConfig>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Loads `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let last_modified = modified_time(&path);
        let current = if path.exists() {
            let config = read_config(&path)?;
            info!("Loaded renderer config from {}.", path.display());
            config
        } else {
            warn!(
                "Config file {} not found, using defaults.",
                path.display()
            );
            RendererConfig::default()
        };
        Ok(Self {
            path,
            current: Arc::new(current),
            last_modified,
        })
    }

    /// Wraps an in-memory config. `check_and_reload` never fires.
    pub fn from_config(config: RendererConfig) -> Self {
        Self {
            path: PathBuf::new(),
            current: Arc::new(config),
            last_modified: None,
        }
    }

    pub fn snapshot(&self) -> Arc<RendererConfig> {
        Arc::clone(&self.current)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file if its mtime moved past the last load and returns the new snapshot.
    ///
    /// A file that fails to parse is reported and the previous snapshot stays current. The mtime
    /// is still recorded so the same broken file is not re-parsed every call.
    pub fn check_and_reload(&mut self) -> Option<Arc<RendererConfig>> {
        let modified = modified_time(&self.path)?;
        if self.last_modified.is_some_and(|last| modified <= last) {
            return None;
        }
        self.last_modified = Some(modified);

        match read_config(&self.path) {
            Ok(config) => {
                for field in self.current.startup_only_changes(&config) {
                    warn!(
                        "{field} changed in {}; it only applies at startup.",
                        self.path.display()
                    );
                }
                self.current = Arc::new(config);
                info!("Reloaded renderer config from {}.", self.path.display());
                Some(self.snapshot())
            }
            Err(err) => {
                warn!("Keeping previous config: {err}");
                None
            }
        }
    }
}

fn read_config(path: &Path) -> Result<RendererConfig> {
    let text = fs::read_to_string(path)?;
    let config = RendererConfig::from_json(&text).map_err(|source| RenderError::Config {
        path: path.display().to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
