use std::fs::File;
use std::path::Path;

use ash::util::read_spv;
use log::*;

use crate::error::{RenderError, Result};

/// SPIR-V for the fullscreen passes this crate owns. Scene shaders belong to the scene.
#[derive(Clone, Debug, Default)]
pub struct ShaderSet {
    pub fullscreen_vert: Vec<u32>,
    pub bloom_frag: Vec<u32>,
    pub composite_frag: Vec<u32>,
    pub overlay_vert: Vec<u32>,
    pub overlay_frag: Vec<u32>,
}

impl ShaderSet {
    /// Reads `<name>.spv` files compiled by the build script from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let set = Self {
            fullscreen_vert: read_words(&dir.join("fullscreen.vert.spv"))?,
            bloom_frag: read_words(&dir.join("bloom_downsample.frag.spv"))?,
            composite_frag: read_words(&dir.join("composite.frag.spv"))?,
            overlay_vert: read_words(&dir.join("overlay.vert.spv"))?,
            overlay_frag: read_words(&dir.join("overlay.frag.spv"))?,
        };
        info!("Loaded post-process shaders from {}.", dir.display());
        Ok(set)
    }
}

/// Loads one SPIR-V file as aligned 32-bit words.
pub fn read_words(path: &Path) -> Result<Vec<u32>> {
    let shader_error = |source| RenderError::Shader {
        path: path.display().to_string(),
        source,
    };
    let mut file = File::open(path).map_err(shader_error)?;
    read_spv(&mut file).map_err(shader_error)
}
