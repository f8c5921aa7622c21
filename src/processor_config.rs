//! Preprocessing configuration, mirroring HuggingFace `preprocessor_config.json`.

use std::path::Path;

use image::imageops::FilterType;
use serde::Deserialize;

use crate::error::{EmbeddingError, Result};

/// Interpolation kernel used by the shortest-edge resize.
///
/// Deserialised from the PIL resample codes found in HuggingFace configs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "u32")]
pub enum Resample {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl Resample {
    pub fn filter_type(self) -> FilterType {
        match self {
            Resample::Nearest => FilterType::Nearest,
            Resample::Bilinear => FilterType::Triangle,
            Resample::Bicubic => FilterType::CatmullRom,
        }
    }
}

impl From<u32> for Resample {
    fn from(code: u32) -> Self {
        match code {
            0 => Resample::Nearest,
            2 => Resample::Bilinear,
            3 => Resample::Bicubic,
            other => {
                tracing::warn!(code = other, "unsupported resample code, using bilinear");
                Resample::Bilinear
            }
        }
    }
}

/// Validated preprocessing parameters.
///
/// Built through [`ProcessorConfig::builder`] or loaded from JSON; either way
/// the values are checked once and never change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    do_resize: bool,
    shortest_edge: u32,
    resample: Resample,
    do_center_crop: bool,
    crop_width: u32,
    crop_height: u32,
    do_rescale: bool,
    rescale_factor: f32,
    do_normalize: bool,
    image_mean: [f32; 3],
    image_std: [f32; 3],
    processor_type: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            shortest_edge: 256,
            resample: Resample::Bilinear,
            do_center_crop: true,
            crop_width: 224,
            crop_height: 224,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            processor_type: None,
        }
    }
}

impl ProcessorConfig {
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: PreprocessorConfigFile = serde_json::from_str(json)?;
        file.try_into()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| EmbeddingError::io(path, e))?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(?path, ?config, "loaded preprocessor config");
        Ok(config)
    }

    pub fn do_resize(&self) -> bool {
        self.do_resize
    }

    pub fn shortest_edge(&self) -> u32 {
        self.shortest_edge
    }

    pub fn resample(&self) -> Resample {
        self.resample
    }

    pub fn do_center_crop(&self) -> bool {
        self.do_center_crop
    }

    pub fn crop_width(&self) -> u32 {
        self.crop_width
    }

    pub fn crop_height(&self) -> u32 {
        self.crop_height
    }

    pub fn do_rescale(&self) -> bool {
        self.do_rescale
    }

    pub fn rescale_factor(&self) -> f32 {
        self.rescale_factor
    }

    pub fn do_normalize(&self) -> bool {
        self.do_normalize
    }

    pub fn image_mean(&self) -> [f32; 3] {
        self.image_mean
    }

    pub fn image_std(&self) -> [f32; 3] {
        self.image_std
    }

    pub fn processor_type(&self) -> Option<&str> {
        self.processor_type.as_deref()
    }

    /// NCHW shape of the pipeline output, known up front only when cropping
    /// fixes the spatial size.
    pub fn input_shape(&self) -> Option<[usize; 4]> {
        self.do_center_crop
            .then(|| [1, 3, self.crop_height as usize, self.crop_width as usize])
    }

    fn validate(&self) -> Result<()> {
        if self.shortest_edge == 0 {
            return Err(EmbeddingError::invalid_config(
                "shortest_edge must be greater than zero",
            ));
        }
        if self.crop_width == 0 || self.crop_height == 0 {
            return Err(EmbeddingError::invalid_config(format!(
                "crop size must be non-zero, got {}x{}",
                self.crop_width, self.crop_height
            )));
        }
        if !self.rescale_factor.is_finite() {
            return Err(EmbeddingError::invalid_config(format!(
                "rescale_factor must be finite, got {}",
                self.rescale_factor
            )));
        }
        if self.image_mean.iter().any(|m| !m.is_finite()) {
            return Err(EmbeddingError::invalid_config(format!(
                "image_mean must be finite, got {:?}",
                self.image_mean
            )));
        }
        if self.image_std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(EmbeddingError::invalid_config(format!(
                "image_std must be positive, got {:?}",
                self.image_std
            )));
        }
        Ok(())
    }
}

/// Named-field construction for [`ProcessorConfig`]; starts from the defaults.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    pub fn do_resize(mut self, enabled: bool) -> Self {
        self.config.do_resize = enabled;
        self
    }

    pub fn shortest_edge(mut self, edge: u32) -> Self {
        self.config.shortest_edge = edge;
        self
    }

    pub fn resample(mut self, resample: Resample) -> Self {
        self.config.resample = resample;
        self
    }

    pub fn do_center_crop(mut self, enabled: bool) -> Self {
        self.config.do_center_crop = enabled;
        self
    }

    pub fn crop_size(mut self, width: u32, height: u32) -> Self {
        self.config.crop_width = width;
        self.config.crop_height = height;
        self
    }

    pub fn do_rescale(mut self, enabled: bool) -> Self {
        self.config.do_rescale = enabled;
        self
    }

    pub fn rescale_factor(mut self, factor: f32) -> Self {
        self.config.rescale_factor = factor;
        self
    }

    pub fn do_normalize(mut self, enabled: bool) -> Self {
        self.config.do_normalize = enabled;
        self
    }

    pub fn image_mean(mut self, mean: [f32; 3]) -> Self {
        self.config.image_mean = mean;
        self
    }

    pub fn image_std(mut self, std: [f32; 3]) -> Self {
        self.config.image_std = std;
        self
    }

    pub fn processor_type(mut self, name: impl Into<String>) -> Self {
        self.config.processor_type = Some(name.into());
        self
    }

    pub fn build(self) -> Result<ProcessorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct PreprocessorConfigFile {
    do_resize: bool,
    size: ShortestEdge,
    resample: Resample,
    do_center_crop: bool,
    crop_size: CropSize,
    do_rescale: bool,
    rescale_factor: f32,
    do_normalize: bool,
    image_mean: [f32; 3],
    image_std: [f32; 3],
    image_processor_type: Option<String>,
}

impl Default for PreprocessorConfigFile {
    fn default() -> Self {
        let defaults = ProcessorConfig::default();
        Self {
            do_resize: defaults.do_resize,
            size: ShortestEdge::default(),
            resample: defaults.resample,
            do_center_crop: defaults.do_center_crop,
            crop_size: CropSize::default(),
            do_rescale: defaults.do_rescale,
            rescale_factor: defaults.rescale_factor,
            do_normalize: defaults.do_normalize,
            image_mean: defaults.image_mean,
            image_std: defaults.image_std,
            image_processor_type: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct ShortestEdge {
    shortest_edge: u32,
}

impl Default for ShortestEdge {
    fn default() -> Self {
        Self { shortest_edge: 256 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct CropSize {
    height: u32,
    width: u32,
}

impl Default for CropSize {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
        }
    }
}

impl TryFrom<PreprocessorConfigFile> for ProcessorConfig {
    type Error = EmbeddingError;

    fn try_from(file: PreprocessorConfigFile) -> Result<Self> {
        let config = ProcessorConfig {
            do_resize: file.do_resize,
            shortest_edge: file.size.shortest_edge,
            resample: file.resample,
            do_center_crop: file.do_center_crop,
            crop_width: file.crop_size.width,
            crop_height: file.crop_size.height,
            do_rescale: file.do_rescale,
            rescale_factor: file.rescale_factor,
            do_normalize: file.do_normalize,
            image_mean: file.image_mean,
            image_std: file.image_std,
            processor_type: file.image_processor_type,
        };
        config.validate()?;
        Ok(config)
    }
}
