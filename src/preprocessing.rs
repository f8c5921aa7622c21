//! Image preprocessing pipeline.
//!
//! Turns a decoded image into the `[1, 3, H, W]` float tensor MobileNetV2
//! expects. Every stage is a free function so it can be exercised on its own;
//! [`preprocess`] chains them according to a [`ProcessorConfig`].

use std::borrow::Cow;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageError, ImageReader};
use ndarray::{Array3, Array4, Axis};

use crate::error::{EmbeddingError, Result};
use crate::processor_config::{ProcessorConfig, Resample};

/// Decodes the image at `path` and runs it through [`preprocess`].
pub fn preprocess_path(path: impl AsRef<Path>, config: &ProcessorConfig) -> Result<Array4<f32>> {
    let image = load_image(path)?;
    preprocess(&image, config)
}

/// Runs the full pipeline: resize, center crop, RGB extraction, rescale,
/// normalize and NCHW conversion.
pub fn preprocess(image: &DynamicImage, config: &ProcessorConfig) -> Result<Array4<f32>> {
    ensure_non_empty(image)?;

    let mut current = Cow::Borrowed(image);

    if config.do_resize() {
        current = Cow::Owned(resize_shortest_edge(
            &current,
            config.shortest_edge(),
            config.resample(),
        )?);
    }

    if config.do_center_crop() {
        current = Cow::Owned(center_crop(
            &current,
            config.crop_width(),
            config.crop_height(),
        )?);
    }

    let pixels = extract_rgb(&current)?;

    // Without rescaling the values still become floats, unscaled.
    let factor = if config.do_rescale() {
        config.rescale_factor()
    } else {
        1.0
    };
    let mut pixels = rescale(&pixels, factor);

    if config.do_normalize() {
        pixels = normalize(pixels, config.image_mean(), config.image_std());
    }

    let tensor = to_nchw(pixels);
    tracing::debug!(shape = ?tensor.shape(), "preprocessing finished");
    Ok(tensor)
}

pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EmbeddingError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "image file does not exist"),
        ));
    }
    // Format comes from the file contents, not the extension.
    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| EmbeddingError::io(path, e))?;
    reader.decode().map_err(|source| match source {
        ImageError::IoError(err) => EmbeddingError::io(path, err),
        other => EmbeddingError::Decode {
            path: path.to_path_buf(),
            source: other,
        },
    })
}

/// Scales the image so its shorter side equals `shortest_edge`.
///
/// The longer side is rounded on its own, so the aspect ratio may drift by
/// up to half a pixel.
pub fn resize_shortest_edge(
    image: &DynamicImage,
    shortest_edge: u32,
    resample: Resample,
) -> Result<DynamicImage> {
    ensure_non_empty(image)?;
    let (width, height) = image.dimensions();

    let scale = shortest_edge as f32 / width.min(height) as f32;
    let new_width = (width as f32 * scale).round() as u32;
    let new_height = (height as f32 * scale).round() as u32;

    tracing::debug!(
        from = ?(width, height),
        to = ?(new_width, new_height),
        ?resample,
        "resize by shortest edge"
    );

    if (new_width, new_height) == (width, height) {
        return Ok(image.clone());
    }
    Ok(image.resize_exact(new_width, new_height, resample.filter_type()))
}

/// Cuts a `crop_width x crop_height` window out of the middle of the image.
///
/// Offsets use truncating division, so odd differences lean towards the
/// top-left corner.
pub fn center_crop(image: &DynamicImage, crop_width: u32, crop_height: u32) -> Result<DynamicImage> {
    let (width, height) = image.dimensions();
    if width < crop_width || height < crop_height {
        return Err(EmbeddingError::invalid_config(format!(
            "image size ({width}, {height}) is smaller than crop size ({crop_width}, {crop_height})"
        )));
    }

    let start_x = (width - crop_width) / 2;
    let start_y = (height - crop_height) / 2;
    tracing::debug!(start_x, start_y, crop_width, crop_height, "center crop");

    Ok(image.crop_imm(start_x, start_y, crop_width, crop_height))
}

/// Extracts the RGB channels as an `H x W x 3` array; alpha is dropped.
pub fn extract_rgb(image: &DynamicImage) -> Result<Array3<u8>> {
    let rgb_image = image.to_rgb8();
    let (width, height) = rgb_image.dimensions();
    let pixels = Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        rgb_image.into_raw(),
    )?;
    Ok(pixels)
}

pub fn rescale(pixels: &Array3<u8>, factor: f32) -> Array3<f32> {
    pixels.mapv(|value| f32::from(value) * factor)
}

/// Applies `(value - mean[c]) / std[c]` per channel of an `H x W x 3` array.
pub fn normalize(mut pixels: Array3<f32>, mean: [f32; 3], std: [f32; 3]) -> Array3<f32> {
    for (c, mut channel) in pixels.axis_iter_mut(Axis(2)).enumerate() {
        channel.mapv_inplace(|value| (value - mean[c]) / std[c]);
    }
    pixels
}

/// Reorders `H x W x C` into a standard-layout `1 x C x H x W` tensor.
pub fn to_nchw(pixels: Array3<f32>) -> Array4<f32> {
    let chw = pixels.permuted_axes([2, 0, 1]);
    let chw = chw.as_standard_layout().into_owned();
    chw.insert_axis(Axis(0))
}

/// Flattens a tensor in batch, channel, row, column order.
pub fn flatten(tensor: &Array4<f32>) -> Vec<f32> {
    tensor.iter().copied().collect()
}

fn ensure_non_empty(image: &DynamicImage) -> Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EmbeddingError::invalid_config(format!(
            "image must not be empty, got {width}x{height}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    /// Image whose red channel holds x and green channel holds y.
    fn coordinate_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([x as u8, y as u8, 7])
        }))
    }

    fn no_resize_no_crop() -> ProcessorConfig {
        ProcessorConfig::builder()
            .do_resize(false)
            .do_center_crop(false)
            .build()
            .unwrap()
    }

    #[test]
    fn resize_scales_shorter_side_to_target() {
        let image = coordinate_image(300, 200);
        let resized = resize_shortest_edge(&image, 256, Resample::Bilinear).unwrap();
        assert_eq!(resized.dimensions(), (384, 256));

        let portrait = coordinate_image(200, 300);
        let resized = resize_shortest_edge(&portrait, 256, Resample::Nearest).unwrap();
        assert_eq!(resized.dimensions(), (256, 384));
    }

    #[test]
    fn resize_is_identity_when_shorter_side_matches() {
        let image = coordinate_image(240, 120);
        let resized = resize_shortest_edge(&image, 120, Resample::Bicubic).unwrap();
        assert_eq!(resized.dimensions(), (240, 120));
        assert_eq!(resized.to_rgb8(), image.to_rgb8());
    }

    #[test]
    fn resize_rounds_longer_side() {
        // 333 * (224 / 100) = 745.92
        let image = coordinate_image(333, 100);
        let resized = resize_shortest_edge(&image, 224, Resample::Bilinear).unwrap();
        assert_eq!(resized.dimensions(), (746, 224));
    }

    #[test]
    fn center_crop_truncates_odd_offsets() {
        let image = coordinate_image(10, 7);
        let cropped = center_crop(&image, 4, 4).unwrap();
        assert_eq!(cropped.dimensions(), (4, 4));

        let rgb = cropped.to_rgb8();
        // (10 - 4) / 2 = 3, (7 - 4) / 2 = 1
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([3, 1, 7]));
        assert_eq!(rgb.get_pixel(3, 3), &Rgb([6, 4, 7]));
    }

    #[test]
    fn center_crop_rejects_oversized_window() {
        let image = coordinate_image(100, 100);
        let err = center_crop(&image, 224, 224).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidConfig(_)));
        assert!(err.to_string().contains("(100, 100)"));
    }

    #[test]
    fn extract_rgb_drops_alpha() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 3, Rgba([10, 20, 30, 40])));
        let pixels = extract_rgb(&image).unwrap();
        assert_eq!(pixels.shape(), &[3, 2, 3]);
        assert_eq!(pixels[[2, 1, 0]], 10);
        assert_eq!(pixels[[2, 1, 1]], 20);
        assert_eq!(pixels[[2, 1, 2]], 30);
    }

    #[test]
    fn rescale_and_normalize_map_bytes_to_unit_range() {
        let pixels = Array3::from_shape_vec((1, 2, 3), vec![0, 0, 0, 255, 255, 255]).unwrap();
        let scaled = rescale(&pixels, 1.0 / 255.0);
        let normalized = normalize(scaled, [0.5; 3], [0.5; 3]);
        for c in 0..3 {
            assert!((normalized[[0, 0, c]] + 1.0).abs() < 1e-6);
            assert!((normalized[[0, 1, c]] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn normalize_uses_per_channel_statistics() {
        let pixels = Array3::from_elem((1, 1, 3), 1.0_f32);
        let normalized = normalize(pixels, [0.0, 0.5, 1.0], [1.0, 0.25, 2.0]);
        assert_eq!(normalized[[0, 0, 0]], 1.0);
        assert_eq!(normalized[[0, 0, 1]], 2.0);
        assert_eq!(normalized[[0, 0, 2]], 0.0);
    }

    #[test]
    fn disabled_rescale_still_produces_floats() {
        let config = ProcessorConfig::builder()
            .do_resize(false)
            .do_center_crop(false)
            .do_rescale(false)
            .do_normalize(false)
            .build()
            .unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([255, 128, 0])));
        let tensor = preprocess(&image, &config).unwrap();
        assert_eq!(tensor[[0, 0, 1, 1]], 255.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 128.0);
        assert_eq!(tensor[[0, 2, 1, 0]], 0.0);
    }

    #[test]
    fn nchw_layout_matches_source_pixels() {
        let image = coordinate_image(5, 3);
        let config = no_resize_no_crop();
        let tensor = preprocess(&image, &config).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 3, 5]);

        let hwc = normalize(
            rescale(&extract_rgb(&image).unwrap(), config.rescale_factor()),
            config.image_mean(),
            config.image_std(),
        );
        let flat = flatten(&tensor);
        let (height, width) = (3, 5);
        for c in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let expected = hwc[[y, x, c]];
                    assert_eq!(tensor[[0, c, y, x]], expected);
                    assert_eq!(flat[c * height * width + y * width + x], expected);
                }
            }
        }
    }

    #[test]
    fn preprocess_rejects_empty_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 10));
        let err = preprocess(&image, &ProcessorConfig::default()).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidConfig(_)));
    }

    #[test]
    fn preprocess_fails_when_crop_exceeds_unresized_image() {
        let config = ProcessorConfig::builder().do_resize(false).build().unwrap();
        let image = coordinate_image(100, 100);
        assert!(matches!(
            preprocess(&image, &config),
            Err(EmbeddingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_pipeline_produces_crop_sized_tensor() {
        let image = coordinate_image(100, 100);
        let tensor = preprocess(&image, &ProcessorConfig::default()).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }
}
