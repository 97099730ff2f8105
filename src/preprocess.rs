use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageReader, RgbImage};
use log::debug;
use std::path::Path;

use crate::error::{Result, SegPromptError};

/// side length of the square canvas fed to the segmentation model
pub const CANVAS_SIZE: u32 = 1024;
/// resolution of mask prompts and of the model's raw mask logits
pub const MASK_INPUT_SIZE: u32 = 256;
/// per-channel pixel mean the segmentation model normalizes with
pub const IMAGE_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
/// per-channel pixel standard deviation the segmentation model normalizes with
pub const IMAGE_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// mapping from a source image's pixel frame into the canvas frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTransform {
    pub source_width: u32,
    pub source_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub scale: f32,
}

impl ImageTransform {
    pub fn new(source_width: u32, source_height: u32) -> Result<Self> {
        if source_width == 0 || source_height == 0 {
            return Err(SegPromptError::DegenerateImage {
                width: source_width,
                height: source_height,
            });
        }
        let scale = CANVAS_SIZE as f32 / source_width.max(source_height) as f32;
        // round half up, matching the reference resize exactly
        let resized_width = (source_width as f32 * scale + 0.5) as u32;
        let resized_height = (source_height as f32 * scale + 0.5) as u32;
        Ok(Self {
            source_width,
            source_height,
            resized_width,
            resized_height,
            scale,
        })
    }

    /// map a source-space coordinate into canvas space
    pub fn to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale, y * self.scale)
    }
}

/// load an image from a path
pub fn read_image<P: AsRef<Path>>(image_path: P) -> Result<DynamicImage> {
    Ok(ImageReader::open(image_path)?.decode()?)
}

/// resize an image so its longer side equals [CANVAS_SIZE], preserving aspect
/// ratio, without padding; this is also the geometry mask logits are upsampled
/// through on the way back out
pub fn resize_to_canvas_scale(image: &DynamicImage) -> Result<(DynamicImage, ImageTransform)> {
    let (width, height) = image.dimensions();
    let transform = ImageTransform::new(width, height)?;
    if (width, height) == (transform.resized_width, transform.resized_height) {
        return Ok((image.clone(), transform));
    }
    let resized = image.resize_exact(
        transform.resized_width,
        transform.resized_height,
        FilterType::Triangle,
    );
    Ok((resized, transform))
}

/// a [CANVAS_SIZE]x[CANVAS_SIZE]x3 image tensor ready for the segmentation
/// model, with the transform that produced it
///
/// Pixel values stay in the source numeric range (0..255); the model applies
/// its own mean/std normalization. The bottom/right padding holds the
/// per-channel mean, the one value that normalizes to zero inside the model.
pub struct Canvas {
    tensor: Tensor,
    transform: ImageTransform,
}

impl Canvas {
    pub fn from_image(image: &DynamicImage, device: &Device) -> Result<Self> {
        let (resized, transform) = resize_to_canvas_scale(image)?;
        debug!(
            "canvas from {}x{} image, resized to {}x{} (scale {})",
            transform.source_width,
            transform.source_height,
            transform.resized_width,
            transform.resized_height,
            transform.scale,
        );
        let rgb = resized.to_rgb8();
        let size = CANVAS_SIZE as usize;
        let mut data = vec![0f32; size * size * 3];
        for (i, value) in data.iter_mut().enumerate() {
            *value = IMAGE_MEAN[i % 3];
        }
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let base = (y as usize * size + x as usize) * 3;
            data[base] = pixel[0] as f32;
            data[base + 1] = pixel[1] as f32;
            data[base + 2] = pixel[2] as f32;
        }
        let tensor = Tensor::from_vec(data, (size, size, 3), device)?;
        Ok(Self { tensor, transform })
    }

    /// the (1024, 1024, 3) canvas tensor
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn transform(&self) -> ImageTransform {
        self.transform
    }

    /// the canvas with a leading batch dimension, shape (1, 1024, 1024, 3)
    pub fn batch(&self) -> Result<Tensor> {
        Ok(self.tensor.unsqueeze(0)?)
    }

    /// render the canvas back into an 8-bit RGB image
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let data = self.tensor.to_vec3::<f32>()?;
        let size = CANVAS_SIZE;
        let mut image = RgbImage::new(size, size);
        for (y, row) in data.iter().enumerate() {
            for (x, pixel) in row.iter().enumerate() {
                let rgb = image::Rgb([
                    pixel[0].clamp(0.0, 255.0) as u8,
                    pixel[1].clamp(0.0, 255.0) as u8,
                    pixel[2].clamp(0.0, 255.0) as u8,
                ]);
                image.put_pixel(x as u32, y as u32, rgb);
            }
        }
        Ok(image)
    }
}
