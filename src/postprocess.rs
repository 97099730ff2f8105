use candle_core::{DType, Device, Tensor};
use image::imageops::{crop_imm, resize, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::preprocess::{ImageTransform, CANVAS_SIZE};
use crate::prompt::BoxPrompt;

type LumaF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

fn tensor_to_luma(tensor: &Tensor) -> Result<LumaF32> {
    let (height, width) = tensor.dims2()?;
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(LumaF32::from_raw(width as u32, height as u32, data).expect("tensor length matches dims"))
}

fn luma_to_tensor(image: LumaF32, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    Ok(Tensor::from_vec(
        image.into_raw(),
        (height as usize, width as usize),
        device,
    )?)
}

/// upsample 256x256 mask logits to canvas resolution and crop away the
/// padded border, leaving logits covering exactly the resized image region
pub fn upscale_mask(logits: &Tensor, transform: ImageTransform, device: &Device) -> Result<Tensor> {
    let luma = tensor_to_luma(logits)?;
    let upsampled = resize(&luma, CANVAS_SIZE, CANVAS_SIZE, FilterType::Triangle);
    let cropped = crop_imm(
        &upsampled,
        0,
        0,
        transform.resized_width,
        transform.resized_height,
    )
    .to_image();
    luma_to_tensor(cropped, device)
}

/// rescale cropped logits the rest of the way to source resolution
pub fn mask_to_source(logits: &Tensor, transform: ImageTransform, device: &Device) -> Result<Tensor> {
    let luma = tensor_to_luma(logits)?;
    let resized = resize(
        &luma,
        transform.source_width,
        transform.source_height,
        FilterType::Triangle,
    );
    luma_to_tensor(resized, device)
}

/// the full output path: upsample, crop the padding, rescale to the source
/// image frame, so the result aligns pixel-for-pixel with the original image
pub fn postprocess_mask(
    logits: &Tensor,
    transform: ImageTransform,
    device: &Device,
) -> Result<Tensor> {
    debug!(
        "postprocessing mask logits back to {}x{}",
        transform.source_width, transform.source_height,
    );
    let cropped = upscale_mask(logits, transform, device)?;
    mask_to_source(&cropped, transform, device)
}

/// binarize logits with a strict > 0.0 threshold; idempotent over masks that
/// are already 0/1 valued
pub fn threshold_mask(logits: &Tensor) -> Result<Mask> {
    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let height = rows.len() as u32;
    let width = rows.first().map(|r| r.len()).unwrap_or(0) as u32;
    let data = rows.iter().flatten().map(|v| *v > 0.0).collect();
    Ok(Mask {
        width,
        height,
        data,
    })
}

/// a boolean segmentation mask, row major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    pub fn pixel_count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }

    /// the tight bounding box around the mask, usable as the box prompt of a
    /// follow-up request
    pub fn bbox(&self) -> Option<BoxPrompt> {
        let mut min_x = self.width;
        let mut max_x = 0;
        let mut min_y = self.height;
        let mut max_y = 0;
        let mut found = false;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    found = true;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }
        found.then(|| {
            BoxPrompt::new(
                min_x as f32,
                min_y as f32,
                (max_x + 1) as f32,
                (max_y + 1) as f32,
            )
        })
    }

    /// the mask as a 0/1 valued f32 tensor of shape (height, width)
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = self.data.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        Ok(Tensor::from_vec(
            data,
            (self.height as usize, self.width as usize),
            device,
        )?)
    }
}

/// write a mask as a black/white grayscale image
pub fn save_mask_image<P: AsRef<Path>>(mask: &Mask, path: P) -> Result<()> {
    let mut image = GrayImage::new(mask.width, mask.height);
    for y in 0..mask.height {
        for x in 0..mask.width {
            let value = if mask.get(x, y) { 255 } else { 0 };
            image.put_pixel(x, y, Luma([value]));
        }
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::MASK_INPUT_SIZE;

    fn constant_logits(value: f32) -> Tensor {
        let side = MASK_INPUT_SIZE as usize;
        Tensor::from_vec(vec![value; side * side], (side, side), &Device::Cpu).unwrap()
    }

    #[test]
    fn upscale_covers_the_unpadded_region() {
        let transform = ImageTransform::new(800, 600).unwrap();
        let cropped = upscale_mask(&constant_logits(1.0), transform, &Device::Cpu).unwrap();
        assert_eq!(cropped.dims(), &[768, 1024]);
    }

    #[test]
    fn postprocessed_mask_aligns_with_the_source_frame() {
        let transform = ImageTransform::new(800, 600).unwrap();
        let logits = postprocess_mask(&constant_logits(5.0), transform, &Device::Cpu).unwrap();
        assert_eq!(logits.dims(), &[600, 800]);
        let mask = threshold_mask(&logits).unwrap();
        assert_eq!((mask.width, mask.height), (800, 600));
        assert_eq!(mask.pixel_count(), 800 * 600);
    }

    #[test]
    fn negative_logits_threshold_to_an_empty_mask() {
        let transform = ImageTransform::new(640, 480).unwrap();
        let logits = postprocess_mask(&constant_logits(-3.0), transform, &Device::Cpu).unwrap();
        let mask = threshold_mask(&logits).unwrap();
        assert_eq!(mask.pixel_count(), 0);
        assert_eq!(mask.bbox(), None);
    }

    #[test]
    fn thresholding_is_idempotent_over_boolean_masks() {
        let mask = Mask {
            width: 4,
            height: 3,
            data: vec![
                true, false, false, true, //
                false, true, true, false, //
                false, false, false, true,
            ],
        };
        let again = threshold_mask(&mask.to_tensor(&Device::Cpu).unwrap()).unwrap();
        assert_eq!(again, mask);
    }

    #[test]
    fn bbox_hugs_the_set_pixels() {
        let mut data = vec![false; 25];
        data[7] = true; // (2, 1)
        data[18] = true; // (3, 3)
        let mask = Mask {
            width: 5,
            height: 5,
            data,
        };
        let bbox = mask.bbox().unwrap();
        assert_eq!((bbox.x1, bbox.y1, bbox.x2, bbox.y2), (2.0, 1.0, 4.0, 4.0));
        assert_eq!(mask.pixel_count(), 2);
    }

    #[test]
    fn out_of_bounds_lookups_are_false() {
        let mask = Mask {
            width: 2,
            height: 2,
            data: vec![true; 4],
        };
        assert!(!mask.get(2, 0));
        assert!(!mask.get(0, 5));
    }
}
