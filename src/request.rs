use candle_core::{DType, Device, Tensor};
use log::debug;

use crate::error::{Result, SegPromptError};
use crate::preprocess::{Canvas, MASK_INPUT_SIZE};
use crate::prompt::{BoxPrompt, MaskPrompt, PointPrompt, Prompts};

/// which of the model's two entry points the wire tensors are shaped for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPath {
    /// partial requests; absent prompt categories are omitted entirely
    Convenience,
    /// fully shaped tensors with explicit placeholders for absent categories
    Raw,
}

/// one validated segmentation request: a canvas plus prompts rescaled into
/// canvas space, with every prompt category an explicit optional field
pub struct SegmentationRequest {
    canvas: Canvas,
    points: Vec<PointPrompt>,
    box_prompt: Option<BoxPrompt>,
    mask_prompt: Option<MaskPrompt>,
}

impl SegmentationRequest {
    /// prompts are given in source-image pixel space and rescaled here
    pub fn new(canvas: Canvas, prompts: &Prompts) -> Result<Self> {
        prompts.validate()?;
        let prompts = prompts.to_canvas_space(canvas.transform());
        debug!(
            "request with {} point(s), box: {}, mask: {}",
            prompts.points.len(),
            !prompts.boxes.is_empty(),
            !prompts.masks.is_empty(),
        );
        Ok(Self {
            canvas,
            points: prompts.points,
            box_prompt: prompts.boxes.into_iter().next(),
            mask_prompt: prompts.masks.into_iter().next(),
        })
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// point prompts, already in canvas space
    pub fn points(&self) -> &[PointPrompt] {
        &self.points
    }

    pub fn box_prompt(&self) -> Option<&BoxPrompt> {
        self.box_prompt.as_ref()
    }

    pub fn mask_prompt(&self) -> Option<&MaskPrompt> {
        self.mask_prompt.as_ref()
    }

    /// lower the request into the tensors one of the two call paths expects
    pub fn to_wire(&self, path: CallPath, device: &Device) -> Result<WireRequest> {
        let images = self.canvas.batch()?;
        match path {
            CallPath::Convenience => {
                let (points, labels) = if self.points.is_empty() {
                    (None, None)
                } else {
                    let (coords, labels) = point_tensors(&self.points, device)?;
                    (Some(coords), Some(labels))
                };
                let boxes = match &self.box_prompt {
                    Some(b) => Some(box_tensor(b, device)?),
                    None => None,
                };
                let masks = match &self.mask_prompt {
                    Some(m) => Some(m.to_wire(device)?),
                    None => None,
                };
                Ok(WireRequest {
                    images,
                    points,
                    labels,
                    boxes,
                    masks,
                })
            }
            CallPath::Raw => {
                let mut points = self.points.clone();
                // the raw entry point wants at least one point when no box is
                // given; the placeholder carries the -1 label so the model
                // ignores it
                if self.box_prompt.is_none() {
                    points.push(PointPrompt::padding());
                }
                let (coords, labels) = point_tensors(&points, device)?;
                let side = MASK_INPUT_SIZE as usize;
                let boxes = match &self.box_prompt {
                    Some(b) => box_tensor(b, device)?,
                    None => Tensor::zeros((1, 0, 2, 2), DType::F32, device)?,
                };
                let masks = match &self.mask_prompt {
                    Some(m) => m.to_wire(device)?,
                    None => Tensor::zeros((1, 0, side, side, 1), DType::F32, device)?,
                };
                Ok(WireRequest {
                    images,
                    points: Some(coords),
                    labels: Some(labels),
                    boxes: Some(boxes),
                    masks: Some(masks),
                })
            }
        }
    }
}

fn point_tensors(points: &[PointPrompt], device: &Device) -> Result<(Tensor, Tensor)> {
    let n = points.len();
    let mut coords = Vec::with_capacity(n * 2);
    let mut labels = Vec::with_capacity(n);
    for point in points {
        coords.push(point.x);
        coords.push(point.y);
        labels.push(point.label.to_wire());
    }
    let coords = Tensor::from_vec(coords, (1, n, 2), device)?;
    let labels = Tensor::from_vec(labels, (1, n), device)?;
    Ok((coords, labels))
}

fn box_tensor(box_prompt: &BoxPrompt, device: &Device) -> Result<Tensor> {
    let [[x1, y1], [x2, y2]] = box_prompt.corners();
    Ok(Tensor::from_vec(vec![x1, y1, x2, y2], (1, 1, 2, 2), device)?)
}

/// the tensors actually handed to the segmentation service
///
/// Shapes, B being the batch size: `images` (B, 1024, 1024, 3),
/// `points` (B, N, 2), `labels` (B, N), `boxes` (B, 0..=1, 2, 2),
/// `masks` (B, 0..=1, 256, 256, 1).
pub struct WireRequest {
    pub images: Tensor,
    pub points: Option<Tensor>,
    pub labels: Option<Tensor>,
    pub boxes: Option<Tensor>,
    pub masks: Option<Tensor>,
}

impl WireRequest {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }

    /// concatenate congruent requests into one batched request; every member
    /// must carry the same prompt categories with the same per-image shapes
    pub fn stack(requests: &[Self]) -> Result<Self> {
        let first = match requests.first() {
            Some(first) => first,
            None => return Err(SegPromptError::HeterogeneousBatch),
        };
        let congruent = requests.iter().all(|r| {
            per_image_dims(&r.points) == per_image_dims(&first.points)
                && per_image_dims(&r.labels) == per_image_dims(&first.labels)
                && per_image_dims(&r.boxes) == per_image_dims(&first.boxes)
                && per_image_dims(&r.masks) == per_image_dims(&first.masks)
        });
        if !congruent {
            return Err(SegPromptError::HeterogeneousBatch);
        }
        let images: Vec<&Tensor> = requests.iter().map(|r| &r.images).collect();
        Ok(Self {
            images: Tensor::cat(&images, 0)?,
            points: cat_present(requests, |r| r.points.as_ref())?,
            labels: cat_present(requests, |r| r.labels.as_ref())?,
            boxes: cat_present(requests, |r| r.boxes.as_ref())?,
            masks: cat_present(requests, |r| r.masks.as_ref())?,
        })
    }
}

fn per_image_dims(tensor: &Option<Tensor>) -> Option<Vec<usize>> {
    tensor.as_ref().map(|t| t.dims()[1..].to_vec())
}

fn cat_present<'a>(
    requests: &'a [WireRequest],
    get: impl Fn(&'a WireRequest) -> Option<&'a Tensor>,
) -> Result<Option<Tensor>> {
    let tensors: Vec<&Tensor> = requests.iter().filter_map(get).collect();
    if tensors.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tensor::cat(&tensors, 0)?))
}
