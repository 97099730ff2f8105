use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegPromptError};
use crate::preprocess::{ImageTransform, MASK_INPUT_SIZE};

/// label attached to a point prompt; `Padding` marks the placeholder point the
/// raw wire contract requires and must never be treated as a real background
/// point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointLabel {
    Background,
    Foreground,
    Padding,
}

impl PointLabel {
    /// the wire encoding: foreground 1, background 0, padding -1
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Background => 0,
            Self::Foreground => 1,
            Self::Padding => -1,
        }
    }
}

/// a labeled (x, y) point, in source-image pixel space unless stated otherwise
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPrompt {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl PointPrompt {
    pub fn foreground(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Foreground,
        }
    }

    pub fn background(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Background,
        }
    }

    pub(crate) fn padding() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            label: PointLabel::Padding,
        }
    }

    pub fn scaled(&self, transform: ImageTransform) -> Self {
        let (x, y) = transform.to_canvas(self.x, self.y);
        Self {
            x,
            y,
            label: self.label,
        }
    }
}

/// one bounding region, top-left and bottom-right corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxPrompt {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoxPrompt {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn scaled(&self, transform: ImageTransform) -> Self {
        let (x1, y1) = transform.to_canvas(self.x1, self.y1);
        let (x2, y2) = transform.to_canvas(self.x2, self.y2);
        Self { x1, y1, x2, y2 }
    }

    /// corner pairs in wire order: [[x1, y1], [x2, y2]]
    pub fn corners(&self) -> [[f32; 2]; 2] {
        [[self.x1, self.y1], [self.x2, self.y2]]
    }
}

/// a low-resolution mask hint, 256x256, single channel, row-major logits
#[derive(Debug, Clone, PartialEq)]
pub struct MaskPrompt {
    data: Vec<f32>,
}

impl MaskPrompt {
    pub fn new(data: Vec<f32>) -> Result<Self> {
        let side = MASK_INPUT_SIZE as usize;
        if data.len() != side * side {
            return Err(SegPromptError::BadMaskPromptLen(data.len()));
        }
        Ok(Self { data })
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (height, width) = tensor.dims2()?;
        let side = MASK_INPUT_SIZE as usize;
        if (height, width) != (side, side) {
            return Err(SegPromptError::BadMaskPromptSize { width, height });
        }
        let data = tensor.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { data })
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// the wire tensor, shape (1, 1, 256, 256, 1)
    pub fn to_wire(&self, device: &Device) -> Result<Tensor> {
        let side = MASK_INPUT_SIZE as usize;
        Ok(Tensor::from_vec(
            self.data.clone(),
            (1, 1, side, side, 1),
            device,
        )?)
    }
}

/// the full prompt set for one image, in source-image pixel space
#[derive(Debug, Clone, Default)]
pub struct Prompts {
    pub points: Vec<PointPrompt>,
    pub boxes: Vec<BoxPrompt>,
    pub masks: Vec<MaskPrompt>,
}

impl Prompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(mut self, point: PointPrompt) -> Self {
        self.points.push(point);
        self
    }

    pub fn with_box(mut self, box_prompt: BoxPrompt) -> Self {
        self.boxes.push(box_prompt);
        self
    }

    pub fn with_mask(mut self, mask: MaskPrompt) -> Self {
        self.masks.push(mask);
        self
    }

    /// build from parallel coordinate/label lists, rejecting length mismatch
    pub fn from_parts(
        points: Vec<(f32, f32)>,
        labels: Vec<PointLabel>,
        boxes: Vec<BoxPrompt>,
        masks: Vec<MaskPrompt>,
    ) -> Result<Self> {
        if points.len() != labels.len() {
            return Err(SegPromptError::PointLabelMismatch {
                points: points.len(),
                labels: labels.len(),
            });
        }
        let points = points
            .into_iter()
            .zip(labels)
            .map(|((x, y), label)| PointPrompt { x, y, label })
            .collect();
        let prompts = Self {
            points,
            boxes,
            masks,
        };
        prompts.validate()?;
        Ok(prompts)
    }

    /// the model contract accepts at most one box and one mask prompt
    pub fn validate(&self) -> Result<()> {
        if self.boxes.len() > 1 {
            return Err(SegPromptError::TooManyBoxes(self.boxes.len()));
        }
        if self.masks.len() > 1 {
            return Err(SegPromptError::TooManyMasks(self.masks.len()));
        }
        Ok(())
    }

    /// rescale point and box coordinates into canvas space; mask prompts are
    /// already in the model's fixed 256x256 frame and pass through unchanged
    pub fn to_canvas_space(&self, transform: ImageTransform) -> Self {
        Self {
            points: self.points.iter().map(|p| p.scaled(transform)).collect(),
            boxes: self.boxes.iter().map(|b| b.scaled(transform)).collect(),
            masks: self.masks.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.boxes.is_empty() && self.masks.is_empty()
    }
}
