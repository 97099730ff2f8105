use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::prompt::{BoxPrompt, Prompts};

/// a caption-matched region proposed by a detection model, in source-image
/// pixel space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoxPrompt,
    pub score: f32,
}

/// a grounding detector: given an image and a free-text caption, proposes
/// zero or more boxes believed to contain matching objects; its output feeds
/// the box-prompt slot of a segmentation request
pub trait BoxDetector {
    fn detect(&self, image: &DynamicImage, caption: &str) -> Result<Vec<Detection>>;
}

/// turn detections into prompt sets, one per detection, since the
/// segmentation contract takes at most one box per request
pub fn prompts_from_detections(detections: &[Detection]) -> Vec<Prompts> {
    detections
        .iter()
        .map(|d| Prompts::new().with_box(d.bbox))
        .collect()
}
