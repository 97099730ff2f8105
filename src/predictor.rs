use candle_core::{DType, Device, IndexOp, Tensor};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Result, SegPromptError};
use crate::preprocess::MASK_INPUT_SIZE;
use crate::request::WireRequest;

/// number of candidate masks the segmentation model proposes per image
pub const NUM_CANDIDATES: usize = 4;

/// explicit device and precision settings, passed to a backend at
/// construction time rather than read from process-wide state
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub device: Device,
    pub dtype: DType,
}

impl PredictorConfig {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }
}

/// the segmentation service's response: mask logits of shape
/// (B, 4, 256, 256) and one confidence score per candidate, shape (B, 4)
pub struct Prediction {
    masks: Tensor,
    iou_pred: Tensor,
}

impl Prediction {
    pub fn new(masks: Tensor, iou_pred: Tensor) -> Result<Self> {
        let (batch, candidates, height, width) = masks.dims4()?;
        let (score_batch, score_candidates) = iou_pred.dims2()?;
        let side = MASK_INPUT_SIZE as usize;
        if candidates != NUM_CANDIDATES
            || score_candidates != NUM_CANDIDATES
            || height != side
            || width != side
            || batch != score_batch
        {
            return Err(SegPromptError::BadPredictionShape(format!(
                "masks {:?}, iou_pred {:?}",
                masks.dims(),
                iou_pred.dims(),
            )));
        }
        Ok(Self { masks, iou_pred })
    }

    pub fn batch_size(&self) -> usize {
        self.masks.dims()[0]
    }

    pub fn masks(&self) -> &Tensor {
        &self.masks
    }

    pub fn iou_pred(&self) -> &Tensor {
        &self.iou_pred
    }

    /// confidence scores for one image of the batch
    pub fn scores(&self, image: usize) -> Result<Vec<f32>> {
        Ok(self.iou_pred.i(image)?.to_vec1::<f32>()?)
    }

    /// the raw 256x256 logits of one candidate
    pub fn candidate(&self, image: usize, candidate: usize) -> Result<Tensor> {
        Ok(self.masks.i((image, candidate))?)
    }

    /// the highest-confidence candidate and its score
    pub fn best(&self, image: usize) -> Result<(Tensor, f32)> {
        let scores = self.scores(image)?;
        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }
        debug!("best candidate {} with score {}", best, scores[best]);
        Ok((self.candidate(image, best)?, scores[best]))
    }
}

/// a service that turns a wire request into candidate masks; real model
/// backends and test doubles both live behind this
pub trait MaskPredictor {
    fn predict(&self, request: &WireRequest) -> Result<Prediction>;
}

/// on-disk form of a prediction, nested row-major: masks (B, 4, 256, 256),
/// iou_pred (B, 4)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPrediction {
    pub masks: Vec<Vec<Vec<Vec<f32>>>>,
    pub iou_pred: Vec<Vec<f32>>,
}

/// serves previously captured logits instead of running a network; used for
/// offline postprocessing and for exercising the pipeline in tests
pub struct ReplayPredictor {
    prediction: StoredPrediction,
    config: PredictorConfig,
}

impl ReplayPredictor {
    pub fn new(prediction: StoredPrediction, config: PredictorConfig) -> Self {
        Self { prediction, config }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P, config: PredictorConfig) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let prediction = serde_json::from_reader(reader)?;
        Ok(Self::new(prediction, config))
    }
}

impl MaskPredictor for ReplayPredictor {
    fn predict(&self, request: &WireRequest) -> Result<Prediction> {
        let batch = self.prediction.masks.len();
        if request.batch_size() != batch {
            return Err(SegPromptError::BadPredictionShape(format!(
                "stored batch {} but request batch {}",
                batch,
                request.batch_size(),
            )));
        }
        let side = MASK_INPUT_SIZE as usize;
        let mut mask_data = Vec::with_capacity(batch * NUM_CANDIDATES * side * side);
        for image in &self.prediction.masks {
            for candidate in image {
                for row in candidate {
                    mask_data.extend_from_slice(row);
                }
            }
        }
        let mut score_data = Vec::with_capacity(batch * NUM_CANDIDATES);
        for image in &self.prediction.iou_pred {
            score_data.extend_from_slice(image);
        }
        let masks = Tensor::from_vec(
            mask_data,
            (batch, NUM_CANDIDATES, side, side),
            &self.config.device,
        )?
        .to_dtype(self.config.dtype)?;
        let iou_pred = Tensor::from_vec(
            score_data,
            (batch, NUM_CANDIDATES),
            &self.config.device,
        )?;
        Prediction::new(masks, iou_pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_prediction(batch: usize, scores: Vec<Vec<f32>>) -> StoredPrediction {
        let side = MASK_INPUT_SIZE as usize;
        let candidate = vec![vec![0.0f32; side]; side];
        StoredPrediction {
            masks: vec![vec![candidate; NUM_CANDIDATES]; batch],
            iou_pred: scores,
        }
    }

    #[test]
    fn best_candidate_follows_the_scores() {
        let side = MASK_INPUT_SIZE as usize;
        let masks = Tensor::zeros((1, NUM_CANDIDATES, side, side), DType::F32, &Device::Cpu)
            .unwrap();
        let iou_pred =
            Tensor::from_vec(vec![0.1f32, 0.9, 0.3, 0.2], (1, NUM_CANDIDATES), &Device::Cpu)
                .unwrap();
        let prediction = Prediction::new(masks, iou_pred).unwrap();
        let (_, score) = prediction.best(0).unwrap();
        assert_eq!(score, 0.9);
        assert_eq!(prediction.scores(0).unwrap(), vec![0.1, 0.9, 0.3, 0.2]);
    }

    #[test]
    fn wrong_candidate_count_is_rejected() {
        let side = MASK_INPUT_SIZE as usize;
        let masks = Tensor::zeros((1, 3, side, side), DType::F32, &Device::Cpu).unwrap();
        let iou_pred = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            Prediction::new(masks, iou_pred),
            Err(SegPromptError::BadPredictionShape(_))
        ));
    }

    #[test]
    fn replay_round_trips_through_json() {
        let stored = flat_prediction(1, vec![vec![0.4, 0.1, 0.2, 0.3]]);
        let json = serde_json::to_string(&stored).unwrap();
        let parsed: StoredPrediction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.iou_pred, stored.iou_pred);
    }

    #[test]
    fn replay_rejects_mismatched_batch() {
        use crate::preprocess::Canvas;
        use crate::prompt::Prompts;
        use crate::request::{CallPath, SegmentationRequest};
        use image::{DynamicImage, RgbImage};

        let stored = flat_prediction(2, vec![vec![0.0; NUM_CANDIDATES]; 2]);
        let predictor = ReplayPredictor::new(stored, PredictorConfig::cpu());

        let image =
            DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, image::Rgb([0, 0, 0])));
        let canvas = Canvas::from_image(&image, &Device::Cpu).unwrap();
        let request = SegmentationRequest::new(canvas, &Prompts::new()).unwrap();
        let wire = request.to_wire(CallPath::Convenience, &Device::Cpu).unwrap();
        assert!(predictor.predict(&wire).is_err());
    }
}
