use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegPromptError {
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Json deser error: {0}")]
    JsonDeserError(#[from] serde_json::Error),
    #[error("degenerate image size {width}x{height}, both sides must be > 0")]
    DegenerateImage { width: u32, height: u32 },
    #[error("{points} point(s) but {labels} label(s), counts must match")]
    PointLabelMismatch { points: usize, labels: usize },
    #[error("the model accepts at most one box prompt, got {0}")]
    TooManyBoxes(usize),
    #[error("the model accepts at most one mask prompt, got {0}")]
    TooManyMasks(usize),
    #[error("mask prompt must be 256x256, got {width}x{height}")]
    BadMaskPromptSize { width: usize, height: usize },
    #[error("mask prompt must hold 256*256 values, got {0}")]
    BadMaskPromptLen(usize),
    #[error("prediction shape mismatch: {0}")]
    BadPredictionShape(String),
    #[error("cannot stack wire requests with differing prompt layouts")]
    HeterogeneousBatch,
}

pub type Result<T> = std::result::Result<T, SegPromptError>;
