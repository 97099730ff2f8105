use candle_core::Device;
use float_cmp::approx_eq;
use image::{DynamicImage, RgbImage};

use segprompt::postprocess::{postprocess_mask, threshold_mask, upscale_mask};
use segprompt::predictor::{
    MaskPredictor, PredictorConfig, ReplayPredictor, StoredPrediction, NUM_CANDIDATES,
};
use segprompt::preprocess::{Canvas, MASK_INPUT_SIZE};
use segprompt::prompt::{BoxPrompt, PointLabel, PointPrompt, Prompts};
use segprompt::request::{CallPath, SegmentationRequest};

fn test_image() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(800, 600, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

#[test]
fn point_prompt_end_to_end() {
    let canvas = Canvas::from_image(&test_image(), &Device::Cpu).unwrap();
    let transform = canvas.transform();
    assert!(approx_eq!(f32, transform.scale, 1.28));
    assert_eq!(
        (transform.resized_width, transform.resized_height),
        (1024, 768)
    );

    let prompts = Prompts::new().with_point(PointPrompt::foreground(284.0, 213.0));
    let request = SegmentationRequest::new(canvas, &prompts).unwrap();

    // the point travels to the model in canvas space
    assert_eq!(request.points()[0].x, 284.0 * 1.28);
    assert_eq!(request.points()[0].y, 213.0 * 1.28);
    assert_eq!(request.points()[0].label, PointLabel::Foreground);

    let wire = request.to_wire(CallPath::Raw, &Device::Cpu).unwrap();
    assert_eq!(wire.images.dims(), &[1, 1024, 1024, 3]);
    // raw path: real point plus the injected placeholder
    let labels = wire.labels.unwrap().to_vec2::<i64>().unwrap();
    assert_eq!(labels[0], vec![1, -1]);
}

#[test]
fn box_prompt_end_to_end() {
    let canvas = Canvas::from_image(&test_image(), &Device::Cpu).unwrap();
    let prompts = Prompts::new().with_box(BoxPrompt::new(240.0, 340.0, 400.0, 500.0));
    let request = SegmentationRequest::new(canvas, &prompts).unwrap();

    let scaled = request.box_prompt().unwrap();
    assert_eq!(
        scaled.corners(),
        [[240.0 * 1.28, 340.0 * 1.28], [400.0 * 1.28, 500.0 * 1.28]]
    );

    let wire = request.to_wire(CallPath::Convenience, &Device::Cpu).unwrap();
    assert_eq!(wire.boxes.unwrap().dims(), &[1, 1, 2, 2]);
    assert!(wire.points.is_none());
    assert!(wire.masks.is_none());
}

#[test]
fn best_candidate_is_selected_and_mapped_back_to_the_source_frame() {
    let side = MASK_INPUT_SIZE as usize;

    // candidate 1 marks the top half of the canvas, every other candidate is
    // empty; the scores point at candidate 1
    let empty = vec![vec![-8.0f32; side]; side];
    let mut top_half = vec![vec![-8.0f32; side]; side];
    for row in top_half.iter_mut().take(side / 2) {
        for value in row.iter_mut() {
            *value = 8.0;
        }
    }
    let mut candidates = vec![empty; NUM_CANDIDATES];
    candidates[1] = top_half;
    let stored = StoredPrediction {
        masks: vec![candidates],
        iou_pred: vec![vec![0.2, 0.95, 0.5, 0.1]],
    };
    let predictor = ReplayPredictor::new(stored, PredictorConfig::cpu());

    let canvas = Canvas::from_image(&test_image(), &Device::Cpu).unwrap();
    let transform = canvas.transform();
    let prompts = Prompts::new().with_point(PointPrompt::foreground(400.0, 100.0));
    let request = SegmentationRequest::new(canvas, &prompts).unwrap();
    let wire = request.to_wire(CallPath::Convenience, &Device::Cpu).unwrap();

    let prediction = predictor.predict(&wire).unwrap();
    let (best_logits, score) = prediction.best(0).unwrap();
    assert_eq!(score, 0.95);
    assert_eq!(best_logits.dims(), &[side, side]);

    // the unpadded canvas region for an 800x600 source is 1024x768
    let cropped = upscale_mask(&best_logits, transform, &Device::Cpu).unwrap();
    let region_mask = threshold_mask(&cropped).unwrap();
    assert_eq!((region_mask.width, region_mask.height), (1024, 768));

    // and at source resolution the mask covers the top half of the image
    let full = postprocess_mask(&best_logits, transform, &Device::Cpu).unwrap();
    let mask = threshold_mask(&full).unwrap();
    assert_eq!((mask.width, mask.height), (800, 600));
    assert!(mask.get(400, 100));
    assert!(!mask.get(400, 500));

    // thresholding the thresholded mask changes nothing
    let again = threshold_mask(&mask.to_tensor(&Device::Cpu).unwrap()).unwrap();
    assert_eq!(again, mask);
}
