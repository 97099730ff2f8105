use anyhow::{bail, Context};
use candle_core::{DType, Device};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{debug, info};
use serde_json::json;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;

use segprompt::postprocess::{postprocess_mask, save_mask_image, threshold_mask};
use segprompt::predictor::{MaskPredictor, PredictorConfig, ReplayPredictor};
use segprompt::preprocess::{read_image, Canvas, MASK_INPUT_SIZE};
use segprompt::prompt::{BoxPrompt, MaskPrompt, PointPrompt, Prompts};
use segprompt::request::{CallPath, SegmentationRequest};

#[derive(Debug, ValueEnum, Clone, Copy)]
enum DeviceType {
    Cpu,
    Gpu,
}

impl TryInto<Device> for DeviceType {
    type Error = candle_core::Error;

    fn try_into(self) -> Result<Device, Self::Error> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Gpu => Device::new_cuda(0),
        }
    }
}

fn parse_point(s: &str) -> Result<(f32, f32), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err(format!("expected 'x,y', got '{s}'"));
    }
    let x = parts[0].trim().parse().map_err(|e| format!("bad x: {e}"))?;
    let y = parts[1].trim().parse().map_err(|e| format!("bad y: {e}"))?;
    Ok((x, y))
}

fn parse_box(s: &str) -> Result<(f32, f32, f32, f32), String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return Err(format!("expected 'x1,y1,x2,y2', got '{s}'"));
    }
    let mut values = [0f32; 4];
    for (value, part) in values.iter_mut().zip(&parts) {
        *value = part.trim().parse().map_err(|e| format!("bad corner: {e}"))?;
    }
    Ok((values[0], values[1], values[2], values[3]))
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(help = "path to image")]
    image: PathBuf,

    #[arg(
        long = "point",
        value_parser = parse_point,
        help = "foreground point prompt as 'x,y' in source-image pixels, repeatable"
    )]
    points: Vec<(f32, f32)>,

    #[arg(
        long = "background-point",
        value_parser = parse_point,
        help = "background point prompt as 'x,y' in source-image pixels, repeatable"
    )]
    background_points: Vec<(f32, f32)>,

    #[arg(
        long = "box",
        value_parser = parse_box,
        help = "box prompt as 'x1,y1,x2,y2' in source-image pixels, at most one"
    )]
    box_prompt: Option<(f32, f32, f32, f32)>,

    #[arg(
        long = "mask-prompt",
        help = "path to a 256x256 grayscale image used as a low-resolution mask prompt"
    )]
    mask_prompt: Option<PathBuf>,

    #[arg(
        long,
        help = "path to a stored prediction json (masks + iou_pred); when given, the best mask is postprocessed and written out"
    )]
    logits: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = false,
        help = "emit the fully-shaped placeholder contract instead of the partial one"
    )]
    raw: bool,

    #[arg(
        long,
        default_value = "./segprompt_output",
        help = "output directory, under which the input image gets a subdirectory"
    )]
    output_dir: PathBuf,

    #[arg(long = "device", value_enum, default_value_t = DeviceType::Cpu)]
    device_type: DeviceType,

    #[arg(long, help = "whether to enable verbose mode")]
    verbose: bool,
}

impl Cli {
    fn prompts(&self) -> anyhow::Result<Prompts> {
        let mut prompts = Prompts::new();
        for &(x, y) in &self.points {
            prompts = prompts.with_point(PointPrompt::foreground(x, y));
        }
        for &(x, y) in &self.background_points {
            prompts = prompts.with_point(PointPrompt::background(x, y));
        }
        if let Some((x1, y1, x2, y2)) = self.box_prompt {
            prompts = prompts.with_box(BoxPrompt::new(x1, y1, x2, y2));
        }
        if let Some(path) = &self.mask_prompt {
            let mask = read_image(path).context("failed to read mask prompt")?;
            let gray = mask.to_luma8();
            if gray.dimensions() != (MASK_INPUT_SIZE, MASK_INPUT_SIZE) {
                bail!(
                    "mask prompt must be {}x{}, got {}x{}",
                    MASK_INPUT_SIZE,
                    MASK_INPUT_SIZE,
                    gray.width(),
                    gray.height(),
                );
            }
            let data = gray.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
            prompts = prompts.with_mask(MaskPrompt::new(data)?);
        }
        Ok(prompts)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let env = Env::new().filter_or("SEGPROMPT_LOG", if args.verbose { "debug" } else { "info" });
    env_logger::init_from_env(env);

    let device: Device = args.device_type.try_into()?;
    debug!("using device {:?}", device);

    let image = read_image(&args.image).context("failed to read input image")?;
    let canvas = Canvas::from_image(&image, &device)?;
    let transform = canvas.transform();

    let prompts = args.prompts()?;
    if prompts.is_empty() {
        info!("no prompts given, sending the bare image");
    }
    let request = SegmentationRequest::new(canvas, &prompts)?;
    let call_path = if args.raw {
        CallPath::Raw
    } else {
        CallPath::Convenience
    };
    let wire = request.to_wire(call_path, &device)?;

    // join the output dir with the input image's base name
    let output_dir = args.image.file_stem().context("failed to get file stem")?;
    let output_dir = args.output_dir.join(output_dir);
    std::fs::DirBuilder::new()
        .recursive(true)
        .create(output_dir.clone())?;
    info!("generating output to {:?}", output_dir);

    let canvas_file = output_dir.join("canvas.png");
    request.canvas().to_rgb_image()?.save(&canvas_file)?;
    info!("canvas image {:?} generated", canvas_file);

    let dims = |t: &Option<candle_core::Tensor>| t.as_ref().map(|t| t.dims().to_vec());
    let summary = json!({
        "source_size": [transform.source_width, transform.source_height],
        "resized_size": [transform.resized_width, transform.resized_height],
        "scale": transform.scale,
        "call_path": if args.raw { "raw" } else { "convenience" },
        "points": request.points(),
        "box": request.box_prompt(),
        "has_mask_prompt": request.mask_prompt().is_some(),
        "wire_shapes": {
            "images": wire.images.dims(),
            "points": dims(&wire.points),
            "labels": dims(&wire.labels),
            "boxes": dims(&wire.boxes),
            "masks": dims(&wire.masks),
        },
    });
    let summary_file = output_dir.join("request.json");
    serde_json::to_writer_pretty(BufWriter::new(File::create(&summary_file)?), &summary)?;
    info!("request summary {:?} generated", summary_file);

    if let Some(logits) = &args.logits {
        let config = PredictorConfig {
            device: device.clone(),
            dtype: DType::F32,
        };
        let predictor = ReplayPredictor::from_json_file(logits, config)
            .context("failed to load stored prediction")?;
        let now = Instant::now();
        let prediction = predictor.predict(&wire)?;
        info!("prediction served in {:.3}s", now.elapsed().as_secs_f32());

        let (best_logits, score) = prediction.best(0)?;
        let full = postprocess_mask(&best_logits, transform, &device)?;
        let mask = threshold_mask(&full)?;

        let mask_file = output_dir.join("mask.png");
        save_mask_image(&mask, &mask_file)?;
        info!("mask image {:?} generated", mask_file);

        let report = json!({
            "score": score,
            "pixel_count": mask.pixel_count(),
            "bbox": mask.bbox(),
        });
        let report_file = output_dir.join("mask.json");
        serde_json::to_writer_pretty(BufWriter::new(File::create(&report_file)?), &report)?;
        info!("mask report {:?} generated", report_file);
    }

    Ok(())
}
