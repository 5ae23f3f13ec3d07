use clap::{Args, Parser, Subcommand};
use image::ImageFormat;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::AutoMaskConfig;
use crate::weights::ModelVariant;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Log at debug level.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Replay an annotation script against an image and save the label map.
    Annotate(AnnotateArgs),
    /// Download a Segment Anything PyTorch checkpoint (`.pth`) into the local
    /// cache. `annotate` needs ONNX encoder/decoder exports and cannot load
    /// these directly; export them separately.
    FetchWeights(FetchArgs),
}

#[derive(Args, Clone, Debug)]
pub struct AnnotateArgs {
    pub image: PathBuf,

    #[arg(short, long)]
    pub encoder_path: PathBuf,

    #[arg(short = 'D', long)]
    pub decoder_path: PathBuf,

    /// JSON-lines event script.
    #[arg(short, long)]
    pub script: PathBuf,

    /// 16-bit label map (png or tiff).
    #[arg(short, long, default_value = "labels.png", value_parser = check_label_format)]
    pub output: PathBuf,

    /// Also save the final candidate mask.
    #[arg(long, value_parser = check_format)]
    pub candidate_output: Option<PathBuf>,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value_t = 120)]
    pub prediction_timeout_secs: u64,

    #[command(flatten)]
    pub auto: AutoMaskArgs,
}

impl AnnotateArgs {
    pub const fn prediction_timeout(&self) -> Duration {
        Duration::from_secs(self.prediction_timeout_secs)
    }
}

#[derive(Args, Clone, Debug)]
pub struct AutoMaskArgs {
    #[arg(long, default_value_t = 32)]
    pub points_per_side: u32,

    #[arg(long, default_value_t = 0.88)]
    pub pred_iou_thresh: f32,

    #[arg(long, default_value_t = 0.7)]
    pub nms_thresh: f32,

    #[arg(long, default_value_t = 0)]
    pub min_mask_region_area: usize,
}

impl From<&AutoMaskArgs> for AutoMaskConfig {
    fn from(args: &AutoMaskArgs) -> Self {
        Self {
            points_per_side: args.points_per_side,
            pred_iou_thresh: args.pred_iou_thresh,
            nms_thresh: args.nms_thresh,
            min_mask_region_area: args.min_mask_region_area,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct FetchArgs {
    #[arg(short, long, value_enum, default_value_t = ModelVariant::Default)]
    pub variant: ModelVariant,

    /// Defaults to the user cache directory.
    #[arg(short, long)]
    pub cache_dir: Option<PathBuf>,
}

fn check_format(s: &str) -> Result<PathBuf, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let path = PathBuf::from(s);
    let format = ImageFormat::from_path(&path)
        .map_err(|_| format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(path)
}

/// Label maps are 16-bit grayscale, which only some encoders can write.
fn check_label_format(s: &str) -> Result<PathBuf, String> {
    let path = check_format(s)?;
    match ImageFormat::from_path(&path) {
        Ok(ImageFormat::Png | ImageFormat::Tiff) => Ok(path),
        _ => Err(format!(
            "{} cannot hold 16-bit labels. Supported formats: `png`, `tiff`",
            s
        )),
    }
}
