use std::path::Path;
use std::time::Instant;

use crate::{
    errors::{Result, SegError},
    imageops_ai::mask::{area, suppress_duplicates},
    prompt::{Point, PromptSet},
    traits::{Logits, Mask, Prediction, PromptableSegmentationModel, ScoredMask},
};
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

/// Side of the square the image encoder works on.
pub const ENCODER_INPUT_SIZE: u32 = 1024;
const LOW_RES_MASK_SIZE: usize = 256;
const MASK_THRESHOLD: f32 = 0.0;
const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

const ENCODER_INPUT: &str = "images";
const ENCODER_OUTPUT: &str = "image_embeddings";

/// Knobs of automatic (prompt-free) segmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoMaskConfig {
    /// The image is prompted on a `points_per_side × points_per_side` grid.
    pub points_per_side: u32,
    /// Masks scoring below this are dropped.
    pub pred_iou_thresh: f32,
    /// Masks overlapping a better mask by more than this IoU are dropped.
    pub nms_thresh: f32,
    /// Masks with fewer pixels are dropped.
    pub min_mask_region_area: usize,
}

impl Default for AutoMaskConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            pred_iou_thresh: 0.88,
            nms_thresh: 0.7,
            min_mask_region_area: 0,
        }
    }
}

struct ImageEmbedding {
    features: Array4<f32>,
    source: RgbImage,
    resized: (u32, u32),
}

impl ImageEmbedding {
    /// Per-axis factor from original pixel coordinates to the encoder frame.
    fn coordinate_scale(&self) -> (f32, f32) {
        let (width, height) = self.source.dimensions();
        (
            self.resized.0 as f32 / width as f32,
            self.resized.1 as f32 / height as f32,
        )
    }
}

/// Segment Anything on ONNX Runtime: an image encoder and a prompt decoder
/// exported as two separate graphs.
pub struct SamModel {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    embedding: RwLock<Option<ImageEmbedding>>,
    auto_config: AutoMaskConfig,
}

impl SamModel {
    pub fn new(encoder_path: &Path, decoder_path: &Path, device_id: i32) -> Result<Self> {
        let encoder = build_session(encoder_path, device_id)?;
        let decoder = build_session(decoder_path, device_id)?;
        info!(
            encoder = %encoder_path.display(),
            decoder = %decoder_path.display(),
            device_id,
            "SAM sessions ready"
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            embedding: RwLock::new(None),
            auto_config: AutoMaskConfig::default(),
        })
    }

    pub const fn with_auto_config(mut self, auto_config: AutoMaskConfig) -> Self {
        self.auto_config = auto_config;
        self
    }

    fn encode(&self, image: &RgbImage) -> Result<ImageEmbedding> {
        let started = Instant::now();
        let (tensor, resized) = preprocess(image, ENCODER_INPUT_SIZE);

        let mut binding = self.encoder.lock();
        let outputs = binding.run(
            ort::inputs![ENCODER_INPUT => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        let features = outputs[ENCODER_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "image embedded");

        Ok(ImageEmbedding {
            features,
            source: image.clone(),
            resized,
        })
    }

    fn decode(
        &self,
        embedding: &ImageEmbedding,
        prompts: &PromptSet,
        prior_logits: Option<&Logits>,
    ) -> Result<Prediction> {
        let (width, height) = embedding.source.dimensions();
        let (coords, labels) = encode_prompts(prompts, embedding.coordinate_scale())?;
        let mask_input = match prior_logits {
            Some(logits) => logits.view().to_owned(),
            None => Array4::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE)),
        };
        let has_mask_input = array![if prior_logits.is_some() { 1.0f32 } else { 0.0 }];
        let orig_im_size = array![height as f32, width as f32];

        let mut binding = self.decoder.lock();
        let outputs = binding.run(ort::inputs![
            "image_embeddings" => TensorRef::from_array_view(&embedding.features.as_standard_layout())?,
            "point_coords" => TensorRef::from_array_view(&coords.as_standard_layout())?,
            "point_labels" => TensorRef::from_array_view(&labels.as_standard_layout())?,
            "mask_input" => TensorRef::from_array_view(&mask_input.as_standard_layout())?,
            "has_mask_input" => TensorRef::from_array_view(&has_mask_input.as_standard_layout())?,
            "orig_im_size" => TensorRef::from_array_view(&orig_im_size.as_standard_layout())?,
        ])?;

        let masks = outputs["masks"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?;
        let mask: Mask = masks
            .slice(s![0, 0, .., ..])
            .mapv(|logit| logit > MASK_THRESHOLD);
        if mask.dim() != (height as usize, width as usize) {
            return Err(SegError::ShapeMismatch {
                expected: (height as usize, width as usize),
                actual: mask.dim(),
            });
        }

        let score = outputs["iou_predictions"]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);
        let low_res = outputs["low_res_masks"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .slice(s![0..1, 0..1, .., ..])
            .to_owned();

        Ok(Prediction {
            mask,
            score,
            logits: Logits::new(low_res),
        })
    }
}

impl PromptableSegmentationModel for SamModel {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        let embedding = self.encode(image)?;
        *self.embedding.write() = Some(embedding);
        Ok(())
    }

    fn predict(&self, prompts: &PromptSet, prior_logits: Option<&Logits>) -> Result<Prediction> {
        let guard = self.embedding.read();
        let embedding = guard
            .as_ref()
            .ok_or_else(|| model_error("predict", "set_image must be called before predict"))?;
        self.decode(embedding, prompts, prior_logits)
    }

    fn generate_all(&self, image: &RgbImage) -> Result<Vec<ScoredMask>> {
        let stale = self
            .embedding
            .read()
            .as_ref()
            .map_or(true, |embedding| &embedding.source != image);
        if stale {
            self.set_image(image)?;
        }

        let guard = self.embedding.read();
        let embedding = guard
            .as_ref()
            .ok_or_else(|| model_error("generate_all", "no image embedding"))?;
        let config = self.auto_config;
        let (width, height) = image.dimensions();

        let mut candidates = Vec::new();
        for point in point_grid(config.points_per_side, width, height) {
            let mut prompts = PromptSet::new();
            prompts.add_point(point);
            let prediction = self.decode(embedding, &prompts, None)?;
            let pixels = area(&prediction.mask);
            if prediction.score >= config.pred_iou_thresh
                && pixels > 0
                && pixels >= config.min_mask_region_area
            {
                candidates.push(ScoredMask {
                    mask: prediction.mask,
                    score: prediction.score,
                });
            }
        }

        let found = candidates.len();
        let kept = suppress_duplicates(candidates, config.nms_thresh);
        info!(found, kept = kept.len(), "automatic masks generated");
        Ok(kept)
    }
}

fn build_session(model_path: &Path, device_id: i32) -> Result<Session> {
    SessionBuilder::new()
        .map_err(|e| model_error("session builder init", e))?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])
        .map_err(|e| model_error("execution provider setup", e))?
        .with_memory_pattern(true)
        .map_err(|e| model_error("memory pattern setup", e))?
        .commit_from_file(model_path)
        .map_err(|e| model_error(format!("model load: {}", model_path.display()), e))
}

fn model_error(operation: impl Into<String>, err: impl std::fmt::Display) -> SegError {
    SegError::Model {
        operation: operation.into(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        )),
    }
}

/// Size of `(width, height)` after scaling the longest side to `target`.
pub fn resized_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    let scale = target as f32 / width.max(height) as f32;
    let scaled = |v: u32| ((v as f32 * scale + 0.5) as u32).max(1);
    (scaled(width), scaled(height))
}

/// Encoder input: longest side resized to `target`, normalized per channel,
/// zero padded on the bottom and right. Returns the tensor and the resized
/// `(width, height)`.
pub fn preprocess(image: &RgbImage, target: u32) -> (Array4<f32>, (u32, u32)) {
    let (width, height) = image.dimensions();
    let (rw, rh) = resized_dimensions(width, height, target);
    let resized = imageops::resize(image, rw, rh, FilterType::Triangle);

    let size = target as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (c, channel) in resized.as_ndarray3().outer_iter().enumerate() {
        tensor
            .slice_mut(s![0, c, ..rh as usize, ..rw as usize])
            .assign(&channel.mapv(|v| (v as f32 - PIXEL_MEAN[c]) / PIXEL_STD[c]));
    }
    (tensor, (rw, rh))
}

/// Decoder point inputs for `prompts`.
///
/// A box becomes two corner points labelled 2 and 3; without a box a padding
/// point labelled -1 is appended, as the exported decoder expects.
pub fn encode_prompts(
    prompts: &PromptSet,
    (scale_x, scale_y): (f32, f32),
) -> Result<(Array3<f32>, Array2<f32>)> {
    let mut coords = prompts.point_coords();
    let mut labels = prompts.point_labels();
    match prompts.bbox() {
        Some(bbox) => {
            let [x0, y0, x1, y1] = bbox.to_xyxy();
            coords.extend([[x0, y0], [x1, y1]]);
            labels.extend([2.0, 3.0]);
        }
        None => {
            coords.push([0.0, 0.0]);
            labels.push(-1.0);
        }
    }

    let n = coords.len();
    let flat = coords
        .into_iter()
        .flat_map(|[x, y]| [x * scale_x, y * scale_y])
        .collect();
    let coords = Array3::from_shape_vec((1, n, 2), flat)?;
    let labels = Array2::from_shape_vec((1, n), labels)?;
    Ok((coords, labels))
}

/// Positive prompts at the centers of a regular grid over the image.
pub fn point_grid(points_per_side: u32, width: u32, height: u32) -> Vec<Point> {
    let n = points_per_side as f32;
    let at = |i: u32, extent: u32| {
        (((i as f32 + 0.5) / n * extent as f32) as u32).min(extent.saturating_sub(1))
    };
    (0..points_per_side)
        .flat_map(|i| (0..points_per_side).map(move |j| Point::positive(at(i, height), at(j, width))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{BoundingBox, Polarity};
    use image::Rgb;

    #[test]
    fn longest_side_is_scaled_to_target() {
        assert_eq!(resized_dimensions(512, 256, 1024), (1024, 512));
        assert_eq!(resized_dimensions(300, 600, 1024), (512, 1024));
        assert_eq!(resized_dimensions(1024, 1024, 1024), (1024, 1024));
    }

    #[test]
    fn preprocess_normalizes_and_pads() {
        let image = RgbImage::from_pixel(64, 32, Rgb([124, 116, 104]));
        let (tensor, resized) = preprocess(&image, 128);

        assert_eq!(tensor.shape(), &[1, 3, 128, 128]);
        assert_eq!(resized, (128, 64));
        let expected = (124.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((tensor[[0, 0, 10, 10]] - expected).abs() < 1e-4);
        assert_eq!(tensor[[0, 0, 100, 10]], 0.0);
    }

    #[test]
    fn points_only_get_a_padding_point() -> Result<()> {
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(10, 20));
        prompts.add_point(Point::new(30, 40, Polarity::Negative));

        let (coords, labels) = encode_prompts(&prompts, (2.0, 0.5))?;
        assert_eq!(coords.shape(), &[1, 3, 2]);
        assert_eq!(coords.slice(s![0, 0, ..]).to_vec(), vec![40.0, 5.0]);
        assert_eq!(coords.slice(s![0, 1, ..]).to_vec(), vec![80.0, 15.0]);
        assert_eq!(labels.row(0).to_vec(), vec![1.0, 0.0, -1.0]);
        Ok(())
    }

    #[test]
    fn box_becomes_two_corners() -> Result<()> {
        let mut prompts = PromptSet::new();
        prompts.set_box(BoundingBox::new(10, 20, 30, 40));

        let (coords, labels) = encode_prompts(&prompts, (1.0, 1.0))?;
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!(coords.slice(s![0, 0, ..]).to_vec(), vec![20.0, 10.0]);
        assert_eq!(coords.slice(s![0, 1, ..]).to_vec(), vec![40.0, 30.0]);
        assert_eq!(labels.row(0).to_vec(), vec![2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn grid_covers_image_centers() {
        let grid = point_grid(2, 100, 50);
        assert_eq!(
            grid,
            vec![
                Point::positive(12, 25),
                Point::positive(12, 75),
                Point::positive(37, 25),
                Point::positive(37, 75),
            ]
        );
        assert!(point_grid(0, 10, 10).is_empty());
    }
}
