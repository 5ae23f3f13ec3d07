use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use image::RgbImage;
use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{Result, SegError};
use crate::prompt::{Polarity, PromptSet};
use crate::traits::{Logits, Mask, Prediction, PromptableSegmentationModel, ScoredMask};

/// One `predict` call as the mock saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrediction {
    pub coords: Vec<[f32; 2]>,
    pub labels: Vec<f32>,
    pub bbox: Option<[f32; 4]>,
    pub prior_logits: Option<Logits>,
    pub image_dimensions: (u32, u32),
}

/// In-process stand-in for a promptable segmentation model.
///
/// Without scripted masks it paints a disk around every positive point, fills
/// the box and carves disks out for negative points. The logits it returns are
/// filled with the 1-based call number so tests can tell which prediction fed
/// the next one.
#[derive(Debug)]
pub struct MockPromptableModel {
    radius: u32,
    image_dimensions: Mutex<Option<(u32, u32)>>,
    scripted: Mutex<VecDeque<Mask>>,
    auto_masks: Mutex<Vec<ScoredMask>>,
    calls: Mutex<Vec<RecordedPrediction>>,
    set_image_calls: AtomicUsize,
    fail_predictions: AtomicBool,
    fail_set_image: AtomicBool,
}

impl Default for MockPromptableModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPromptableModel {
    pub fn new() -> Self {
        Self::with_radius(3)
    }

    pub fn with_radius(radius: u32) -> Self {
        Self {
            radius,
            image_dimensions: Mutex::new(None),
            scripted: Mutex::new(VecDeque::new()),
            auto_masks: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            set_image_calls: AtomicUsize::new(0),
            fail_predictions: AtomicBool::new(false),
            fail_set_image: AtomicBool::new(false),
        }
    }

    /// Queue a mask to be returned by the next `predict` call.
    pub fn push_mask(&self, mask: Mask) {
        self.scripted.lock().push_back(mask);
    }

    pub fn set_auto_masks(&self, masks: Vec<Mask>) {
        *self.auto_masks.lock() = masks
            .into_iter()
            .map(|mask| ScoredMask { mask, score: 0.95 })
            .collect();
    }

    pub fn fail_predictions(&self, fail: bool) {
        self.fail_predictions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_image(&self, fail: bool) {
        self.fail_set_image.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedPrediction> {
        self.calls.lock().clone()
    }

    pub fn last_call(&self) -> Option<RecordedPrediction> {
        self.calls.lock().last().cloned()
    }

    pub fn set_image_count(&self) -> usize {
        self.set_image_calls.load(Ordering::SeqCst)
    }

    fn failure(operation: &str) -> SegError {
        SegError::Model {
            operation: operation.to_string(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mock failure requested",
            )),
        }
    }

    fn paint_prompts(&self, prompts: &PromptSet, (width, height): (u32, u32)) -> Mask {
        let mut mask = Mask::from_elem((height as usize, width as usize), false);
        if let Some(bbox) = prompts
            .bbox()
            .filter(|b| b.row_min() < height && b.col_min() < width)
        {
            let rows = bbox.row_min() as usize..=(bbox.row_max() as usize).min(height as usize - 1);
            let cols = bbox.col_min() as usize..=(bbox.col_max() as usize).min(width as usize - 1);
            mask.slice_mut(s![rows, cols]).fill(true);
        }
        let r = self.radius as i64;
        for polarity in [Polarity::Positive, Polarity::Negative] {
            for point in prompts.points().iter().filter(|p| p.polarity == polarity) {
                let (pr, pc) = (point.row as i64, point.col as i64);
                for ((row, col), value) in mask.indexed_iter_mut() {
                    let (dr, dc) = (row as i64 - pr, col as i64 - pc);
                    if dr * dr + dc * dc <= r * r {
                        *value = polarity == Polarity::Positive;
                    }
                }
            }
        }
        mask
    }
}

impl PromptableSegmentationModel for MockPromptableModel {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        if self.fail_set_image.load(Ordering::SeqCst) {
            return Err(Self::failure("mock set_image"));
        }
        self.set_image_calls.fetch_add(1, Ordering::SeqCst);
        *self.image_dimensions.lock() = Some(image.dimensions());
        Ok(())
    }

    fn predict(&self, prompts: &PromptSet, prior_logits: Option<&Logits>) -> Result<Prediction> {
        if self.fail_predictions.load(Ordering::SeqCst) {
            return Err(Self::failure("mock predict"));
        }
        let dimensions = (*self.image_dimensions.lock()).ok_or_else(|| SegError::Model {
            operation: "predict before set_image".to_string(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no image embedded",
            )),
        })?;

        let mut calls = self.calls.lock();
        calls.push(RecordedPrediction {
            coords: prompts.point_coords(),
            labels: prompts.point_labels(),
            bbox: prompts.bbox().map(|b| b.to_xyxy()),
            prior_logits: prior_logits.cloned(),
            image_dimensions: dimensions,
        });
        let tag = calls.len() as f32;
        drop(calls);

        let mask = self
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.paint_prompts(prompts, dimensions));

        Ok(Prediction {
            mask,
            score: 0.9,
            logits: Logits::new(Array4::from_elem((1, 1, 4, 4), tag)),
        })
    }

    fn generate_all(&self, _image: &RgbImage) -> Result<Vec<ScoredMask>> {
        if self.fail_predictions.load(Ordering::SeqCst) {
            return Err(Self::failure("mock generate_all"));
        }
        Ok(self.auto_masks.lock().clone())
    }
}

/// Factory used by tests that do not care about the paint radius.
pub fn create_mock_model() -> MockPromptableModel {
    MockPromptableModel::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{BoundingBox, Point};

    #[test]
    fn predict_requires_an_image() {
        let mock = create_mock_model();
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(1, 1));
        assert!(mock.predict(&prompts, None).is_err());
    }

    #[test]
    fn paints_points_and_box() -> Result<()> {
        let mock = MockPromptableModel::with_radius(1);
        mock.set_image(&RgbImage::new(10, 8))?;

        let mut prompts = PromptSet::new();
        prompts.set_box(BoundingBox::new(0, 0, 3, 3));
        prompts.add_point(Point::negative(0, 0));
        prompts.add_point(Point::positive(6, 8));

        let prediction = mock.predict(&prompts, None)?;
        assert_eq!(prediction.mask.dim(), (8, 10));
        assert!(!prediction.mask[[0, 0]]);
        assert!(prediction.mask[[3, 3]]);
        assert!(prediction.mask[[6, 8]]);
        assert!(prediction.mask[[7, 8]]);
        assert!(!prediction.mask[[5, 5]]);
        Ok(())
    }

    #[test]
    fn logits_are_tagged_by_call() -> Result<()> {
        let mock = create_mock_model();
        mock.set_image(&RgbImage::new(4, 4))?;
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(1, 1));

        let first = mock.predict(&prompts, None)?;
        let second = mock.predict(&prompts, Some(&first.logits))?;

        assert_eq!(first.logits.view()[[0, 0, 0, 0]], 1.0);
        assert_eq!(second.logits.view()[[0, 0, 0, 0]], 2.0);
        assert_eq!(mock.calls()[1].prior_logits.as_ref(), Some(&first.logits));
        Ok(())
    }

    #[test]
    fn scripted_masks_take_priority() -> Result<()> {
        let mock = create_mock_model();
        mock.set_image(&RgbImage::new(2, 2))?;
        mock.push_mask(Mask::from_elem((2, 2), true));

        let mut prompts = PromptSet::new();
        prompts.add_point(Point::negative(0, 0));
        let prediction = mock.predict(&prompts, None)?;
        assert!(prediction.mask.iter().all(|&v| v));
        Ok(())
    }
}
