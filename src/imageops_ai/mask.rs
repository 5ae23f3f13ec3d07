use std::cmp::Ordering;

use image::{GrayImage, Luma};
use ndarray::Zip;
use rayon::prelude::*;

use crate::traits::{Mask, ScoredMask};

pub fn area(mask: &Mask) -> usize {
    mask.iter().filter(|&&v| v).count()
}

/// Intersection over union of two equally shaped masks. Two empty masks have
/// an IoU of 0.
pub fn iou(a: &Mask, b: &Mask) -> f32 {
    if a.dim() != b.dim() {
        return 0.0;
    }
    let (intersection, union) = Zip::from(a)
        .and(b)
        .fold((0usize, 0usize), |(i, u), &x, &y| {
            (i + usize::from(x && y), u + usize::from(x || y))
        });
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Keep the best-scored masks, dropping any that overlap an already kept
/// mask by more than `iou_threshold`.
pub fn suppress_duplicates(mut candidates: Vec<ScoredMask>, iou_threshold: f32) -> Vec<ScoredMask> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<ScoredMask> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept
            .par_iter()
            .any(|k| iou(&k.mask, &candidate.mask) > iou_threshold);
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

/// 8-bit rendition of a mask (255 = set).
pub fn to_luma(mask: &Mask) -> GrayImage {
    let (rows, cols) = mask.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        Luma([if mask[[y as usize, x as usize]] { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn block(rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Mask {
        let mut mask = Mask::from_elem((10, 10), false);
        mask.slice_mut(s![rows, cols]).fill(true);
        mask
    }

    #[test]
    fn iou_of_overlapping_blocks() {
        let a = block(0..4, 0..4);
        let b = block(2..6, 0..4);
        assert!((iou(&a, &b) - 8.0 / 24.0).abs() < 1e-6);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&Mask::from_elem((2, 2), false), &Mask::from_elem((2, 2), false)), 0.0);
    }

    #[test]
    fn duplicates_lose_to_better_score() {
        let kept = suppress_duplicates(
            vec![
                ScoredMask { mask: block(0..4, 0..4), score: 0.90 },
                ScoredMask { mask: block(0..4, 0..5), score: 0.95 },
                ScoredMask { mask: block(6..9, 6..9), score: 0.91 },
            ],
            0.7,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.95);
        assert_eq!(kept[1].score, 0.91);
    }

    #[test]
    fn luma_rendition() {
        let image = to_luma(&block(1..2, 3..4));
        assert_eq!(image.dimensions(), (10, 10));
        assert_eq!(image.get_pixel(3, 1).0, [255]);
        assert_eq!(image.get_pixel(1, 3).0, [0]);
        assert_eq!(area(&block(1..2, 3..4)), 1);
    }
}
