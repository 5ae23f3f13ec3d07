use std::collections::BTreeSet;
use std::ops::Range;

use image::{ImageBuffer, Luma};
use ndarray::prelude::*;
use ndarray::Zip;

use crate::errors::{Result, SegError};
use crate::traits::Mask;

pub type LabelId = u32;

/// Durable per-pixel label map of committed objects.
///
/// `0` is unlabeled background; every commit gets a fresh positive ID.
/// IDs are handed out from `next_id`, which only grows until the surface is
/// cleared, so an object that is later painted over keeps its ID retired.
/// Reads return owned copies: what a viewer holds never aliases the buffer the
/// session writes into.
#[derive(Debug, Clone)]
pub struct LabelSurface {
    labels: Array2<LabelId>,
    next_id: LabelId,
    version: u64,
}

impl LabelSurface {
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            labels: Array2::zeros(shape),
            next_id: 1,
            version: 0,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.labels.dim()
    }

    pub const fn next_id(&self) -> LabelId {
        self.next_id
    }

    /// Bumped on every mutation.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Paint `id` on every pixel where `mask` is set. Last write wins.
    pub fn stamp(&mut self, mask: &Mask, id: LabelId) -> Result<()> {
        if id < self.next_id {
            return Err(SegError::Validation {
                field: "label id".to_string(),
                reason: format!("{} was already issued (next free id is {})", id, self.next_id),
            });
        }
        self.check_shape(mask)?;
        let next_id = id.checked_add(1).ok_or_else(ids_exhausted)?;

        self.paint(mask, id);
        self.next_id = next_id;
        self.version += 1;
        Ok(())
    }

    /// Stamp `mask` at the next free ID and return it.
    pub fn commit(&mut self, mask: &Mask) -> Result<LabelId> {
        let id = self.next_id;
        self.stamp(mask, id)?;
        Ok(id)
    }

    /// Stamp a batch of masks with one contiguous block of new IDs, in order.
    ///
    /// The block starts above both the largest ID present and every ID issued
    /// so far. Shapes are checked up front so a bad mask leaves the surface
    /// untouched.
    pub fn merge_auto_results(&mut self, masks: &[Mask]) -> Result<Range<LabelId>> {
        for mask in masks {
            self.check_shape(mask)?;
        }

        let present_max = self.labels.iter().copied().max().unwrap_or(0);
        let base = present_max
            .checked_add(1)
            .ok_or_else(ids_exhausted)?
            .max(self.next_id);
        let end = LabelId::try_from(masks.len())
            .ok()
            .and_then(|count| base.checked_add(count))
            .ok_or_else(ids_exhausted)?;

        for (id, mask) in (base..end).zip(masks) {
            self.paint(mask, id);
        }
        self.next_id = end;
        self.version += 1;
        Ok(base..end)
    }

    /// Zero every pixel and restart IDs at 1.
    pub fn clear(&mut self) {
        self.labels.fill(0);
        self.next_id = 1;
        self.version += 1;
    }

    /// Replace the surface with a zeroed one of `shape`.
    pub fn resize_to(&mut self, shape: (usize, usize)) {
        self.labels = Array2::zeros(shape);
        self.next_id = 1;
        self.version += 1;
    }

    pub fn labels(&self) -> Array2<LabelId> {
        self.labels.clone()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<LabelId> {
        self.labels.get((row, col)).copied()
    }

    /// Nonzero IDs currently visible on the surface.
    pub fn distinct_ids(&self) -> BTreeSet<LabelId> {
        self.labels.iter().copied().filter(|&id| id != 0).collect()
    }

    pub fn is_blank(&self) -> bool {
        self.labels.iter().all(|&id| id == 0)
    }

    /// 16-bit grayscale rendition for saving to disk.
    pub fn to_image(&self) -> Result<ImageBuffer<Luma<u16>, Vec<u16>>> {
        let (rows, cols) = self.shape();
        let pixels = self
            .labels
            .iter()
            .map(|&id| {
                u16::try_from(id).map_err(|_| SegError::Validation {
                    field: "label id".to_string(),
                    reason: format!("{} does not fit a 16-bit label image", id),
                })
            })
            .collect::<Result<Vec<u16>>>()?;

        ImageBuffer::from_raw(cols as u32, rows as u32, pixels).ok_or_else(|| {
            SegError::Validation {
                field: "label image".to_string(),
                reason: "buffer size does not match surface shape".to_string(),
            }
        })
    }

    fn check_shape(&self, mask: &Mask) -> Result<()> {
        if mask.dim() != self.labels.dim() {
            return Err(SegError::ShapeMismatch {
                expected: self.labels.dim(),
                actual: mask.dim(),
            });
        }
        Ok(())
    }

    fn paint(&mut self, mask: &Mask, id: LabelId) {
        Zip::from(&mut self.labels)
            .and(mask)
            .for_each(|label, &hit| {
                if hit {
                    *label = id;
                }
            });
    }
}

fn ids_exhausted() -> SegError {
    SegError::Validation {
        field: "label id".to_string(),
        reason: "no label ids left on this surface".to_string(),
    }
}
