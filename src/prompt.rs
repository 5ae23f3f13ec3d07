use serde::{Deserialize, Serialize};

use crate::errors::{Result, SegError};

/// Foreground or background hint attached to a point when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    /// Label value in the SAM prompt encoding (1 = foreground, 0 = background).
    pub const fn label(self) -> f32 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub row: u32,
    pub col: u32,
    pub polarity: Polarity,
}

impl Point {
    pub const fn new(row: u32, col: u32, polarity: Polarity) -> Self {
        Self { row, col, polarity }
    }

    pub const fn positive(row: u32, col: u32) -> Self {
        Self::new(row, col, Polarity::Positive)
    }

    pub const fn negative(row: u32, col: u32) -> Self {
        Self::new(row, col, Polarity::Negative)
    }
}

/// Axis-aligned region of interest in pixel coordinates.
///
/// Always normalized so that `row_min <= row_max` and `col_min <= col_max`,
/// whichever corners it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    row_min: u32,
    col_min: u32,
    row_max: u32,
    col_max: u32,
}

impl BoundingBox {
    pub fn new(row_a: u32, col_a: u32, row_b: u32, col_b: u32) -> Self {
        Self {
            row_min: row_a.min(row_b),
            col_min: col_a.min(col_b),
            row_max: row_a.max(row_b),
            col_max: col_a.max(col_b),
        }
    }

    pub const fn row_min(&self) -> u32 {
        self.row_min
    }

    pub const fn col_min(&self) -> u32 {
        self.col_min
    }

    pub const fn row_max(&self) -> u32 {
        self.row_max
    }

    pub const fn col_max(&self) -> u32 {
        self.col_max
    }

    /// `[x_min, y_min, x_max, y_max]`, the order the model expects.
    pub fn to_xyxy(&self) -> [f32; 4] {
        [
            self.col_min as f32,
            self.row_min as f32,
            self.col_max as f32,
            self.row_max as f32,
        ]
    }
}

impl From<[u32; 4]> for BoundingBox {
    fn from([r0, c0, r1, c1]: [u32; 4]) -> Self {
        Self::new(r0, c0, r1, c1)
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.row_min, b.col_min, b.row_max, b.col_max]
    }
}

/// The uncommitted prompts of the current annotation cycle.
///
/// Points keep their insertion order so that index `i` always refers to the
/// same rendered marker; at most one box is active at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptSet {
    points: Vec<Point>,
    bbox: Option<BoundingBox>,
}

impl PromptSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated coordinates are kept; they reinforce the same region.
    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn remove_point(&mut self, index: usize) -> Result<Point> {
        if index >= self.points.len() {
            return Err(SegError::Validation {
                field: "point index".to_string(),
                reason: format!("{} is out of range for {} points", index, self.points.len()),
            });
        }
        Ok(self.points.remove(index))
    }

    pub fn clear_points(&mut self) {
        self.points.clear();
    }

    /// Replaces any previous box.
    pub fn set_box(&mut self, bbox: BoundingBox) {
        self.bbox = Some(bbox);
    }

    pub fn clear_box(&mut self) {
        self.bbox = None;
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.bbox = None;
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.bbox.is_none()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub const fn bbox(&self) -> Option<BoundingBox> {
        self.bbox
    }

    /// `(x, y)` pairs in point order.
    pub fn point_coords(&self) -> Vec<[f32; 2]> {
        self.points
            .iter()
            .map(|p| [p.col as f32, p.row as f32])
            .collect()
    }

    /// One label per point, same order as [`PromptSet::point_coords`].
    pub fn point_labels(&self) -> Vec<f32> {
        self.points.iter().map(|p| p.polarity.label()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_is_normalized() {
        let b = BoundingBox::new(90, 80, 10, 20);
        assert_eq!(b.row_min(), 10);
        assert_eq!(b.col_min(), 20);
        assert_eq!(b.row_max(), 90);
        assert_eq!(b.col_max(), 80);
        assert_eq!(b.to_xyxy(), [20.0, 10.0, 80.0, 90.0]);
    }

    #[test]
    fn box_deserializes_from_any_corner_order() {
        let b: BoundingBox = serde_json::from_str("[50, 60, 5, 6]").unwrap();
        assert_eq!(b, BoundingBox::new(5, 6, 50, 60));
        assert_eq!(serde_json::to_string(&b).unwrap(), "[5,6,50,60]");
    }

    #[test]
    fn empty_set_is_inert() {
        let mut prompts = PromptSet::new();
        assert!(prompts.is_empty());

        prompts.set_box(BoundingBox::new(0, 0, 4, 4));
        assert!(!prompts.is_empty());
        prompts.clear_box();
        assert!(prompts.is_empty());
    }

    #[test]
    fn duplicate_points_are_kept() {
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(3, 4));
        prompts.add_point(Point::positive(3, 4));
        assert_eq!(prompts.points().len(), 2);
    }

    #[test]
    fn labels_align_with_points() {
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(1, 2));
        prompts.add_point(Point::negative(3, 4));
        prompts.add_point(Point::positive(5, 6));

        assert_eq!(prompts.point_coords(), vec![[2.0, 1.0], [4.0, 3.0], [6.0, 5.0]]);
        assert_eq!(prompts.point_labels(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn remove_point_out_of_range_leaves_set_unchanged() {
        let mut prompts = PromptSet::new();
        prompts.add_point(Point::positive(1, 1));
        let before = prompts.clone();

        assert!(matches!(
            prompts.remove_point(5),
            Err(SegError::Validation { .. })
        ));
        assert_eq!(prompts, before);

        let removed = prompts.remove_point(0).unwrap();
        assert_eq!(removed, Point::positive(1, 1));
        assert!(prompts.is_empty());
    }

    #[test]
    fn second_box_replaces_first() {
        let mut prompts = PromptSet::new();
        prompts.set_box(BoundingBox::new(0, 0, 10, 10));
        prompts.set_box(BoundingBox::new(5, 5, 20, 20));
        assert_eq!(prompts.bbox(), Some(BoundingBox::new(5, 5, 20, 20)));
    }
}
