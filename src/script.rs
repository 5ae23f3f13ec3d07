use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SegError};
use crate::prompt::{BoundingBox, Point, Polarity};
use crate::session::{PromptEvent, SessionEvent};

/// One line of an annotation script.
///
/// Scripts are JSON lines tagged by `"event"`, e.g.
/// `{"event": "point", "row": 42, "col": 233}` or
/// `{"event": "box", "bbox": [10, 10, 80, 120]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptStep {
    Point {
        row: u32,
        col: u32,
        #[serde(default = "default_polarity")]
        polarity: Polarity,
    },
    RemovePoint {
        index: usize,
    },
    ClearPoints,
    BoxDrag {
        bbox: BoundingBox,
    },
    #[serde(rename = "box")]
    BoxCommit {
        bbox: BoundingBox,
    },
    ClearBox,
    Confirm,
    Cancel,
    Auto,
    /// Switch to another image. Relative paths resolve against the script.
    Image {
        path: PathBuf,
    },
}

const fn default_polarity() -> Polarity {
    Polarity::Positive
}

impl ScriptStep {
    pub fn into_event(self, base_dir: &Path) -> Result<SessionEvent> {
        let event = match self {
            Self::Point { row, col, polarity } => PromptEvent::PointAdded {
                point: Point::new(row, col, polarity),
            }
            .into(),
            Self::RemovePoint { index } => PromptEvent::PointRemoved { index }.into(),
            Self::ClearPoints => PromptEvent::PointsCleared.into(),
            Self::BoxDrag { bbox } => PromptEvent::BoxUpdated { bbox }.into(),
            Self::BoxCommit { bbox } => PromptEvent::BoxCommitted { bbox }.into(),
            Self::ClearBox => PromptEvent::BoxCleared.into(),
            Self::Confirm => SessionEvent::ConfirmPressed,
            Self::Cancel => SessionEvent::CancelPressed,
            Self::Auto => SessionEvent::AutoSegmentPressed,
            Self::Image { path } => {
                let path = base_dir.join(path);
                let image = image::open(&path).map_err(|e| SegError::ImageProcessing {
                    path: path.display().to_string(),
                    operation: "open image".to_string(),
                    source: Box::new(e),
                })?;
                SessionEvent::ImageChanged { image }
            }
        };
        Ok(event)
    }
}

/// A parsed step and the 1-based line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptLine {
    pub line: usize,
    pub step: ScriptStep,
}

/// Parse a script. Blank lines and `#` comments are skipped.
pub fn parse(source: &str) -> Result<Vec<ScriptLine>> {
    source
        .lines()
        .enumerate()
        .map(|(i, text)| (i + 1, text.trim()))
        .filter(|(_, text)| !text.is_empty() && !text.starts_with('#'))
        .map(|(line, text)| {
            serde_json::from_str(text)
                .map(|step| ScriptLine { line, step })
                .map_err(|e| SegError::Validation {
                    field: format!("script line {}", line),
                    reason: e.to_string(),
                })
        })
        .collect()
}

pub fn read(path: &Path) -> Result<Vec<ScriptLine>> {
    let source = fs::read_to_string(path).map_err(|e| SegError::FileSystem {
        path: path.to_path_buf(),
        operation: "read script".to_string(),
        source: e,
    })?;
    parse(&source)
}
