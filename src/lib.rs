pub mod config;
pub mod errors;
pub mod image_processor;
pub mod imageops_ai;
pub mod label_surface;
pub mod model;
pub mod prompt;
pub mod script;
pub mod session;
pub mod traits;
pub mod weights;
pub mod worker;

pub mod mocks;

pub use config::Config;
pub use errors::{Result, SegError};
pub use label_surface::{LabelId, LabelSurface};
pub use model::{AutoMaskConfig, SamModel};
pub use prompt::{BoundingBox, Point, Polarity, PromptSet};
pub use session::{
    AnnotationSession, PredictionKind, PredictionRequest, PromptEvent, SessionEvent, SessionState,
    SessionUpdate, Staged,
};
pub use traits::*;
pub use weights::{ModelVariant, WeightCache};
pub use worker::{PredictionOutcome, PredictionWorker};

#[cfg(test)]
pub use mocks::*;
