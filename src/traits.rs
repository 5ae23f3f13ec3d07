use crate::errors::Result;
use crate::prompt::PromptSet;
use image::RgbImage;
use ndarray::prelude::*;

/// Binary mask over the canonical image, shape `(height, width)`.
pub type Mask = Array2<bool>;

/// Low-resolution mask logits returned by a prediction.
///
/// Opaque to the session: it is only ever handed back to the backend that
/// produced it, unchanged, to seed the next prediction on the same image.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits(Array4<f32>);

impl Logits {
    pub const fn new(data: Array4<f32>) -> Self {
        Self(data)
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }
}

/// Single-mask output of a prompted prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mask: Mask,
    pub score: f32,
    pub logits: Logits,
}

/// One object found by automatic segmentation.
#[derive(Debug, Clone)]
pub struct ScoredMask {
    pub mask: Mask,
    pub score: f32,
}

/// A promptable segmentation backend (Segment Anything and friends).
///
/// Implementations hold the embedding of the last image passed to
/// [`set_image`](Self::set_image) and must be shareable across threads so
/// predictions can run off the session's thread.
pub trait PromptableSegmentationModel: Send + Sync {
    /// Embed `image`, replacing any previous embedding.
    fn set_image(&self, image: &RgbImage) -> Result<()>;

    /// Predict one mask for `prompts` on the embedded image.
    ///
    /// `prior_logits` is the verbatim logits of the previous prediction on the
    /// same image, or `None` for the first prediction of a cycle.
    fn predict(&self, prompts: &PromptSet, prior_logits: Option<&Logits>) -> Result<Prediction>;

    /// Segment everything in `image`. Result order is unspecified.
    fn generate_all(&self, image: &RgbImage) -> Result<Vec<ScoredMask>>;
}

impl<M: PromptableSegmentationModel + ?Sized> PromptableSegmentationModel for Box<M> {
    fn set_image(&self, image: &RgbImage) -> Result<()> {
        (**self).set_image(image)
    }

    fn predict(&self, prompts: &PromptSet, prior_logits: Option<&Logits>) -> Result<Prediction> {
        (**self).predict(prompts, prior_logits)
    }

    fn generate_all(&self, image: &RgbImage) -> Result<Vec<ScoredMask>> {
        (**self).generate_all(image)
    }
}
