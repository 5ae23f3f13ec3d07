use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::errors::{Result, SegError};
use crate::image_processor;
use crate::label_surface::{LabelId, LabelSurface};
use crate::prompt::{BoundingBox, Point, PromptSet};
use crate::traits::{Logits, Mask, Prediction, PromptableSegmentationModel};

/// Where the session is in its annotation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No accumulated prompts, candidate mask empty.
    Idle,
    /// Prompts accumulated and a candidate mask predicted from them.
    Active,
}

/// Spatial prompt edits coming from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptEvent {
    PointAdded { point: Point },
    PointRemoved { index: usize },
    PointsCleared,
    /// Box still being dragged. Produces a preview only.
    BoxUpdated { bbox: BoundingBox },
    /// Box released. Replaces any active box.
    BoxCommitted { bbox: BoundingBox },
    BoxCleared,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Prompt(PromptEvent),
    ConfirmPressed,
    CancelPressed,
    AutoSegmentPressed,
    ImageChanged { image: DynamicImage },
}

impl From<PromptEvent> for SessionEvent {
    fn from(event: PromptEvent) -> Self {
        Self::Prompt(event)
    }
}

/// What the presentation layer should redraw after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    CandidateMaskUpdated { mask: Mask },
    LabelSurfaceUpdated { labels: Array2<LabelId> },
    ButtonsEnabled { confirm: bool, cancel: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionKind {
    /// Result replaces prompts, candidate mask and cached logits.
    Commit,
    /// In-drag box preview; only the displayed mask changes.
    Preview,
}

/// A prediction the session wants run, detached from the session so it can
/// execute on another thread.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    generation: u64,
    kind: PredictionKind,
    prompts: PromptSet,
    prior_logits: Option<Logits>,
}

impl PredictionRequest {
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn kind(&self) -> PredictionKind {
        self.kind
    }

    pub const fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub const fn prior_logits(&self) -> Option<&Logits> {
        self.prior_logits.as_ref()
    }

    pub fn run<M: PromptableSegmentationModel + ?Sized>(&self, model: &M) -> Result<Prediction> {
        model.predict(&self.prompts, self.prior_logits.as_ref())
    }
}

/// Outcome of [`AnnotationSession::begin_prompt_event`].
#[derive(Debug)]
pub enum Staged {
    /// Nothing to predict; the event was applied immediately.
    Settled(Vec<SessionUpdate>),
    /// Run this request and hand the result to
    /// [`AnnotationSession::complete_prediction`].
    Pending(PredictionRequest),
}

#[derive(Debug)]
struct CachedLogits {
    image_epoch: u64,
    logits: Logits,
}

#[derive(Debug)]
struct PendingPrediction {
    generation: u64,
    kind: PredictionKind,
    prompts: PromptSet,
}

/// Interactive annotation of one image at a time.
///
/// Turns prompt events and session actions into a transient candidate mask
/// and a durable [`LabelSurface`]. All mutation goes through `&mut self`, so
/// events are handled strictly in arrival order. Predictions may run
/// elsewhere through [`begin_prompt_event`](Self::begin_prompt_event) /
/// [`complete_prediction`](Self::complete_prediction); a generation counter
/// bumped by every prompt edit, confirm, cancel and image change lets late
/// results be recognized and dropped.
pub struct AnnotationSession<M: PromptableSegmentationModel + ?Sized> {
    model: Option<Arc<M>>,
    image: Option<Arc<RgbImage>>,
    image_epoch: u64,
    prompts: PromptSet,
    cache: Option<CachedLogits>,
    candidate: Mask,
    preview: Option<Mask>,
    labels: LabelSurface,
    generation: u64,
    pending: Option<PendingPrediction>,
}

impl<M: PromptableSegmentationModel + ?Sized> Default for AnnotationSession<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PromptableSegmentationModel + ?Sized> AnnotationSession<M> {
    pub fn new() -> Self {
        Self {
            model: None,
            image: None,
            image_epoch: 0,
            prompts: PromptSet::new(),
            cache: None,
            candidate: Mask::from_elem((0, 0), false),
            preview: None,
            labels: LabelSurface::new((0, 0)),
            generation: 0,
            pending: None,
        }
    }

    pub fn with_model(model: Arc<M>) -> Self {
        let mut session = Self::new();
        session.model = Some(model);
        session
    }

    /// Attach or replace the backend.
    ///
    /// A loaded image is embedded again with the new backend and the current
    /// cycle is reset, since cached logits belong to the previous model.
    /// Committed labels are kept.
    pub fn attach_model(&mut self, model: Arc<M>) -> Result<Vec<SessionUpdate>> {
        if let Some(image) = &self.image {
            model
                .set_image(image)
                .map_err(|e| SegError::prediction("set_image", e))?;
        }
        self.model = Some(model);

        if self.image.is_none() {
            return Ok(Vec::new());
        }
        self.reset_cycle();
        Ok(vec![self.candidate_update(), self.buttons_update()])
    }

    pub fn model(&self) -> Option<&Arc<M>> {
        self.model.as_ref()
    }

    pub fn state(&self) -> SessionState {
        if self.prompts.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Active
        }
    }

    pub const fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    /// The committed candidate mask (all-false while idle).
    pub fn candidate_mask(&self) -> Mask {
        self.candidate.clone()
    }

    /// The mask a viewer should show: the drag preview if any, else the
    /// candidate.
    pub fn displayed_mask(&self) -> Mask {
        self.preview.as_ref().unwrap_or(&self.candidate).clone()
    }

    pub const fn label_surface(&self) -> &LabelSurface {
        &self.labels
    }

    pub fn labels(&self) -> Array2<LabelId> {
        self.labels.labels()
    }

    pub fn has_cached_logits(&self) -> bool {
        self.current_logits().is_some()
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_generation(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.generation)
    }

    pub fn image(&self) -> Option<&Arc<RgbImage>> {
        self.image.as_ref()
    }

    /// `(width, height)` of the loaded image.
    pub fn image_dimensions(&self) -> Option<(u32, u32)> {
        self.image.as_ref().map(|image| image.dimensions())
    }

    /// Dispatch one presentation event to completion.
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<Vec<SessionUpdate>> {
        match event {
            SessionEvent::Prompt(event) => self.on_prompt_event(event),
            SessionEvent::ConfirmPressed => self.confirm(),
            SessionEvent::CancelPressed => self.cancel(),
            SessionEvent::AutoSegmentPressed => self.run_automatic(),
            SessionEvent::ImageChanged { image } => self.on_image_changed(&image),
        }
    }

    /// Apply a prompt edit and predict synchronously if needed.
    pub fn on_prompt_event(&mut self, event: PromptEvent) -> Result<Vec<SessionUpdate>> {
        let model = self.require_model("prompt")?;
        match self.begin_prompt_event(event)? {
            Staged::Settled(updates) => Ok(updates),
            Staged::Pending(request) => {
                let result = request.run(model.as_ref());
                self.complete_prediction(request.generation(), result)
            }
        }
    }

    /// First half of a prompt edit: work out the new prompt set and, if it
    /// needs a prediction, register it as the one in-flight request.
    ///
    /// The accumulator is not touched until the prediction completes, so a
    /// failed prediction leaves the previous prompts in place.
    pub fn begin_prompt_event(&mut self, event: PromptEvent) -> Result<Staged> {
        self.require_model("prompt")?;
        self.require_image("prompt")?;
        if let Some(pending) = &self.pending {
            return Err(SegError::PredictionInFlight {
                generation: pending.generation,
            });
        }

        let mut next = self.prompts.clone();
        let kind = match event {
            PromptEvent::PointAdded { point } => {
                next.add_point(point);
                PredictionKind::Commit
            }
            PromptEvent::PointRemoved { index } => {
                next.remove_point(index)?;
                PredictionKind::Commit
            }
            PromptEvent::PointsCleared => {
                next.clear_points();
                PredictionKind::Commit
            }
            PromptEvent::BoxUpdated { bbox } => {
                next.set_box(bbox);
                PredictionKind::Preview
            }
            PromptEvent::BoxCommitted { bbox } => {
                next.set_box(bbox);
                PredictionKind::Commit
            }
            PromptEvent::BoxCleared => {
                next.clear_box();
                PredictionKind::Commit
            }
        };

        if next.is_empty() {
            debug!("prompts emptied, returning to idle");
            self.reset_cycle();
            return Ok(Staged::Settled(vec![
                self.candidate_update(),
                self.buttons_update(),
            ]));
        }

        self.generation += 1;
        let request = PredictionRequest {
            generation: self.generation,
            kind,
            prompts: next.clone(),
            prior_logits: self.current_logits().cloned(),
        };
        debug!(
            generation = self.generation,
            points = next.points().len(),
            has_box = next.bbox().is_some(),
            has_prior = request.prior_logits.is_some(),
            "prediction requested"
        );
        self.pending = Some(PendingPrediction {
            generation: self.generation,
            kind,
            prompts: next,
        });
        Ok(Staged::Pending(request))
    }

    /// Second half of a prompt edit.
    ///
    /// A result for anything but the pending generation is stale (the cycle
    /// was confirmed, cancelled or the image changed meanwhile) and is dropped
    /// without touching the session. A failed prediction clears the pending
    /// slot and leaves prompts, candidate and labels as they were.
    pub fn complete_prediction(
        &mut self,
        generation: u64,
        result: Result<Prediction>,
    ) -> Result<Vec<SessionUpdate>> {
        let pending = match self.pending.take() {
            Some(pending) if pending.generation == generation => pending,
            other => {
                self.pending = other;
                warn!(generation, current = self.generation, "discarding stale prediction");
                return Ok(Vec::new());
            }
        };

        let prediction = result.map_err(|e| SegError::prediction("predict", e))?;
        let expected = self.image_shape();
        if prediction.mask.dim() != expected {
            return Err(SegError::ShapeMismatch {
                expected,
                actual: prediction.mask.dim(),
            });
        }
        debug!(generation, score = prediction.score, "prediction applied");

        match pending.kind {
            PredictionKind::Commit => {
                self.prompts = pending.prompts;
                self.candidate = prediction.mask;
                self.cache = Some(CachedLogits {
                    image_epoch: self.image_epoch,
                    logits: prediction.logits,
                });
                self.preview = None;
                Ok(vec![self.candidate_update(), self.buttons_update()])
            }
            PredictionKind::Preview => {
                let update = SessionUpdate::CandidateMaskUpdated {
                    mask: prediction.mask.clone(),
                };
                self.preview = Some(prediction.mask);
                Ok(vec![update])
            }
        }
    }

    /// Commit the candidate mask as a new object.
    pub fn confirm(&mut self) -> Result<Vec<SessionUpdate>> {
        self.require_model("confirm")?;
        self.require_active("confirm")?;

        let id = self.labels.commit(&self.candidate)?;
        info!(id, "object committed");
        self.reset_cycle();
        Ok(vec![
            self.labels_update(),
            self.candidate_update(),
            self.buttons_update(),
        ])
    }

    /// Drop the current cycle without committing anything.
    pub fn cancel(&mut self) -> Result<Vec<SessionUpdate>> {
        self.require_model("cancel")?;
        self.require_active("cancel")?;

        debug!("annotation cycle cancelled");
        self.reset_cycle();
        Ok(vec![self.candidate_update(), self.buttons_update()])
    }

    /// Segment the whole image and merge every mask as a new object.
    ///
    /// Independent of the prompt cycle: prompts, candidate and cached logits
    /// are left exactly as they were.
    pub fn run_automatic(&mut self) -> Result<Vec<SessionUpdate>> {
        let model = self.require_model("automatic segmentation")?;
        let image = self.require_image("automatic segmentation")?;

        let results = model
            .generate_all(&image)
            .map_err(|e| SegError::prediction("generate_all", e))?;
        let masks: Vec<Mask> = results.into_iter().map(|r| r.mask).collect();
        let ids = self.labels.merge_auto_results(&masks)?;
        info!(count = masks.len(), first = ids.start, "automatic segmentation merged");
        Ok(vec![self.labels_update()])
    }

    /// Load a new image: embed it, then reset everything tied to the old one.
    ///
    /// Ingestion and embedding run before any mutation, so a failure leaves
    /// the session on the previous image.
    pub fn on_image_changed(&mut self, raw: &DynamicImage) -> Result<Vec<SessionUpdate>> {
        let model = self.require_model("image change")?;
        let canonical = image_processor::normalize(raw)?;
        model
            .set_image(&canonical)
            .map_err(|e| SegError::prediction("set_image", e))?;

        let (width, height) = canonical.dimensions();
        self.image = Some(Arc::new(canonical));
        self.image_epoch += 1;
        self.labels.resize_to((height as usize, width as usize));
        self.reset_cycle();
        info!(width, height, epoch = self.image_epoch, "image loaded");

        Ok(vec![
            self.labels_update(),
            self.candidate_update(),
            self.buttons_update(),
        ])
    }

    fn reset_cycle(&mut self) {
        self.prompts.clear();
        self.cache = None;
        self.candidate = Mask::from_elem(self.image_shape(), false);
        self.preview = None;
        self.pending = None;
        self.generation += 1;
    }

    fn current_logits(&self) -> Option<&Logits> {
        self.cache
            .as_ref()
            .filter(|cached| cached.image_epoch == self.image_epoch)
            .map(|cached| &cached.logits)
    }

    fn image_shape(&self) -> (usize, usize) {
        self.image_dimensions()
            .map(|(w, h)| (h as usize, w as usize))
            .unwrap_or((0, 0))
    }

    fn require_model(&self, operation: &str) -> Result<Arc<M>> {
        self.model.clone().ok_or_else(|| SegError::ModelNotLoaded {
            operation: operation.to_string(),
        })
    }

    fn require_image(&self, operation: &str) -> Result<Arc<RgbImage>> {
        self.image.clone().ok_or_else(|| SegError::NoImage {
            operation: operation.to_string(),
        })
    }

    fn require_active(&self, operation: &str) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            state => Err(SegError::InvalidState {
                operation: operation.to_string(),
                state,
            }),
        }
    }

    fn candidate_update(&self) -> SessionUpdate {
        SessionUpdate::CandidateMaskUpdated {
            mask: self.displayed_mask(),
        }
    }

    fn labels_update(&self) -> SessionUpdate {
        SessionUpdate::LabelSurfaceUpdated {
            labels: self.labels.labels(),
        }
    }

    fn buttons_update(&self) -> SessionUpdate {
        let active = self.state() == SessionState::Active;
        SessionUpdate::ButtonsEnabled {
            confirm: active,
            cancel: active,
        }
    }
}
