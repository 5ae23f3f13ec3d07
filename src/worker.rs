use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{Result, SegError};
use crate::session::PredictionRequest;
use crate::traits::{Prediction, PromptableSegmentationModel};

/// A finished request, tagged with the generation it was issued for.
#[derive(Debug)]
pub struct PredictionOutcome {
    pub generation: u64,
    pub result: Result<Prediction>,
}

/// Runs backend predictions on tokio's blocking pool.
///
/// The session stays on its owning task: it stages a request, the worker runs
/// it, and the outcome goes back through
/// [`AnnotationSession::complete_prediction`](crate::session::AnnotationSession::complete_prediction).
pub struct PredictionWorker<M: PromptableSegmentationModel + ?Sized + 'static> {
    model: Arc<M>,
    semaphore: Arc<Semaphore>,
    timeout_duration: Option<Duration>,
}

impl<M: PromptableSegmentationModel + ?Sized + 'static> PredictionWorker<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            semaphore: Arc::new(Semaphore::new(1)),
            timeout_duration: None,
        }
    }

    /// Give up on a prediction after `timeout`. The outcome is then a
    /// prediction failure for that generation; the next request still waits
    /// for the abandoned backend call to finish.
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_duration = Some(timeout);
        self
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn submit(&self, request: PredictionRequest) -> JoinHandle<PredictionOutcome> {
        let model = Arc::clone(&self.model);
        let semaphore = Arc::clone(&self.semaphore);
        let timeout_duration = self.timeout_duration;

        tokio::spawn(async move {
            let generation = request.generation();
            let result = Self::execute(model, semaphore, request, timeout_duration).await;
            if let Err(e) = &result {
                warn!(generation, error = %e, "prediction failed");
            }
            PredictionOutcome { generation, result }
        })
    }

    /// Submit and wait in one step.
    pub async fn run(&self, request: PredictionRequest) -> PredictionOutcome {
        let generation = request.generation();
        match self.submit(request).await {
            Ok(outcome) => outcome,
            Err(e) => PredictionOutcome {
                generation,
                result: Err(task_error(e)),
            },
        }
    }

    async fn execute(
        model: Arc<M>,
        semaphore: Arc<Semaphore>,
        request: PredictionRequest,
        timeout_duration: Option<Duration>,
    ) -> Result<Prediction> {
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| SegError::Prediction {
                operation: "acquire worker permit".to_string(),
                source: Box::new(e),
            })?;

        debug!(generation = request.generation(), kind = ?request.kind(), "prediction started");
        // Held until the backend call returns, even past a timeout.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            request.run(model.as_ref())
        });

        let joined = match timeout_duration {
            Some(limit) => timeout(limit, task).await.map_err(|e| SegError::Prediction {
                operation: format!("predict (timed out after {:?})", limit),
                source: Box::new(e),
            })?,
            None => task.await,
        };
        joined.map_err(task_error)?
    }
}

fn task_error(err: tokio::task::JoinError) -> SegError {
    SegError::Prediction {
        operation: "prediction task".to_string(),
        source: Box::new(err),
    }
}
