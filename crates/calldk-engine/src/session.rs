use std::path::Path;
use std::sync::Arc;

use calldk_contracts::envelope::{EncodedImage, ResultEnvelope};
use thiserror::Error;

use crate::codec::{CodecError, ImageCodec};
use crate::optimizer::{OptimizerError, TextOptimizer};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("there is no text to optimize")]
    EmptyInput,

    #[error("{0}")]
    OptimizerUnavailable(String),

    #[error("no image at position {index} ({len} attached)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Image(#[from] CodecError),

    #[error("the dialog session has already ended")]
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Submitted(ResultEnvelope),
    Cancelled,
}

impl SessionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wire form. A cancelled dialog travels as the empty envelope, the same
    /// way an empty submission does.
    pub fn into_envelope(self) -> ResultEnvelope {
        match self {
            Self::Submitted(envelope) => envelope,
            Self::Cancelled => ResultEnvelope::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Open,
    Submitted(ResultEnvelope),
    Cancelled,
}

/// A request to rewrite the draft, ready to run away from the input thread.
pub struct PendingOptimization {
    id: u64,
    original: String,
    optimizer: Arc<dyn TextOptimizer>,
}

impl PendingOptimization {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Performs the blocking service call.
    pub fn run(self) -> CompletedOptimization {
        let result = self.optimizer.optimize(&self.original);
        CompletedOptimization {
            id: self.id,
            original: self.original,
            result,
        }
    }
}

pub struct CompletedOptimization {
    id: u64,
    original: String,
    result: Result<String, OptimizerError>,
}

impl CompletedOptimization {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub enum OptimizationOutcome {
    Applied,
    /// A newer request was issued after this one; the result was dropped.
    Superseded,
    /// The service answered without text; the draft is unchanged.
    Empty,
    Failed(OptimizerError),
}

/// In-process state of one feedback dialog: the draft, the attached images and
/// a single level of optimize undo.
pub struct DialogSession {
    draft_text: String,
    images: Vec<EncodedImage>,
    pre_optimize_snapshot: Option<String>,
    state: SessionState,
    codec: ImageCodec,
    optimizer: Arc<dyn TextOptimizer>,
    next_request_id: u64,
    in_flight: Option<u64>,
}

impl DialogSession {
    pub fn new(optimizer: Arc<dyn TextOptimizer>) -> Self {
        Self {
            draft_text: String::new(),
            images: Vec::new(),
            pre_optimize_snapshot: None,
            state: SessionState::Open,
            codec: ImageCodec::default(),
            optimizer,
            next_request_id: 1,
            in_flight: None,
        }
    }

    pub fn with_codec(mut self, codec: ImageCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn draft_text(&self) -> &str {
        &self.draft_text
    }

    pub fn images(&self) -> &[EncodedImage] {
        &self.images
    }

    pub fn pre_optimize_snapshot(&self) -> Option<&str> {
        self.pre_optimize_snapshot.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn optimization_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn optimizer(&self) -> &Arc<dyn TextOptimizer> {
        &self.optimizer
    }

    pub fn set_draft_text(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.draft_text = text.into();
        Ok(())
    }

    pub fn append_draft_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.draft_text.is_empty() {
            self.draft_text.push('\n');
        }
        self.draft_text.push_str(line);
        Ok(())
    }

    pub fn add_image(&mut self, path: &Path) -> Result<&EncodedImage, SessionError> {
        self.ensure_open()?;
        let encoded = self.codec.encode(path)?;
        self.images.push(encoded);
        Ok(&self.images[self.images.len() - 1])
    }

    /// Adds each file independently; failures are returned per path and do
    /// not stop the remaining files.
    pub fn add_images<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
    ) -> Result<Vec<Result<String, CodecError>>, SessionError> {
        self.ensure_open()?;
        let mut results = Vec::with_capacity(paths.len());
        for encoded in self.codec.encode_all(paths) {
            match encoded {
                Ok(image) => {
                    results.push(Ok(image.filename.clone()));
                    self.images.push(image);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "image attachment rejected");
                    results.push(Err(err));
                }
            }
        }
        Ok(results)
    }

    pub fn remove_image(&mut self, index: usize) -> Result<EncodedImage, SessionError> {
        self.ensure_open()?;
        if index >= self.images.len() {
            return Err(SessionError::IndexOutOfRange {
                index,
                len: self.images.len(),
            });
        }
        Ok(self.images.remove(index))
    }

    pub fn clear_images(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.images.clear();
        Ok(())
    }

    /// Validates the draft and hands back the work to run in the background.
    /// The draft is replaced only when [`apply_optimization`] receives the
    /// matching result.
    ///
    /// [`apply_optimization`]: DialogSession::apply_optimization
    pub fn request_optimize(
        &mut self,
        draft_text: impl Into<String>,
    ) -> Result<PendingOptimization, SessionError> {
        self.ensure_open()?;
        self.draft_text = draft_text.into();
        let original = self.draft_text.trim().to_string();
        if original.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        if !self.optimizer.is_available() {
            return Err(SessionError::OptimizerUnavailable(
                self.optimizer.status_message(),
            ));
        }

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight = Some(id);
        Ok(PendingOptimization {
            id,
            original: self.draft_text.clone(),
            optimizer: Arc::clone(&self.optimizer),
        })
    }

    pub fn apply_optimization(
        &mut self,
        completed: CompletedOptimization,
    ) -> Result<OptimizationOutcome, SessionError> {
        self.ensure_open()?;
        if self.in_flight != Some(completed.id) {
            tracing::debug!(request = completed.id, "dropping superseded optimize result");
            return Ok(OptimizationOutcome::Superseded);
        }
        self.in_flight = None;

        match completed.result {
            Ok(text) if text.trim().is_empty() => Ok(OptimizationOutcome::Empty),
            Ok(text) => {
                self.pre_optimize_snapshot = Some(completed.original);
                self.draft_text = text;
                Ok(OptimizationOutcome::Applied)
            }
            Err(err) => Ok(OptimizationOutcome::Failed(err)),
        }
    }

    /// Restores the text from before the last optimization. Returns `false`
    /// when there is nothing to undo.
    pub fn undo_optimize(&mut self) -> Result<bool, SessionError> {
        self.ensure_open()?;
        match self.pre_optimize_snapshot.take() {
            Some(snapshot) => {
                self.draft_text = snapshot;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Submits the session. Calling it again returns the same envelope.
    pub fn finalize(&mut self) -> Result<ResultEnvelope, SessionError> {
        match &self.state {
            SessionState::Submitted(envelope) => Ok(envelope.clone()),
            SessionState::Cancelled => Err(SessionError::Closed),
            SessionState::Open => {
                let envelope =
                    ResultEnvelope::new(self.draft_text.trim(), self.images.clone());
                self.in_flight = None;
                self.state = SessionState::Submitted(envelope.clone());
                Ok(envelope)
            }
        }
    }

    /// Ends the session without capturing anything. A session that was
    /// already submitted stays submitted.
    pub fn abandon(&mut self) {
        if self.state == SessionState::Open {
            self.in_flight = None;
            self.state = SessionState::Cancelled;
        }
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match &self.state {
            SessionState::Open => None,
            SessionState::Submitted(envelope) => Some(SessionOutcome::Submitted(envelope.clone())),
            SessionState::Cancelled => Some(SessionOutcome::Cancelled),
        }
    }

    /// Consumes the session; one still open counts as abandoned.
    pub fn into_outcome(mut self) -> SessionOutcome {
        self.abandon();
        match self.state {
            SessionState::Submitted(envelope) => SessionOutcome::Submitted(envelope),
            SessionState::Open | SessionState::Cancelled => SessionOutcome::Cancelled,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}
