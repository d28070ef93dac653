/// Errors raised while building, training, restoring or running a YOLOv2 model.
#[derive(thiserror::Error, Debug)]
pub enum YoloError {
    /// The network output does not match the layout declared by the model metadata.
    #[error("{0}\nCheck your model configuration file.")]
    Configuration(String),

    /// The model metadata is malformed.
    #[error("Invalid model metadata: {0}")]
    InvalidMeta(String),

    /// The loss became NaN or infinite.
    #[error(
        "Looks like the neural net lost the gradient, try restarting from the last checkpoint{}",
        if *clipping {
            " with a smaller learning rate."
        } else {
            " and turning on gradient clipping."
        }
    )]
    Divergence {
        /// Whether gradient clipping was already enabled for the run.
        clipping: bool,
    },

    /// The backend ran out of memory during a step.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A trainable variable was found in neither the checkpoint nor the legacy loader.
    #[error("Cannot find and load {0}")]
    MissingVariable(String),

    /// The checkpoint exists in a format the primary restore cannot read.
    #[error("Unreadable checkpoint {path}: {reason}")]
    UnreadableCheckpoint {
        /// The checkpoint file that failed to parse.
        path: String,
        /// Why it could not be read.
        reason: String,
    },

    /// No checkpoint could be resolved from the backup directory.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Training was stopped by an abort request.
    #[error("Training aborted at step {0}")]
    Aborted(u64),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Filesystem error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Hugging Face API error.
    #[error(transparent)]
    ApiError(#[from] hf_hub::api::sync::ApiError),
}

impl YoloError {
    /// Whether the error should stop a run, as opposed to driving a fallback.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, YoloError::UnreadableCheckpoint { .. })
    }

    /// Maps a backend error raised inside a training step onto the error taxonomy.
    ///
    /// Out-of-memory failures surface from candle as opaque backend errors, so they are
    /// recognised by message.
    pub(crate) fn from_step(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("out of memory") || lower.contains("out_of_memory") {
            YoloError::ResourceExhausted(msg)
        } else {
            YoloError::CandleError(err)
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, YoloError>;
