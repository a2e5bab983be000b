use std::time::Duration;
use thiserror::Error;

/// Raised before any round runs; never retryable.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("target image not found: {0}")]
    TargetMissing(String),
    #[error("failed to decode target image {path}: {reason}")]
    TargetUnreadable { path: String, reason: String },
    #[error("target image has unusable dimensions {width}x{height}")]
    TargetDimensions { width: u32, height: u32 },
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    PixelBuffer { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to launch {command}: {reason}")]
    Spawn { command: String, reason: String },
    #[error("{command} timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },
    #[error("{command} exited with status {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("generation service returned no usable code")]
    EmptyReply,
    #[error("gateway i/o failed: {0}")]
    Io(String),
}

impl GatewayError {
    /// Spawn failures and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Spawn { .. } | GatewayError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page load timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("renderer unavailable: {0}")]
    RendererUnavailable(String),
    #[error("failed to prepare renderer context: {0}")]
    Context(String),
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("judge service failed: {0}")]
    Judge(String),
    #[error("judge reply had no score: {0}")]
    Unparsable(String),
    #[error(
        "candidate is {}x{} but the target is {}x{}",
        .actual.0, .actual.1, .expected.0, .expected.1
    )]
    Dimensions {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("scoring timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("all evaluators failed: {0}")]
    Composite(String),
}

/// Errors surfaced by the session control surface.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("unknown session: {0}")]
    NotFound(String),
    #[error("session {0} was already started")]
    AlreadyStarted(String),
    #[error("session {0} has not finished")]
    NotFinished(String),
}
