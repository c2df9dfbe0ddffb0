/// Result alias that carries the custom [`BpmOscError`] type.
pub type Result<T> = std::result::Result<T, BpmOscError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BpmOscError {
    /// Free-form error surfaced to the caller as a readable message.
    #[error("{0}")]
    Message(String),
    /// A caller handed in data that violates a documented precondition.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The tempo estimator was fed a frame of the wrong length. This is a
    /// wiring bug between the audio layer and the estimator.
    #[error("audio frame has {actual} samples, estimator expects {expected}")]
    InvalidFrameSize { expected: usize, actual: usize },
    /// A send BPM outside `[20, 500]` reached code that divides by it.
    #[error("send bpm {0} is outside the supported range")]
    InvalidBpm(u32),
    /// Configuration could not be read or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// The audio device or stream could not be opened.
    #[error("audio error: {0}")]
    Audio(String),
    /// OSC encoding or socket setup failed.
    #[error("osc error: {0}")]
    Osc(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around FFT planning/processing errors.
    #[error("fft error: {0}")]
    Fft(#[from] realfft::FftError),
}

impl BpmOscError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for BpmOscError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BpmOscError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
