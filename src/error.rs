use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The frame does not match the array it was written to.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// A chunk buffer is still held by an in-flight compression task.
    #[error("chunk buffers for {data_root:?} still in flight after {waited:?}")]
    Backpressure { data_root: PathBuf, waited: Duration },
    /// External metadata was supplied but could not be parsed.
    #[error("external metadata is not valid JSON: {0}")]
    ExternalMetadata(String),
    /// The array stream failed hard earlier and accepts no further data.
    #[error("writer for {0:?} aborted after an earlier failure")]
    Aborted(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    /// Whether the caller may retry or skip the frame and keep writing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidFrame(_) | Self::Backpressure { .. })
    }
}
