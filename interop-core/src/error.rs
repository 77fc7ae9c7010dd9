//! Error taxonomy for the pipeline.
//!
//! Setup-time failures abort construction and come back to the caller as a
//! single error. Steady-state failures are absorbed by the sample providers and
//! only [`ErrorKind::SourceFailure`] escalates to pipeline-fatal.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

/// Coarse classification used by the controller to decide what is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation failed during setup. Fatal to the affected stream only.
    ResourceExhaustion,
    /// Bad URI, unopenable container, unknown codec or invalid option.
    UnsupportedOrInvalidInput,
    /// A single packet or frame could not be decoded. Skipped.
    DecodeFailure,
    /// The source could not honour a seek. Playback continues.
    SeekFailure,
    /// The packet source itself cannot continue. Pipeline-fatal.
    SourceFailure,
}

/// One rejected entry of the container option map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.key, self.value, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum InteropError {
    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid option(s): {}", format_option_errors(.0))]
    InvalidOptions(Vec<OptionError>),
    #[error("No decoder available for {0}")]
    NoDecoder(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Seek failed: {0}")]
    Seek(String),
    #[error("Source failure: {0}")]
    Source(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pipeline closed")]
    Closed,
}

pub type InteropResult<T> = Result<T, InteropError>;

impl InteropError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            Self::UnsupportedInput(_)
            | Self::InvalidInput(_)
            | Self::InvalidOptions(_)
            | Self::NoDecoder(_) => ErrorKind::UnsupportedOrInvalidInput,
            Self::Decode(_) => ErrorKind::DecodeFailure,
            Self::Seek(_) => ErrorKind::SeekFailure,
            Self::Source(_) | Self::Io(_) | Self::Closed => ErrorKind::SourceFailure,
        }
    }

    /// True when the error must tear the whole pipeline down.
    pub fn is_pipeline_fatal(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Io(_))
    }
}

impl From<TryReserveError> for InteropError {
    fn from(e: TryReserveError) -> Self {
        Self::ResourceExhaustion(e.to_string())
    }
}

fn format_option_errors(errors: &[OptionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
