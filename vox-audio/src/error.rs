//! Error types for audio pipelines.

use thiserror::Error;

/// Result type for audio operations.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Errors that can occur while capturing, scheduling or metering audio.
///
/// The type is `Clone` because a single in-flight start is shared between
/// every caller that asked for it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Microphone or speaker unavailable, or permission denied.
    #[error("Audio device error: {0}")]
    DeviceError(String),

    /// An audio unit failed to install into a context.
    #[error("Failed to load audio unit '{unit}': {cause}")]
    LoadError {
        /// Name of the unit.
        unit: String,
        /// Underlying failure.
        cause: String,
    },

    /// A unit was instantiated before being installed.
    #[error("Audio unit '{0}' is not installed in this context")]
    UnitNotInstalled(String),

    /// Malformed sample data.
    #[error("Audio format error: {0}")]
    FormatError(String),
}

impl AudioError {
    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::DeviceError(msg.into())
    }

    /// Create a new unit load error.
    pub fn load<U: Into<String>, C: Into<String>>(unit: U, cause: C) -> Self {
        Self::LoadError { unit: unit.into(), cause: cause.into() }
    }

    /// Create a new format error.
    pub fn format<S: Into<String>>(msg: S) -> Self {
        Self::FormatError(msg.into())
    }

    /// Whether the failure only degrades a feature (metering) rather than the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LoadError { .. } | Self::UnitNotInstalled(_))
    }
}
