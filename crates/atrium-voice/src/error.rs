//! Error types for the voice conversation engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation engine.
///
/// Device, transport and protocol errors are fatal to the current call and
/// surface to the caller; codec errors are handled locally (the frame is
/// skipped and the stream continues). Playback underrun is not an error at
/// all — the scheduler simply waits for more data.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DeviceNameError> for VoiceError {
    fn from(err: cpal::DeviceNameError) -> Self {
        VoiceError::Device(err.to_string())
    }
}
