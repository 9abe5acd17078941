use std::time::Duration;

use lib::image::ImageError;
use thiserror::Error;

use crate::frame::StreamKind;

#[derive(Debug, Error)]
pub enum KinectDeviceError {
    #[error("Kinect device not found")]
    DeviceNotFound(Option<String>),

    #[error("query caps failed (device {0}, err {1})")]
    QueryCapsFailed(String, #[source] std::io::Error),

    #[error("set format failed (device {0}, err {1})")]
    SetFormatFailed(String, #[source] std::io::Error),

    #[error("set params failed (device {0}, err {1})")]
    SetParamsFailed(String, #[source] std::io::Error),

    #[error("stream creation failed (device {0}, err {1})")]
    CreateStreamFailed(String, #[source] std::io::Error),

    #[error("device initialization failed at stage \"{stage}\": {reason}")]
    Initialize { stage: &'static str, reason: String },

    #[error("{0} frame retrieval failed: {1}")]
    FrameRetrieval(StreamKind, String),

    #[error("{0} frame locked before the stream signalled ready")]
    NoFrameLocked(StreamKind),

    #[error("{kind} frame is {width}x{height}, destination buffer is {expected_width}x{expected_height}")]
    ResolutionMismatch {
        kind: StreamKind,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("{kind} frame too short: pitch {pitch}, {len} bytes, {needed} needed")]
    ShortFrame {
        kind: StreamKind,
        pitch: usize,
        len: usize,
        needed: usize,
    },

    #[error("no {0} frame within {1:?}")]
    Timeout(StreamKind, Duration),

    #[error("wait for {0} frame cancelled by shutdown")]
    Cancelled(StreamKind),

    #[error("saving {0} failed: {1}")]
    ImageSave(String, #[source] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KinectDeviceError {
    pub fn initialize(stage: &'static str, reason: impl Into<String>) -> Self {
        KinectDeviceError::Initialize {
            stage,
            reason: reason.into(),
        }
    }

    /// True for errors the capture loop should stop on rather than skip.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KinectDeviceError::Cancelled(_))
    }
}

pub type KinectDeviceResult<T> = Result<T, KinectDeviceError>;
