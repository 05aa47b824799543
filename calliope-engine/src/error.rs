//! Error taxonomy for device construction and playback control.
//!
//! Per-event failures have no channel at all: dispatch is fire-and-forget and
//! malformed events are absorbed, because a render deadline cannot wait on
//! error recovery. Errors here cover the coarse, caller-visible facts only.

use thiserror::Error;

use crate::backend::BackendKind;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The container failed its header checks and decoded to an inert stream.
    /// The decoder itself never raises; this surfaces when a caller tries to
    /// play the inert result.
    #[error("source stream is invalid or empty")]
    InvalidSource,

    /// The external synthesis engine could not be created. Fatal for this
    /// backend; callers fall back to another backend or refuse playback.
    #[error("backend engine unavailable: {0}")]
    BackendUnavailable(String),

    /// The requested backend was compiled out of this build.
    #[error("backend {0:?} is not enabled in this build")]
    UnsupportedBackend(BackendKind),

    /// Operation requires a different device state (e.g. play before open).
    #[error("device is {actual:?}, expected {expected:?}")]
    WrongState {
        expected: crate::device::DeviceState,
        actual: crate::device::DeviceState,
    },
}
