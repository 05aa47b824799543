//! Calliope Engine — backend contract, engine adapters, playback device.
//!
//! Crate layout:
//! - [`backend`]   : `SynthBackend` trait, backend/bank selection, gain models
//! - [`soundfont`] : adapter over the rustysynth SoundFont renderer
//! - [`fluid`]     : adapter over the oxisynth (FluidSynth-family) engine
//! - [`device`]    : `SoftSynthDevice`, the sample-clocked render loop
//! - [`error`]     : construction/control error taxonomy
//!
//! The device never allocates on the steady-state render path. Anything slow
//! (bank file loading, engine allocation) happens at construction or `open`,
//! off the audio callback.
//!
//! Feature flags `soundfont` and `fluid` (both default) compile the adapters
//! in or out; constructing a compiled-out backend reports
//! [`error::DeviceError::UnsupportedBackend`] instead of linking the engine.

pub mod backend;
pub mod device;
pub mod error;

#[cfg(feature = "fluid")]
pub mod fluid;
#[cfg(feature = "soundfont")]
pub mod soundfont;
#[cfg(feature = "soundfont")]
mod default_bank;

// Re-export some commonly used items to make downstream imports ergonomic.
pub use backend::{
    create_backend, BackendConfig, BackendKind, BankFormat, BankRequest, SynthBackend, VolumeModel,
};
pub use device::{DeviceState, SoftSynthDevice};
pub use error::DeviceError;
