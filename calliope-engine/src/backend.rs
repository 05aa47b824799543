//! The synthesis backend contract and backend selection.
//!
//! Every external synthesis engine hides behind [`SynthBackend`]: five
//! operations, no engine state leaking out. Adapters implement the contract
//! directly (one level, no adapter-of-adapter towers), and a device drives
//! exactly one backend at a time.
//!
//! Bank selection policy, shared by all adapters:
//! - a purely numeric bank argument is a **built-in bank index**, never a file
//! - any other name goes through the host's resolver callback; a resolved
//!   path is loaded as the custom bank, and custom banks win over built-ins
//! - with no bank given, or when resolution fails, the adapter falls back to
//!   its built-in/default bank

use std::path::PathBuf;

use crate::error::DeviceError;

/// Stereo interleaved output; fixed for every backend.
pub const CHANNELS: usize = 2;

// ----------------------------- Contract ---------------------------------------------

/// The narrow contract every synthesis backend implements.
///
/// Dispatch calls are fire-and-forget: a malformed or unsupported event is a
/// no-op, never an error. `render` always fills the whole request (engines
/// silence-pad on underrun) because callers size buffers to a fixed audio
/// callback period.
pub trait SynthBackend: Send {
    /// Reset the underlying engine to a clean runtime state. Idempotent, and
    /// valid again after `close`.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Dispatch one short MIDI message by the high nibble of `status`.
    /// Unrecognized status values are silently ignored.
    fn handle_short_event(&mut self, status: u8, param1: u8, param2: u8);

    /// Forward one complete system-exclusive payload. No chunking.
    fn handle_long_event(&mut self, data: &[u8]);

    /// Fill `buffer` (interleaved stereo f32, `buffer.len() / 2` frames) and
    /// return the frame count written, which is always the full request.
    fn render(&mut self, buffer: &mut [f32]) -> usize;

    /// Release engine resources. Safe to call repeatedly and at any state.
    fn close(&mut self);
}

// ----------------------------- Selection --------------------------------------------

/// Which adapter to construct. Variants exist regardless of enabled cargo
/// features so callers can name them; constructing a compiled-out backend
/// fails with [`DeviceError::UnsupportedBackend`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// SoundFont renderer (rustysynth).
    SoundFont,
    /// FluidSynth-family synthesizer (oxisynth).
    Fluid,
}

/// Instrument bank to use, after the numeric-vs-name rule has been applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BankRequest {
    /// No caller preference: adapter default.
    #[default]
    Default,
    /// Built-in bank index (a purely numeric argument).
    Index(u32),
    /// Bank name to resolve to a file through the host callback.
    Named(String),
}

impl BankRequest {
    /// Classify a raw caller argument: purely numeric means index, anything
    /// else is a name. Empty input means no preference.
    pub fn parse(arg: &str) -> Self {
        if arg.is_empty() {
            BankRequest::Default
        } else if let Ok(index) = arg.parse::<u32>() {
            BankRequest::Index(index)
        } else {
            BankRequest::Named(arg.to_owned())
        }
    }
}

/// Bank file family a resolver is asked for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BankFormat {
    Sf2,
    Sf3,
}

/// Host-supplied bank resolution callback: name in, path out. Invoked only
/// for non-numeric bank identifiers, outside the render path.
pub type BankResolver<'a> = dyn Fn(&str, BankFormat) -> Option<PathBuf> + 'a;

/// Resolve a bank request to a concrete custom-bank path, or `None` to use
/// the adapter's built-in fallback chain. Mirrors on the Rust side what the
/// per-device factory does with its bank argument in the original C API.
pub fn resolve_bank(
    request: &BankRequest,
    format: BankFormat,
    resolver: Option<&BankResolver>,
) -> Option<PathBuf> {
    match request {
        BankRequest::Named(name) => match resolver {
            Some(resolve) => {
                let path = resolve(name, format);
                if path.is_none() {
                    log::warn!("bank {name:?} did not resolve; using default bank");
                }
                path
            }
            // without a resolver the name is taken as a literal path
            None => Some(PathBuf::from(name)),
        },
        BankRequest::Default | BankRequest::Index(_) => None,
    }
}

// ----------------------------- Gain normalization ------------------------------------

/// Loudness normalization applied after synthesis, as a fixed documented
/// multiplier per model; nothing is auto-calibrated. The same scalar hits
/// every sample of every render.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VolumeModel {
    /// Louder sources: x2.0
    Generic,
    /// Middle ground: x2.5
    Soft,
    /// Quiet sources: x3.5
    #[default]
    Quiet,
    /// Quietest sources: x3.8
    Full,
    /// No normalization: x1.0
    None,
}

impl VolumeModel {
    /// The documented per-model output gain factor.
    #[inline]
    pub const fn gain(self) -> f32 {
        match self {
            VolumeModel::Generic => 2.0,
            VolumeModel::Soft => 2.5,
            VolumeModel::Quiet => 3.5,
            VolumeModel::Full => 3.8,
            VolumeModel::None => 1.0,
        }
    }
}

/// Scale an interleaved buffer in place by a volume model's factor.
#[inline]
pub fn apply_gain(buffer: &mut [f32], gain: f32) {
    if gain != 1.0 {
        for sample in buffer.iter_mut() {
            *sample *= gain;
        }
    }
}

// ----------------------------- Factory -----------------------------------------------

/// Everything an adapter needs at construction. Copied per instance; there is
/// no process-wide backend configuration.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub sample_rate: u32,
    pub bank: BankRequest,
    pub volume_model: VolumeModel,
    /// In-memory default bank image, tried when no custom bank loads.
    pub default_bank_data: Option<Vec<u8>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            bank: BankRequest::Default,
            volume_model: VolumeModel::default(),
            default_bank_data: None,
        }
    }
}

/// Construct the requested backend. Engine allocation failure is fatal
/// ([`DeviceError::BackendUnavailable`]); a backend compiled out of the build
/// fails immediately with [`DeviceError::UnsupportedBackend`].
pub fn create_backend(
    kind: BackendKind,
    config: &BackendConfig,
    resolver: Option<&BankResolver>,
) -> Result<Box<dyn SynthBackend>, DeviceError> {
    match kind {
        #[cfg(feature = "soundfont")]
        BackendKind::SoundFont => {
            let custom = resolve_bank(&config.bank, BankFormat::Sf2, resolver);
            Ok(Box::new(crate::soundfont::SoundFontBackend::new(config, custom)?))
        }
        #[cfg(feature = "fluid")]
        BackendKind::Fluid => {
            let custom = resolve_bank(&config.bank, BankFormat::Sf2, resolver);
            Ok(Box::new(crate::fluid::FluidBackend::new(config, custom)?))
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = (config, resolver);
            Err(DeviceError::UnsupportedBackend(other))
        }
    }
}

// ----------------------------- Tests -------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_bank_is_always_an_index() {
        assert_eq!(BankRequest::parse("3"), BankRequest::Index(3));
        assert_eq!(BankRequest::parse("0"), BankRequest::Index(0));
        // mixed content is a name, not a number
        assert_eq!(BankRequest::parse("3brass"), BankRequest::Named("3brass".into()));
        assert_eq!(BankRequest::parse("general"), BankRequest::Named("general".into()));
        assert_eq!(BankRequest::parse(""), BankRequest::Default);
    }

    #[test]
    fn named_bank_goes_through_resolver() {
        let resolver = |name: &str, format: BankFormat| {
            assert_eq!(format, BankFormat::Sf2);
            (name == "known").then(|| PathBuf::from("/banks/known.sf2"))
        };
        let found = resolve_bank(&BankRequest::parse("known"), BankFormat::Sf2, Some(&resolver));
        assert_eq!(found, Some(PathBuf::from("/banks/known.sf2")));

        // resolution failure falls back to the adapter default
        let missing =
            resolve_bank(&BankRequest::parse("missing"), BankFormat::Sf2, Some(&resolver));
        assert_eq!(missing, None);

        // a numeric argument never reaches the resolver
        let indexed = resolve_bank(&BankRequest::parse("7"), BankFormat::Sf2, Some(&resolver));
        assert_eq!(indexed, None);
    }

    #[test]
    fn unresolved_name_is_a_literal_path() {
        let path = resolve_bank(&BankRequest::parse("local.sf2"), BankFormat::Sf2, None);
        assert_eq!(path, Some(PathBuf::from("local.sf2")));
    }

    #[test]
    fn gain_table_is_fixed() {
        assert_eq!(VolumeModel::Generic.gain(), 2.0);
        assert_eq!(VolumeModel::Soft.gain(), 2.5);
        assert_eq!(VolumeModel::Quiet.gain(), 3.5);
        assert_eq!(VolumeModel::Full.gain(), 3.8);
        assert_eq!(VolumeModel::None.gain(), 1.0);

        let mut buf = [0.5f32, -0.25, 1.0, 0.0];
        apply_gain(&mut buf, VolumeModel::Generic.gain());
        assert_eq!(buf, [1.0, -0.5, 2.0, 0.0]);
    }
}
