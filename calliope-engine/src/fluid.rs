//! Backend adapter for the oxisynth synthesizer (FluidSynth family).
//!
//! oxisynth takes typed events and writes interleaved stereo directly, so
//! this adapter is mostly a translation table plus the shared volume-model
//! gain stage. Without any bank it stays functional and renders silence;
//! the fallback chain is custom bank file, then caller-provided bank bytes,
//! then nothing.

use std::io::Cursor;
use std::path::PathBuf;

use oxisynth::{MidiEvent, SoundFont, Synth, SynthDescriptor};

use crate::backend::{apply_gain, BackendConfig, SynthBackend, CHANNELS};
use crate::error::DeviceError;

pub struct FluidBackend {
    synth: Option<Synth>,
    bank_image: Option<Vec<u8>>,
    sample_rate: u32,
    output_gain: f32,
}

impl FluidBackend {
    /// Build the adapter: stage the bank image, then allocate the engine.
    /// Engine allocation failure is fatal; bank problems only demote down
    /// the fallback chain.
    pub fn new(config: &BackendConfig, custom_bank: Option<PathBuf>) -> Result<Self, DeviceError> {
        let bank_image = Self::pick_bank_image(config, custom_bank);
        let mut backend = Self {
            synth: None,
            bank_image,
            sample_rate: config.sample_rate.max(8_000),
            output_gain: config.volume_model.gain(),
        };
        backend.synth = Some(backend.build_synth()?);
        Ok(backend)
    }

    fn pick_bank_image(config: &BackendConfig, custom_bank: Option<PathBuf>) -> Option<Vec<u8>> {
        if let Some(path) = custom_bank {
            match std::fs::read(&path) {
                Ok(data) => return Some(data),
                Err(err) => {
                    log::warn!("custom bank {} unreadable ({err}); falling back", path.display());
                }
            }
        }
        config.default_bank_data.clone()
    }

    fn build_synth(&self) -> Result<Synth, DeviceError> {
        let descriptor = SynthDescriptor {
            sample_rate: self.sample_rate as f32,
            ..Default::default()
        };
        let mut synth = Synth::new(descriptor)
            .map_err(|e| DeviceError::BackendUnavailable(format!("oxisynth: {e:?}")))?;
        if let Some(image) = self.bank_image.as_ref() {
            let mut cursor = Cursor::new(image.clone());
            match SoundFont::load(&mut cursor) {
                Ok(font) => {
                    synth.add_font(font, true);
                }
                Err(err) => {
                    log::warn!("bank image rejected by engine ({err:?}); continuing without a bank");
                }
            }
        }
        Ok(synth)
    }

    fn quiet_all_channels(synth: &mut Synth) {
        for channel in 0..16u8 {
            // all sound off, then reset controllers
            let _ = synth.send_event(MidiEvent::ControlChange { channel, ctrl: 0x78, value: 0 });
            let _ = synth.send_event(MidiEvent::ControlChange { channel, ctrl: 0x79, value: 0 });
        }
    }
}

impl SynthBackend for FluidBackend {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.synth.is_none() {
            self.synth = Some(self.build_synth()?);
        }
        if let Some(synth) = self.synth.as_mut() {
            Self::quiet_all_channels(synth);
        }
        Ok(())
    }

    fn handle_short_event(&mut self, status: u8, param1: u8, param2: u8) {
        let Some(synth) = self.synth.as_mut() else {
            return;
        };
        let channel = status & 0x0F;
        let event = match status & 0xF0 {
            0x90 => MidiEvent::NoteOn { channel, key: param1, vel: param2 },
            0x80 => MidiEvent::NoteOff { channel, key: param1 },
            0xA0 => MidiEvent::PolyphonicKeyPressure { channel, key: param1, value: param2 },
            0xB0 => MidiEvent::ControlChange { channel, ctrl: param1, value: param2 },
            0xC0 => MidiEvent::ProgramChange { channel, program_id: param1 },
            0xD0 => MidiEvent::ChannelPressure { channel, value: param1 },
            0xE0 => MidiEvent::PitchBend {
                channel,
                value: (param1 as u16) | ((param2 as u16) << 7),
            },
            _ => return,
        };
        // dispatch is fire-and-forget; a rejected event is a no-op
        let _ = synth.send_event(event);
    }

    fn handle_long_event(&mut self, data: &[u8]) {
        // the engine has no system-exclusive entry point
        log::debug!("dropping {}-byte system-exclusive message", data.len());
    }

    fn render(&mut self, buffer: &mut [f32]) -> usize {
        let frames = buffer.len() / CHANNELS;
        let Some(synth) = self.synth.as_mut() else {
            buffer.fill(0.0);
            return frames;
        };
        let out = &mut buffer[..frames * CHANNELS];
        synth.write(&mut out[..]);
        apply_gain(out, self.output_gain);
        frames
    }

    fn close(&mut self) {
        self.synth = None;
    }
}

// ----------------------------- Tests -------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VolumeModel;

    fn backend() -> FluidBackend {
        let config = BackendConfig {
            sample_rate: 44_100,
            volume_model: VolumeModel::None,
            ..Default::default()
        };
        FluidBackend::new(&config, None).expect("engine should allocate")
    }

    #[test]
    fn bankless_backend_renders_full_silence() {
        let mut b = backend();
        b.open().unwrap();
        b.handle_short_event(0x90, 60, 100);
        let mut buf = vec![1.0f32; 512 * CHANNELS];
        assert_eq!(b.render(&mut buf), 512);
        assert!(buf.iter().all(|&s| s.abs() < 1e-6));
    }

    #[test]
    fn dispatch_table_covers_all_nibbles() {
        let mut b = backend();
        b.open().unwrap();
        for status in [0x90u8, 0x80, 0xA0, 0xB0, 0xC0, 0xD0, 0xE0] {
            b.handle_short_event(status | 0x02, 64, 64);
        }
        b.handle_short_event(0x42, 0, 0); // not a status byte: ignored
        b.handle_long_event(&[0xF0, 0x41, 0xF7]);
        let mut buf = vec![0.0f32; 256];
        assert_eq!(b.render(&mut buf), 128);
    }

    #[test]
    fn close_is_repeatable_and_reopenable() {
        let mut b = backend();
        b.open().unwrap();
        b.close();
        b.close();
        let mut buf = vec![1.0f32; 64];
        assert_eq!(b.render(&mut buf), 32);
        assert!(buf.iter().all(|&s| s == 0.0));
        b.open().unwrap();
        assert_eq!(b.render(&mut buf), 32);
    }

    #[test]
    fn missing_custom_bank_does_not_fail_construction() {
        let config = BackendConfig::default();
        let b = FluidBackend::new(&config, Some(PathBuf::from("/no/such/bank.sf2")));
        assert!(b.is_ok());
    }
}
