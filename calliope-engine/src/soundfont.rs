//! Backend adapter for the rustysynth SoundFont renderer.
//!
//! rustysynth renders into separate left/right buffers; this adapter owns a
//! pair of scratch planes sized at construction, interleaves them into the
//! canonical stereo-f32 shape, and applies the volume-model output gain to
//! every sample on the way out. Reverb and chorus stay off so identical
//! event streams render identically.
//!
//! Bank fallback chain: resolved custom bank file, then caller-provided bank
//! bytes, then the embedded default bank. A numeric bank request indexes the
//! built-in table, which for a sample-based engine is just the embedded bank.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};

use crate::backend::{apply_gain, BackendConfig, BankRequest, SynthBackend, CHANNELS};
use crate::default_bank::default_bank;
use crate::error::DeviceError;

/// Frames rendered per engine call; bounds the scratch planes.
const RENDER_CHUNK: usize = 2048;

pub struct SoundFontBackend {
    synth: Option<Synthesizer>,
    font: Arc<SoundFont>,
    sample_rate: u32,
    output_gain: f32,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl SoundFontBackend {
    /// Build the adapter: pick a bank, then allocate the engine. Engine
    /// allocation failure is fatal; bank problems only demote down the
    /// fallback chain.
    pub fn new(config: &BackendConfig, custom_bank: Option<PathBuf>) -> Result<Self, DeviceError> {
        let font = Arc::new(Self::pick_bank(config, custom_bank)?);
        let mut backend = Self {
            synth: None,
            font,
            sample_rate: config.sample_rate.max(8_000),
            output_gain: config.volume_model.gain(),
            left: vec![0.0; RENDER_CHUNK],
            right: vec![0.0; RENDER_CHUNK],
        };
        // allocate eagerly so an unusable engine fails construction, not playback
        backend.synth = Some(backend.build_synth()?);
        Ok(backend)
    }

    fn pick_bank(
        config: &BackendConfig,
        custom_bank: Option<PathBuf>,
    ) -> Result<SoundFont, DeviceError> {
        if let Some(path) = custom_bank {
            match Self::load_bank_file(&path) {
                Ok(font) => return Ok(font),
                Err(err) => {
                    log::warn!("custom bank {} unusable ({err}); falling back", path.display());
                }
            }
        }
        if let BankRequest::Index(index) = config.bank {
            // sample-based engines carry no bank ROM; the built-in table is
            // the embedded bank alone
            if index != 0 {
                log::warn!("built-in bank index {index} out of range; using bank 0");
            }
            return Self::parse_bank(default_bank());
        }
        if let Some(data) = config.default_bank_data.as_deref() {
            match Self::parse_bank(data) {
                Ok(font) => return Ok(font),
                Err(err) => log::warn!("caller default bank unusable ({err}); using embedded bank"),
            }
        }
        Self::parse_bank(default_bank())
    }

    fn load_bank_file(path: &Path) -> Result<SoundFont, DeviceError> {
        let data = std::fs::read(path)
            .map_err(|e| DeviceError::BackendUnavailable(format!("read {}: {e}", path.display())))?;
        Self::parse_bank(&data)
    }

    fn parse_bank(data: &[u8]) -> Result<SoundFont, DeviceError> {
        let mut cursor = Cursor::new(data.to_vec());
        SoundFont::new(&mut cursor)
            .map_err(|e| DeviceError::BackendUnavailable(format!("SoundFont parse: {e}")))
    }

    fn build_synth(&self) -> Result<Synthesizer, DeviceError> {
        let mut settings = SynthesizerSettings::new(self.sample_rate as i32);
        settings.enable_reverb_and_chorus = false;
        Synthesizer::new(&self.font, &settings)
            .map_err(|e| DeviceError::BackendUnavailable(format!("synthesizer: {e}")))
    }
}

impl SynthBackend for SoundFontBackend {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.synth.is_none() {
            self.synth = Some(self.build_synth()?);
        }
        if let Some(synth) = self.synth.as_mut() {
            synth.note_off_all(true);
            for channel in 0..16 {
                synth.process_midi_message(channel, 0xB0, 0x78, 0); // all sound off
                synth.process_midi_message(channel, 0xB0, 0x79, 0); // reset controllers
            }
        }
        Ok(())
    }

    fn handle_short_event(&mut self, status: u8, param1: u8, param2: u8) {
        let Some(synth) = self.synth.as_mut() else {
            return;
        };
        let command = status & 0xF0;
        let channel = (status & 0x0F) as i32;

        match command {
            0x90 => synth.note_on(channel, param1 as i32, param2 as i32),
            0x80 => synth.note_off(channel, param1 as i32),
            0xA0 | 0xB0 | 0xE0 => {
                synth.process_midi_message(channel, command as i32, param1 as i32, param2 as i32);
            }
            0xC0 | 0xD0 => {
                synth.process_midi_message(channel, command as i32, param1 as i32, 0);
            }
            _ => {}
        }
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

        let mut done = 0;
        while done < frames {
            let n = (frames - done).min(RENDER_CHUNK);
            synth.render(&mut self.left[..n], &mut self.right[..n]);
            let out = &mut buffer[done * CHANNELS..(done + n) * CHANNELS];
            for (i, frame) in out.chunks_exact_mut(CHANNELS).enumerate() {
                frame[0] = self.left[i];
                frame[1] = self.right[i];
            }
            done += n;
        }
        apply_gain(buffer, self.output_gain);
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

    fn backend(model: VolumeModel) -> SoundFontBackend {
        let config = BackendConfig {
            sample_rate: 44_100,
            volume_model: model,
            ..Default::default()
        };
        SoundFontBackend::new(&config, None).expect("embedded bank backend")
    }

    fn render_note(backend: &mut SoundFontBackend, frames: usize) -> Vec<f32> {
        backend.open().unwrap();
        backend.handle_short_event(0x90, 69, 100);
        let mut buf = vec![0.0f32; frames * CHANNELS];
        assert_eq!(backend.render(&mut buf), frames);
        buf
    }

    #[test]
    fn renders_audible_output_from_embedded_bank() {
        let mut b = backend(VolumeModel::None);
        let buf = render_note(&mut b, 4096);
        assert!(buf.iter().any(|&s| s.abs() > 1e-4));
    }

    #[test]
    fn gain_model_scales_samples_exactly() {
        let reference = render_note(&mut backend(VolumeModel::None), 2048);
        let gained = render_note(&mut backend(VolumeModel::Soft), 2048);
        for (r, g) in reference.iter().zip(gained.iter()) {
            assert_eq!(*g, *r * VolumeModel::Soft.gain());
        }
    }

    #[test]
    fn unknown_status_is_ignored() {
        let mut b = backend(VolumeModel::None);
        b.open().unwrap();
        b.handle_short_event(0x71, 1, 2); // data byte as status
        b.handle_short_event(0xF0, 0, 0); // system status
        b.handle_long_event(&[0xF0, 0xF7]);
        let mut buf = vec![0.0f32; 128];
        assert_eq!(b.render(&mut buf), 64);
    }

    #[test]
    fn open_close_cycle_is_idempotent() {
        let mut b = backend(VolumeModel::None);
        b.open().unwrap();
        b.close();
        b.close();
        // render after close is silence-padded, not a panic
        let mut buf = vec![1.0f32; 64];
        assert_eq!(b.render(&mut buf), 32);
        assert!(buf.iter().all(|&s| s == 0.0));
        // reopen rebuilds the engine
        b.open().unwrap();
        let buf = render_note(&mut b, 1024);
        assert!(buf.iter().any(|&s| s.abs() > 1e-4));
    }

    #[test]
    fn bad_custom_bank_falls_back_to_embedded() {
        let config = BackendConfig { sample_rate: 44_100, ..Default::default() };
        let mut b =
            SoundFontBackend::new(&config, Some(PathBuf::from("/no/such/bank.sf2"))).unwrap();
        let buf = render_note(&mut b, 2048);
        assert!(buf.iter().any(|&s| s.abs() > 1e-4));
    }

    #[test]
    fn numeric_bank_index_uses_builtin_table() {
        let config = BackendConfig {
            sample_rate: 44_100,
            bank: BankRequest::Index(7),
            ..Default::default()
        };
        let mut b = SoundFontBackend::new(&config, None).unwrap();
        let buf = render_note(&mut b, 2048);
        assert!(buf.iter().any(|&s| s.abs() > 1e-4));
    }
}
