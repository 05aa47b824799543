//! Embedded default instrument bank.
//!
//! A minimal, procedurally assembled SoundFont: one looped sine sample, one
//! instrument, one preset at bank 0 / program 0. It exists so the SoundFont
//! backend always has something to play when the caller supplies no bank,
//! like the embedded XG bank some FM engines ship. It is not meant to sound
//! good; it is meant to be valid, tiny, and deterministic.
//!
//! All chunk sizes are computed by construction, never hand-counted.

use std::sync::OnceLock;

// 100 frames per cycle at 44100 Hz = 441 Hz, within half a dozen cents of
// concert A; close enough for a placeholder bank.
const SAMPLE_RATE: u32 = 44_100;
const CYCLE: usize = 100;
const CYCLES: usize = 4;
const SAMPLE_LEN: usize = CYCLE * CYCLES;
const GUARD_POINTS: usize = 46;
const LOOP_START: usize = CYCLE * 2;
const LOOP_END: usize = SAMPLE_LEN;
const ROOT_KEY: u8 = 69;

// SoundFont generator operators used below.
const GEN_INSTRUMENT: u16 = 41;
const GEN_SAMPLE_MODES: u16 = 54;
const GEN_SAMPLE_ID: u16 = 53;
const LOOP_CONTINUOUS: u16 = 1;

/// The assembled SoundFont image, built once per process.
pub fn default_bank() -> &'static [u8] {
    static BANK: OnceLock<Vec<u8>> = OnceLock::new();
    BANK.get_or_init(build)
}

fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len() + 1);
    out.extend_from_slice(id);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    if body.len() % 2 != 0 {
        out.push(0);
    }
    out
}

fn list(kind: &[u8; 4], parts: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(kind);
    for part in parts {
        body.extend_from_slice(part);
    }
    chunk(b"LIST", &body)
}

fn fixed_name(name: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    let bytes = name.as_bytes();
    out[..bytes.len().min(19)].copy_from_slice(&bytes[..bytes.len().min(19)]);
    out
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn build() -> Vec<u8> {
    // --- INFO ---------------------------------------------------------------
    let ifil = chunk(b"ifil", &{
        let mut v = Vec::new();
        push_u16(&mut v, 2); // SoundFont 2.1
        push_u16(&mut v, 1);
        v
    });
    let isng = chunk(b"isng", b"EMU8000\0");
    let inam = chunk(b"INAM", b"Calliope Default\0");
    let info = list(b"INFO", &[ifil, isng, inam]);

    // --- sdta: one looped sine plus the mandated zero guard points ----------
    let mut smpl = Vec::with_capacity((SAMPLE_LEN + GUARD_POINTS) * 2);
    for i in 0..SAMPLE_LEN {
        let phase = (i % CYCLE) as f32 / CYCLE as f32;
        let value = (phase * core::f32::consts::TAU).sin() * 0.5 * 32_767.0;
        smpl.extend_from_slice(&(value as i16).to_le_bytes());
    }
    smpl.extend_from_slice(&[0u8; GUARD_POINTS * 2]);
    let sdta = list(b"sdta", &[chunk(b"smpl", &smpl)]);

    // --- pdta ---------------------------------------------------------------
    // phdr: one preset (bank 0, program 0) plus the terminal record
    let mut phdr = Vec::new();
    phdr.extend_from_slice(&fixed_name("Default"));
    push_u16(&mut phdr, 0); // preset number
    push_u16(&mut phdr, 0); // bank
    push_u16(&mut phdr, 0); // first pbag
    push_u32(&mut phdr, 0);
    push_u32(&mut phdr, 0);
    push_u32(&mut phdr, 0);
    phdr.extend_from_slice(&fixed_name("EOP"));
    push_u16(&mut phdr, 0);
    push_u16(&mut phdr, 0);
    push_u16(&mut phdr, 1); // terminal bag index
    push_u32(&mut phdr, 0);
    push_u32(&mut phdr, 0);
    push_u32(&mut phdr, 0);

    // pbag: one zone whose generator list is [instrument]
    let mut pbag = Vec::new();
    push_u16(&mut pbag, 0); // zone 0: first pgen
    push_u16(&mut pbag, 0);
    push_u16(&mut pbag, 1); // terminal
    push_u16(&mut pbag, 0);

    let pmod = vec![0u8; 10]; // terminal modulator only

    let mut pgen = Vec::new();
    push_u16(&mut pgen, GEN_INSTRUMENT);
    push_u16(&mut pgen, 0);
    push_u16(&mut pgen, 0); // terminal
    push_u16(&mut pgen, 0);

    // inst: one instrument plus terminal
    let mut inst = Vec::new();
    inst.extend_from_slice(&fixed_name("Default"));
    push_u16(&mut inst, 0);
    inst.extend_from_slice(&fixed_name("EOI"));
    push_u16(&mut inst, 1);

    // ibag: one zone whose generator list is [sampleModes, sampleID]
    let mut ibag = Vec::new();
    push_u16(&mut ibag, 0);
    push_u16(&mut ibag, 0);
    push_u16(&mut ibag, 2); // terminal
    push_u16(&mut ibag, 0);

    let imod = vec![0u8; 10]; // terminal modulator only

    let mut igen = Vec::new();
    push_u16(&mut igen, GEN_SAMPLE_MODES);
    push_u16(&mut igen, LOOP_CONTINUOUS);
    push_u16(&mut igen, GEN_SAMPLE_ID); // must close the zone
    push_u16(&mut igen, 0);
    push_u16(&mut igen, 0); // terminal
    push_u16(&mut igen, 0);

    // shdr: the sample plus terminal
    let mut shdr = Vec::new();
    shdr.extend_from_slice(&fixed_name("Sine"));
    push_u32(&mut shdr, 0);
    push_u32(&mut shdr, SAMPLE_LEN as u32);
    push_u32(&mut shdr, LOOP_START as u32);
    push_u32(&mut shdr, LOOP_END as u32);
    push_u32(&mut shdr, SAMPLE_RATE);
    shdr.push(ROOT_KEY);
    shdr.push(0); // pitch correction
    push_u16(&mut shdr, 0); // link
    push_u16(&mut shdr, 1); // mono
    shdr.extend_from_slice(&fixed_name("EOS"));
    push_u32(&mut shdr, 0);
    push_u32(&mut shdr, 0);
    push_u32(&mut shdr, 0);
    push_u32(&mut shdr, 0);
    push_u32(&mut shdr, 0);
    shdr.push(0);
    shdr.push(0);
    push_u16(&mut shdr, 0);
    push_u16(&mut shdr, 0);

    let pdta = list(
        b"pdta",
        &[
            chunk(b"phdr", &phdr),
            chunk(b"pbag", &pbag),
            chunk(b"pmod", &pmod),
            chunk(b"pgen", &pgen),
            chunk(b"inst", &inst),
            chunk(b"ibag", &ibag),
            chunk(b"imod", &imod),
            chunk(b"igen", &igen),
            chunk(b"shdr", &shdr),
        ],
    );

    let mut body = Vec::new();
    body.extend_from_slice(b"sfbk");
    body.extend_from_slice(&info);
    body.extend_from_slice(&sdta);
    body.extend_from_slice(&pdta);
    chunk(b"RIFF", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_line_up() {
        let bank = default_bank();
        assert_eq!(&bank[..4], b"RIFF");
        assert_eq!(&bank[8..12], b"sfbk");
        // the RIFF size covers everything after the 8-byte chunk header
        let declared = u32::from_le_bytes(bank[4..8].try_into().unwrap()) as usize;
        assert_eq!(declared, bank.len() - 8);
    }

    #[test]
    fn parses_as_a_soundfont() {
        let mut cursor = std::io::Cursor::new(default_bank().to_vec());
        let font = rustysynth::SoundFont::new(&mut cursor).expect("embedded bank must parse");
        assert_eq!(font.get_presets().len(), 1);
    }
}
