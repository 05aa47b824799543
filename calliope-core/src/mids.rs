//! Decoder for the block-structured MIDS note-stream container.
//!
//! Layout (all integers little-endian 32-bit):
//! - offset 12: `"fmt "` tag
//! - offset 20: tick division (ticks per quarter note)
//! - offset 28: format-flags word; nonzero selects compact two-word records
//! - offset 32: `"data"` tag
//! - offset 40: block count
//! - offset 44: block records, each `[startTick:4][byteLength:4][payload]`,
//!   packed with no padding
//!
//! Block payloads concatenate into one word buffer holding event records:
//! `(delta, streamId, event)` normally, `(delta, event)` when the flags word
//! selects the compact layout. Either way [`MidsSong::make_events`] emits
//! full `(delta, stream, event)` triplets, substituting 0 for the missing
//! middle word.
//!
//! A container failing any header check decodes to an inert song: valid()
//! false, immediately done, `make_events` a no-op. The original consumer of
//! this format silently skips corrupt or foreign files, and callers here are
//! expected to probe [`MidsSong::is_valid`] before use.

use alloc::vec::Vec;

use crate::stream::{EventSource, TickBudget, DEFAULT_TEMPO};
use crate::wire::{event_kind, event_param, tag_at, u32_at, EVENT_TEMPO};

// ----------------------------- Container offsets ------------------------------------

const FMT_TAG_OFFSET: usize = 12;
const DIVISION_OFFSET: usize = 20;
const FLAGS_OFFSET: usize = 28;
const DATA_TAG_OFFSET: usize = 32;
const BLOCK_COUNT_OFFSET: usize = 40;
const FIRST_BLOCK_OFFSET: usize = 44;

/// Per-record word layout, fixed at load time from the format-flags word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecordLayout {
    /// `(delta, streamId, event)`
    Full,
    /// `(delta, event)`; the stream word is implicit
    Compact,
}

impl RecordLayout {
    #[inline]
    fn words(self) -> usize {
        match self {
            RecordLayout::Full => 3,
            RecordLayout::Compact => 2,
        }
    }

    /// Buffer index of the first record's event word, where an embedded
    /// initial tempo event lives.
    #[inline]
    fn first_event_index(self) -> usize {
        match self {
            RecordLayout::Full => 2,
            RecordLayout::Compact => 1,
        }
    }
}

// ----------------------------- Song ------------------------------------------------

/// A decoded MIDS song: the concatenated event words plus cursor and clock
/// state. Built once from the raw container; rewound with `restart`.
pub struct MidsSong {
    buffer: Vec<u32>,
    position: usize,
    max_position: usize,
    division: u32,
    tempo: u32,
    layout: RecordLayout,
    valid: bool,
    budget: TickBudget,
}

impl MidsSong {
    /// Decode a raw container. Never fails; a rejected buffer yields an inert
    /// song with [`is_valid`](Self::is_valid) false.
    pub fn load(data: &[u8]) -> Self {
        let mut song = Self {
            buffer: Vec::new(),
            position: 0,
            max_position: 0,
            division: 1,
            tempo: DEFAULT_TEMPO,
            layout: RecordLayout::Full,
            valid: false,
            budget: TickBudget::new(),
        };

        // Validate the header first.
        if !tag_at(data, FMT_TAG_OFFSET, b"fmt ") {
            return song;
        }
        if !tag_at(data, DATA_TAG_OFFSET, b"data") || data.len() < FIRST_BLOCK_OFFSET {
            return song;
        }
        let division = u32_at(data, DIVISION_OFFSET);
        if division == 0 {
            // a zero division cannot drive any duration conversion
            return song;
        }
        let flags = u32_at(data, FLAGS_OFFSET);

        // Concatenate the block payloads into one word buffer. Each block
        // record is an 8-byte header followed by `byte_len` payload bytes.
        let mut blocks = u32_at(data, BLOCK_COUNT_OFFSET);
        let mut cursor = FIRST_BLOCK_OFFSET;
        while blocks > 0 {
            if cursor + 8 > data.len() {
                log::warn!("block header past end of container; dropping remaining blocks");
                break;
            }
            let byte_len = u32_at(data, cursor + 4) as usize;
            let payload = &data[cursor + 8..];
            let byte_len = if byte_len > payload.len() {
                log::warn!(
                    "block payload truncated by container: {} of {byte_len} bytes present",
                    payload.len()
                );
                payload.len()
            } else {
                byte_len
            };
            if byte_len % 4 != 0 {
                log::warn!("block payload not word-aligned; dropping {} trailing bytes", byte_len % 4);
            }
            for word in payload[..byte_len].chunks_exact(4) {
                song.buffer.push(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            }
            cursor += 8 + byte_len;
            blocks -= 1;
        }

        song.division = division;
        song.layout = if flags != 0 { RecordLayout::Compact } else { RecordLayout::Full };
        song.max_position = song.buffer.len().saturating_sub(1);
        song.valid = true;
        song.seed_initial_tempo();
        song
    }

    /// True when the container passed its header checks.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Words decoded from the container.
    #[inline]
    pub fn len_words(&self) -> usize {
        self.buffer.len()
    }

    /// Adopt the embedded tempo of the first record, when present. Runs at
    /// load and again on every restart.
    fn seed_initial_tempo(&mut self) {
        self.tempo = DEFAULT_TEMPO;
        let index = self.layout.first_event_index();
        if let Some(&word) = self.buffer.get(index) {
            if event_kind(word) == EVENT_TEMPO && event_param(word) != 0 {
                self.tempo = event_param(word);
            }
        }
    }
}

impl EventSource for MidsSong {
    fn division(&self) -> u32 {
        self.division
    }

    fn tempo(&self) -> u32 {
        self.tempo
    }

    fn set_tempo(&mut self, us_per_quarter: u32) {
        self.tempo = us_per_quarter.max(1);
        self.budget.rebase(self.tempo);
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn check_done(&self) -> bool {
        !self.valid || self.position >= self.max_position
    }

    fn restart(&mut self) {
        self.position = 0;
        self.budget.reset();
        self.seed_initial_tempo();
    }

    fn make_events(&mut self, dest: &mut [u32], budget_us: u64) -> usize {
        if self.check_done() {
            return 0;
        }
        self.budget.grant(budget_us, self.division);

        let record = self.layout.words();
        let mut written = 0;
        while written + 3 <= dest.len() && !self.budget.exhausted(self.tempo) {
            if self.position + record > self.buffer.len() {
                // trailing partial record: treat the stream as finished
                self.position = self.max_position;
                break;
            }
            let delta = self.buffer[self.position];
            dest[written] = delta;
            match self.layout {
                RecordLayout::Full => {
                    dest[written + 1] = self.buffer[self.position + 1];
                    dest[written + 2] = self.buffer[self.position + 2];
                }
                RecordLayout::Compact => {
                    dest[written + 1] = 0;
                    dest[written + 2] = self.buffer[self.position + 1];
                }
            }
            self.position += record;
            written += 3;
            self.budget.spend(delta);
            if self.position >= self.max_position {
                break;
            }
        }
        written
    }
}

// ----------------------------- Tests ------------------------------------------------
