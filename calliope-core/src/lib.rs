#![cfg_attr(not(feature = "std"), no_std)]
//! Calliope Core — canonical timed-event stream model and MIDS container decoder.
//!
//! Features
//! - `std`    : (default) use the Rust standard library
//! - `no-std` : build with `#![no_std]`; the crate only needs `alloc`
//!
//! Modules
//! - [`wire`]   : little-endian readers/writers and stream event-word packing
//! - [`stream`] : event model, the `EventSource` trait, exact tick budgeting
//! - [`mids`]   : block-structured MIDS container decoder
//!
//! Design
//! - Decoding byte-swaps on read unconditionally; the on-disk format is
//!   little-endian on every platform
//! - All duration math is exact integer arithmetic so repeated conversions
//!   never drift against an audio sample clock
//! - A malformed container yields an inert, immediately-done song rather than
//!   an error; callers check [`mids::MidsSong::is_valid`]

extern crate alloc;

pub mod mids;
pub mod stream;
pub mod wire;

/// Commonly used types/functions for convenience:
pub mod prelude {
    pub use crate::mids::MidsSong;
    pub use crate::stream::{
        BufferSource, EventData, EventSource, StreamEvent, TickBudget, DEFAULT_TEMPO,
    };
    pub use crate::wire::{
        event_kind, event_param, pack_event, pack_short, EVENT_LONG, EVENT_NOP, EVENT_SHORT,
        EVENT_TEMPO,
    };
}

#[cfg(test)]
mod smoke {

    #[test]
    fn prelude_exists() {
        use crate::prelude::*;
        let _ = pack_short(0x90, 60, 100);
        let _ = pack_event(EVENT_TEMPO, DEFAULT_TEMPO);
        let song = MidsSong::load(&[]);
        assert!(!song.is_valid());
        assert!(song.check_done());
    }
}
