//! C ABI wrapper for the Calliope playback engine.
//!
//! Exposes a small set of functions to create/destroy a player over a MIDS
//! image in memory, render interleaved f32 samples, and control looping.
//!
//! ABI notes
//! - All functions are `extern "C"` and `#[no_mangle]`.
//! - Opaque handle type: `CalliopePlayer` (heap-allocated; you own/delete it).
//! - Render path produces **stereo interleaved** f32 frames.
//! - Functions tolerate null handles/pointers and return 0/false instead of
//!   crashing; no panics cross the boundary.
//!
//! Threading
//! - The object is NOT thread-safe; call all functions from the same audio
//!   thread, and never call `calliope_player_destroy` concurrently with
//!   `calliope_player_render_f32`.

use std::ffi::CStr;
use std::os::raw::c_char;

use calliope_core::mids::MidsSong;
use calliope_engine::{
    create_backend, BackendConfig, BackendKind, BankRequest, SoftSynthDevice,
};

/// Backend selector values for `calliope_player_create`.
pub const CALLIOPE_BACKEND_SOUNDFONT: u32 = 0;
pub const CALLIOPE_BACKEND_FLUID: u32 = 1;

/// Opaque player wrapper we hand to C.
#[repr(C)]
pub struct CalliopePlayer {
    inner: SoftSynthDevice,
}

// --- Creation / destruction -------------------------------------------------------

/// Create a player over a MIDS container image.
///
/// `bank` is an optional NUL-terminated bank argument (numeric index or a
/// path to a bank file); pass null for the backend default. Returns a
/// non-null handle on success, or null when the container is rejected, the
/// backend is unavailable, or any argument is unusable.
#[no_mangle]
pub extern "C" fn calliope_player_create(
    data: *const u8,
    len: usize,
    backend: u32,
    sample_rate: u32,
    bank: *const c_char,
    looping: bool,
) -> *mut CalliopePlayer {
    if data.is_null() || len == 0 {
        return std::ptr::null_mut();
    }
    let image = unsafe { std::slice::from_raw_parts(data, len) };
    let song = MidsSong::load(image);
    if !song.is_valid() {
        return std::ptr::null_mut();
    }

    let kind = match backend {
        CALLIOPE_BACKEND_SOUNDFONT => BackendKind::SoundFont,
        CALLIOPE_BACKEND_FLUID => BackendKind::Fluid,
        _ => return std::ptr::null_mut(),
    };
    let bank = if bank.is_null() {
        BankRequest::Default
    } else {
        match unsafe { CStr::from_ptr(bank) }.to_str() {
            Ok(text) => BankRequest::parse(text),
            Err(_) => return std::ptr::null_mut(),
        }
    };

    let config = BackendConfig {
        sample_rate: sample_rate.max(8_000),
        bank,
        ..Default::default()
    };
    // no resolver across the C boundary: bank names are taken as paths
    let Ok(backend) = create_backend(kind, &config, None) else {
        return std::ptr::null_mut();
    };

    let mut inner = SoftSynthDevice::new(backend, config.sample_rate);
    if inner.open().is_err() || inner.play(Box::new(song), looping).is_err() {
        return std::ptr::null_mut();
    }
    Box::into_raw(Box::new(CalliopePlayer { inner }))
}

/// Destroy a player previously returned by `calliope_player_create`.
#[no_mangle]
pub extern "C" fn calliope_player_destroy(player: *mut CalliopePlayer) {
    if !player.is_null() {
        unsafe { drop(Box::from_raw(player)) };
    }
}

// --- Rendering -------------------------------------------------------------------

/// Render `frames` stereo frames into `out` (which must hold `frames * 2`
/// f32 values). Returns the number of frames rendered, 0 on bad arguments.
#[no_mangle]
pub extern "C" fn calliope_player_render_f32(
    player: *mut CalliopePlayer,
    out: *mut f32,
    frames: u32,
) -> u32 {
    if player.is_null() || out.is_null() || frames == 0 {
        return 0;
    }
    let p = unsafe { &mut *player };
    let buffer = unsafe { std::slice::from_raw_parts_mut(out, frames as usize * 2) };
    p.inner.render(buffer) as u32
}

// --- Transport -------------------------------------------------------------------

/// True once a one-shot stream has consumed every event.
#[no_mangle]
pub extern "C" fn calliope_player_ended(player: *const CalliopePlayer) -> bool {
    if player.is_null() {
        return true;
    }
    unsafe { &*player }.inner.is_ended()
}

/// Rewind the stream to its start. Returns false when the player is not
/// currently playing.
#[no_mangle]
pub extern "C" fn calliope_player_rewind(player: *mut CalliopePlayer) -> bool {
    if player.is_null() {
        return false;
    }
    unsafe { &mut *player }.inner.rewind().is_ok()
}

/// Toggle looping playback.
#[no_mangle]
pub extern "C" fn calliope_player_set_looping(player: *mut CalliopePlayer, looping: bool) {
    if !player.is_null() {
        unsafe { &mut *player }.inner.set_looping(looping);
    }
}
