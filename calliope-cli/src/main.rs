//! Calliope CLI — real-time player for MIDS note streams.

use calliope_core::mids::MidsSong;
use calliope_engine::{
    create_backend, BackendConfig, BackendKind, BankFormat, BankRequest, SoftSynthDevice,
    VolumeModel,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Args {
    list_devices: bool,
    device_name: Option<String>,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    duration_sec: Option<u64>,
    backend: Option<String>,
    bank: Option<String>,
    bank_dir: Option<PathBuf>,
    volume_model: Option<String>,
    looped: bool,
    file: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut a = Args::default();
    for s in std::env::args().skip(1) {
        if s == "--list-devices" { a.list_devices = true; continue; }
        if s == "--loop"         { a.looped = true; continue; }
        if let Some(rest) = s.strip_prefix("--device=")       { a.device_name = Some(rest.to_string()); continue; }
        if let Some(rest) = s.strip_prefix("--sample-rate=")  { a.sample_rate = rest.parse().ok();      continue; }
        if let Some(rest) = s.strip_prefix("--channels=")     { a.channels    = rest.parse().ok();      continue; }
        if let Some(rest) = s.strip_prefix("--duration=")     { a.duration_sec= rest.parse().ok();      continue; }
        if let Some(rest) = s.strip_prefix("--backend=")      { a.backend     = Some(rest.to_string()); continue; }
        if let Some(rest) = s.strip_prefix("--bank=")         { a.bank        = Some(rest.to_string()); continue; }
        if let Some(rest) = s.strip_prefix("--bank-dir=")     { a.bank_dir    = Some(rest.into());      continue; }
        if let Some(rest) = s.strip_prefix("--volume-model=") { a.volume_model= Some(rest.to_string()); continue; }
        if s.starts_with("--") {
            eprintln!("[warn] unknown arg: {s}");
            continue;
        }
        a.file = Some(s.into());
    }
    a
}

fn list_output_devices() -> Result<(), Box<dyn Error>> {
    let host = cpal::default_host();
    println!("Available output devices:");
    for dev in host.output_devices()? {
        println!("- {}", dev.name()?);
    }
    Ok(())
}

fn pick_device(args: &Args) -> Result<cpal::Device, Box<dyn Error>> {
    let host = cpal::default_host();
    if let Some(name) = &args.device_name {
        for d in host.output_devices()? {
            if d.name()? == *name { return Ok(d); }
        }
        return Err(format!("requested device not found: {name}").into());
    }
    host.default_output_device()
        .ok_or_else(|| "no default output device".into())
}

fn choose_config(
    device: &cpal::Device,
    req_sr: Option<u32>,
    req_ch: Option<u16>,
) -> Result<cpal::SupportedStreamConfig, Box<dyn Error>> {
    // If nothing requested, default is already concrete.
    if req_sr.is_none() && req_ch.is_none() {
        return Ok(device.default_output_config()?);
    }

    // Pick a SupportedStreamConfigRange first.
    let mut best: Option<(u64, cpal::SupportedStreamConfigRange)> = None;
    for range in device.supported_output_configs()? {
        let ch     = range.channels();
        let sr_min = range.min_sample_rate().0;
        let sr_max = range.max_sample_rate().0;

        let ch_pen = match req_ch { Some(c) => (i64::from(ch) - i64::from(c)).unsigned_abs(), None => 0 };
        let sr_pen = match req_sr {
            Some(sr) => if (sr_min..=sr_max).contains(&sr) { 0 } else { u64::from(sr_min.abs_diff(sr).min(sr_max.abs_diff(sr))) },
            None => 0,
        };

        let score = sr_pen.saturating_mul(1000) + ch_pen;
        if best.as_ref().map(|(s, _)| *s).map_or(true, |s| score < s) {
            best = Some((score, range));
        }
    }

    let (_, range) = best.ok_or_else(|| "no supported output configs".to_string())?;

    // Choose a concrete sample rate and convert the range into a concrete config.
    let pick_sr = match req_sr {
        Some(sr) => {
            let lo = range.min_sample_rate().0;
            let hi = range.max_sample_rate().0;
            cpal::SampleRate(sr.clamp(lo, hi))
        }
        None => range.max_sample_rate(),
    };

    Ok(range.with_sample_rate(pick_sr))
}

fn parse_backend(name: Option<&str>) -> Result<BackendKind, Box<dyn Error>> {
    match name.unwrap_or("soundfont").to_ascii_lowercase().as_str() {
        "soundfont" | "sf" => Ok(BackendKind::SoundFont),
        "fluid" | "fl" => Ok(BackendKind::Fluid),
        other => Err(format!("unknown backend: {other}").into()),
    }
}

fn parse_volume_model(name: Option<&str>) -> VolumeModel {
    match name.unwrap_or("quiet").to_ascii_lowercase().as_str() {
        "generic" => VolumeModel::Generic,
        "soft" => VolumeModel::Soft,
        "full" => VolumeModel::Full,
        "none" => VolumeModel::None,
        _ => VolumeModel::Quiet,
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    cfg: &cpal::StreamConfig,
    player: Arc<Mutex<SoftSynthDevice>>,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, Box<dyn Error>>
where
    T: cpal::Sample + cpal::FromSample<f32> + cpal::SizedSample + Send + 'static,
{
    let channels = cfg.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        cfg,
        move |output: &mut [T], _| {
            let frames = output.len() / channels;
            scratch.resize(frames * 2, 0.0);
            match player.lock() {
                Ok(mut p) => {
                    p.render(&mut scratch);
                }
                Err(_) => scratch.fill(0.0),
            }
            for (i, frame) in output.chunks_mut(channels).enumerate() {
                let left = scratch[i * 2];
                let right = scratch[i * 2 + 1];
                if channels == 1 {
                    frame[0] = T::from_sample(0.5 * (left + right));
                } else {
                    frame[0] = T::from_sample(left);
                    frame[1] = T::from_sample(right);
                    for ch in frame.iter_mut().skip(2) {
                        *ch = T::from_sample(0.0);
                    }
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();

    if args.list_devices {
        list_output_devices()?;
        return Ok(());
    }

    let Some(file) = args.file.as_ref() else {
        eprintln!("usage: calliope-cli [--list-devices] [--device=NAME] [--sample-rate=HZ]");
        eprintln!("                    [--backend=soundfont|fluid] [--bank=NAME|INDEX]");
        eprintln!("                    [--bank-dir=DIR] [--volume-model=MODEL] [--loop]");
        eprintln!("                    [--duration=SECONDS] FILE.mds");
        return Err("no input file given".into());
    };

    println!("calliope-cli — MIDS stream player\n");

    let data = std::fs::read(file)?;
    let song = MidsSong::load(&data);
    if !song.is_valid() {
        return Err(format!("{}: not a playable MIDS container", file.display()).into());
    }
    println!("Loaded {} ({} stream words)", file.display(), song.len_words());

    let device  = pick_device(&args)?;
    let sup_cfg = choose_config(&device, args.sample_rate, args.channels)?;
    let sample_format = sup_cfg.sample_format();
    let mut cfg = sup_cfg.config();

    if let Some(sr) = args.sample_rate { cfg.sample_rate = cpal::SampleRate(sr); }
    if let Some(ch) = args.channels    { cfg.channels    = ch; }

    let kind = parse_backend(args.backend.as_deref())?;
    let backend_config = BackendConfig {
        sample_rate: cfg.sample_rate.0,
        bank: BankRequest::parse(args.bank.as_deref().unwrap_or("")),
        volume_model: parse_volume_model(args.volume_model.as_deref()),
        default_bank_data: None,
    };

    // Bank names resolve against --bank-dir (or the working directory), with
    // and without the .sf2 suffix.
    let bank_dir = args.bank_dir.clone();
    let resolver = move |name: &str, _format: BankFormat| -> Option<PathBuf> {
        let dir = bank_dir.as_deref().unwrap_or(Path::new("."));
        for candidate in [dir.join(name), dir.join(format!("{name}.sf2"))] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    };

    let backend = create_backend(kind, &backend_config, Some(&resolver))?;
    let mut dev = SoftSynthDevice::new(backend, cfg.sample_rate.0);
    dev.open()?;
    dev.play(Box::new(song), args.looped)?;
    let player = Arc::new(Mutex::new(dev));

    println!("Using device: {}", device.name()?);
    println!("Stream config: {cfg:?} (sample_format: {sample_format:?})");
    println!("Backend: {kind:?}  | Loop: {}", args.looped);
    if let Some(d) = args.duration_sec { println!("Auto-stop after {d} seconds"); }
    println!("Press Ctrl+C to stop…\n");

    let err_fn = |e: cpal::StreamError| eprintln!("[cpal] stream error: {e}");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &cfg, player.clone(), err_fn)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &cfg, player.clone(), err_fn)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &cfg, player.clone(), err_fn)?,
        other => return Err(format!("unsupported device sample format: {other:?}").into()),
    };

    stream.play()?;

    if let Some(d) = args.duration_sec {
        std::thread::sleep(Duration::from_secs(d));
        return Ok(());
    }

    loop {
        std::thread::sleep(Duration::from_millis(250));
        let ended = player.lock().map(|p| p.is_ended()).unwrap_or(true);
        if ended {
            // let releases and reverb ring out before tearing the stream down
            std::thread::sleep(Duration::from_secs(1));
            return Ok(());
        }
    }
}
