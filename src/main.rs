use std::io::{self, BufRead};
use std::process::exit;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use forceplate_rs::acquisition::{ReadyMethod, DEFAULT_CHANNELS};
use forceplate_rs::ads1261::{DataRate, Gain};
use forceplate_rs::calibration::FULL_SCALE;
use forceplate_rs::config::InstrumentConfig;
use forceplate_rs::instrument::{ControlHandle, Instrument};
use forceplate_rs::logging;
use forceplate_rs::ready::{interrupt_or_poll, DEFAULT_POLL_INTERVAL};
use forceplate_rs::report::OutputFormat;
use forceplate_rs::sim::SimulatedAdc;
use forceplate_rs::telemetry::{LoggingSink, TelemetrySink};

/// Unloaded bridge offset of the simulated cells, in counts.
const SIM_ZERO_COUNTS: i32 = 12_000;

#[derive(Parser, Debug)]
#[command(
    name = "forceplate-demo",
    about = "Run the force-plate pipeline against a simulated ADS1261"
)]
struct Args {
    /// Sampling period in milliseconds
    #[arg(long, default_value_t = 10)]
    period_ms: u64,
    /// PGA gain (1, 2, 4, ..., 128)
    #[arg(long, default_value_t = 128)]
    gain: u16,
    /// Data rate in samples per second
    #[arg(long, default_value_t = 40_000)]
    rate: u32,
    /// Per-channel DRDY timeout in milliseconds
    #[arg(long, default_value_t = 50)]
    timeout_ms: u64,
    /// Moving-average window (0 or 1 disables smoothing)
    #[arg(long, default_value_t = 5)]
    smoothing: usize,
    /// Newtons per normalized unit, applied to every channel
    #[arg(long)]
    scale: Option<f32>,
    /// Stop after this many cycles (default: run until `quit`)
    #[arg(long)]
    cycles: Option<u64>,
    /// Simulated body weight in newtons, split across the four cells
    #[arg(long, default_value_t = 700.0)]
    load: f32,
    /// Poll STATUS.DRDY over the bus instead of the ready line
    #[arg(long)]
    status_poll: bool,
    /// Stream over BLE instead of logging packets
    #[arg(long)]
    ble: bool,
    /// Advertised BLE name
    #[arg(long, default_value = "ZPlate")]
    name: String,
    /// Periodic status output: `log` (per-channel lines) or `csv` rows on stdout
    #[arg(long, default_value = "log")]
    format: OutputFormat,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

enum Command {
    Tare,
    Offset(usize, f32),
    Status,
    Quit,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match logging::parse_level(args.log_level.as_deref()) {
        Some(level) => logging::init_with_level(level),
        None => logging::init_rust_logging(),
    }

    let config = build_config(&args)?;
    config.validate().context("invalid configuration")?;

    let sim = SimulatedAdc::new();
    let ready = if args.status_poll {
        ReadyMethod::status_register()
    } else {
        ReadyMethod::Line(interrupt_or_poll(sim.drdy_pin(), DEFAULT_POLL_INTERVAL))
    };

    #[cfg(feature = "bluez")]
    let (sink, _server): (Box<dyn TelemetrySink>, _) = if args.ble {
        let peripheral = forceplate_rs::bluetooth::BlePeripheral {
            device_name: args.name.clone(),
            ..Default::default()
        };
        let (sink, server) = peripheral.start().context("BLE peripheral setup failed")?;
        (Box::new(sink) as Box<dyn TelemetrySink>, Some(server))
    } else {
        (Box::new(LoggingSink::always_on()) as Box<dyn TelemetrySink>, None)
    };
    #[cfg(not(feature = "bluez"))]
    let sink: Box<dyn TelemetrySink> = {
        if args.ble {
            bail!("built without the `bluez` feature; rebuild with --features bluez for --ble");
        }
        let _ = &args.name;
        Box::new(LoggingSink::always_on())
    };

    let instrument =
        Instrument::new(&config, sim.clone(), ready, sink).context("instrument setup failed")?;
    let handle = instrument
        .spawn(config.period)
        .context("failed to start acquisition thread")?;
    let control = handle.control().clone();

    let stop_load = Arc::new(AtomicBool::new(false));
    let load_thread = spawn_load_model(sim, args.load, config.scales[0], Arc::clone(&stop_load));
    let commands = spawn_console();

    info!("commands: tare | offset <ch> <value> | status | quit");
    loop {
        if let Some(limit) = args.cycles {
            if control.status().cycles >= limit {
                break;
            }
        }
        if handle.is_finished() {
            warn!("acquisition thread exited");
            break;
        }
        match commands.recv_timeout(Duration::from_millis(50)) {
            Ok(Command::Quit) => break,
            Ok(cmd) => handle_command(&control, cmd),
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed: keep running until the cycle limit, if any.
            Err(RecvTimeoutError::Disconnected) => {
                if args.cycles.is_none() {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    let instrument = handle.stop()?;
    stop_load.store(true, Ordering::Relaxed);
    let _ = load_thread.join();

    let stats = instrument.framer().stats();
    info!(
        "done: {} cycles, {} packets sent, {} dropped, {} failed",
        instrument.pipeline().cycles(),
        stats.sent,
        stats.dropped,
        stats.failed
    );
    Ok(())
}

fn build_config(args: &Args) -> Result<InstrumentConfig> {
    let mut config = InstrumentConfig::default();
    config.converter.gain = Gain::from_multiplier(args.gain)?;
    config.converter.data_rate = DataRate::from_sps(args.rate)?;
    config.ready_timeout = Duration::from_millis(args.timeout_ms);
    config.period = Duration::from_millis(args.period_ms);
    config.output_format = args.format;
    config.smoothing_window = match args.smoothing {
        0 | 1 => None,
        n => Some(n),
    };
    if let Some(scale) = args.scale {
        config = config.with_uniform_scale(scale);
    }
    if args.period_ms == 0 {
        bail!("--period-ms must be at least 1");
    }
    Ok(config)
}

fn handle_command(control: &ControlHandle, cmd: Command) {
    match cmd {
        Command::Tare => match control.tare() {
            Ok(offsets) => println!("tared, offsets {offsets:?}"),
            Err(e) => println!("tare failed: {e}"),
        },
        Command::Offset(ch, value) => match control.set_offset(ch, value) {
            Ok(()) => println!("channel {ch} offset = {value}"),
            Err(e) => println!("offset failed: {e}"),
        },
        Command::Status => {
            let status = control.status();
            let total: f32 = status.forces.iter().sum();
            println!(
                "cycles={} zeroed={} subscribed={} errors={} sent={} dropped={}",
                status.cycles,
                control.calibration().is_zeroed(),
                status.subscribed,
                status.channel_errors,
                status.telemetry.sent,
                status.telemetry.dropped
            );
            for (ch, force) in status.forces.iter().enumerate() {
                println!("  ch{}: {:8.2} N", ch + 1, force);
            }
            println!("  total: {total:.2} N");
        }
        Command::Quit => {}
    }
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "t" | "tare" => Some(Command::Tare),
        "o" | "offset" => {
            let ch = parts.next()?.parse().ok()?;
            let value = parts.next()?.parse().ok()?;
            Some(Command::Offset(ch, value))
        }
        "s" | "status" => Some(Command::Status),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// Read console commands on a background thread.
fn spawn_console() -> Receiver<Command> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None => println!("unknown command: {}", line.trim()),
            }
        }
    });
    rx
}

/// Sway the simulated load between the four cells at ~0.5 Hz.
fn spawn_load_model(
    sim: SimulatedAdc,
    load: f32,
    scale: f32,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let started = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            let phase = started.elapsed().as_secs_f32() * std::f32::consts::PI;
            let (sx, sy) = (phase.sin() * 0.2, phase.cos() * 0.1);
            let shares = [0.25 + sx + sy, 0.25 - sx + sy, 0.25 + sx - sy, 0.25 - sx - sy];
            for (ch, share) in DEFAULT_CHANNELS.iter().zip(shares) {
                let newtons = load * share;
                let counts = (newtons / scale * FULL_SCALE) as i32 + SIM_ZERO_COUNTS;
                sim.set_raw(*ch, counts);
            }
            thread::sleep(Duration::from_millis(5));
        }
    })
}
