//! Command-line frontend for RAM tracing and patching (C9).
//!
//! Wires the hardware bring-up sequence (C8), the patch-source loaders
//! (C7), the config writer (C3), and the trace engine (C5) together behind
//! one argument surface. If a trace file is given (or `--iohook` is set),
//! we trace RAM until interrupted by the user or a stop condition fires;
//! otherwise the hardware is configured and the tool exits immediately.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use ov_device::{Device, Interface, RusbDevice};
use ov_iohook::HookEngine;
use ov_patch::HwPatch;
use ov_trace::{StopCondition, StopReason, TraceSession};

const DEFAULT_FPGA_BITSTREAM: &str = "ov_firmware.bit";
const CLOCK_FAST: f64 = 16.756;
const CLOCK_DEFAULT: f64 = 3.0;
const CLOCK_SLOW: f64 = 1.0;

/// Command-line frontend for RAM tracing and patching.
///
/// If a trace file is given, we trace RAM to that file until interrupted
/// by the user. If no trace file is given, the hardware is configured
/// according to the given options, then the tool exits immediately.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Do not reset the FPGA and the USB interface before starting. Not
    /// recommended when tracing, but useful for patching or adjusting
    /// clock frequency without glitches.
    #[arg(short = 'F', long = "no-fpga-reset")]
    no_fpga_reset: bool,

    /// Do not reset the target's CPUs when starting a trace.
    #[arg(short = 'D', long = "no-dsi-reset")]
    no_dsi_reset: bool,

    /// Load an FPGA bitstream from the provided file. Defaults to a file
    /// named "ov_firmware.bit" next to this executable.
    #[arg(short = 'b', long = "bitstream", value_name = "FILE")]
    bitstream: Option<PathBuf>,

    #[command(flatten)]
    clock: ClockArgs,

    /// Apply a patch to RAM reads. May be specified multiple times. See
    /// the accepted PATCH formats in `--help`.
    #[arg(short = 'p', long = "patch", value_name = "SPEC")]
    patch: Vec<String>,

    /// Enable I/O hooks, which allow patches to log data to the PC and to
    /// read and write data files.
    #[arg(short = 'i', long = "iohook")]
    iohook: bool,

    /// Stop when the specified condition is met. May be specified multiple
    /// times. Formats: time:SECONDS, size:MB, addr:HEXADDR.
    #[arg(short = 'S', long = "stop", value_name = "COND")]
    stop: Vec<String>,

    /// Trace output file. If omitted, no trace is recorded (unless
    /// `--iohook` is given, which still requires a streaming session).
    #[arg(value_name = "TRACEFILE")]
    tracefile: Option<PathBuf>,
}

/// Clock frequency selection: at most one of `--fast`/`--slow`/`--clock`.
#[derive(clap::Args)]
#[group(multiple = false)]
struct ClockArgs {
    /// Run at full speed instead of the default speed. Currently
    /// incompatible with tracing and patching.
    #[arg(short = 'f', long = "fast")]
    fast: bool,

    /// Run at the lowest speed. May help prevent buffer overflows.
    #[arg(short = 's', long = "slow")]
    slow: bool,

    /// Set a custom clock frequency, in MHz.
    #[arg(short = 'c', long = "clock", value_name = "MHZ")]
    clock: Option<f64>,
}

impl ClockArgs {
    fn resolve(&self) -> f64 {
        if self.fast {
            CLOCK_FAST
        } else if self.slow {
            CLOCK_SLOW
        } else {
            self.clock.unwrap_or(CLOCK_DEFAULT)
        }
    }
}

fn default_bitstream_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            return dir.join(DEFAULT_FPGA_BITSTREAM);
        }
    }
    PathBuf::from(DEFAULT_FPGA_BITSTREAM)
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let bitstream_path = cli.bitstream.clone().unwrap_or_else(default_bitstream_path);
    let clock = cli.clock.resolve();

    let mut patch = HwPatch::new();
    for spec in &cli.patch {
        ov_loaders::parse_spec(&mut patch, spec).with_context(|| format!("patch \"{spec}\""))?;
    }

    let mut stop = StopCondition::default();
    for cond in &cli.stop {
        stop.apply(cond).with_context(|| format!("stop condition \"{cond}\""))?;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = Arc::clone(&cancel);
    ctrlc::set_handler(move || cancel_handler.store(true, Ordering::Relaxed))
        .context("installing SIGINT handler")?;

    let mut dev = RusbDevice::<rusb::Context>::open().context("opening USB device")?;

    let hooks = if cli.iohook {
        Some(HookEngine::new(&mut patch).context("reserving I/O hook region")?)
    } else {
        None
    };

    if !cli.no_fpga_reset {
        let bitfile = ov_bitstream::Bitfile::open(&bitstream_path)
            .with_context(|| format!("loading bitstream {}", bitstream_path.display()))?;
        ov_hwinit::load_bitstream(&mut dev, &bitfile).context("configuring FPGA")?;
    }
    dev.set_sync_fifo(Interface::A).context("entering sync FIFO mode")?;

    ov_config::config_write(&mut dev, ov_config::regs::POWERFLAGS, ov_config::regs::POWERFLAG_BATT, false)
        .context("writing POWERFLAGS")?;
    ov_config::set_system_clock(&mut dev, clock).context("setting system clock")?;
    ov_config::load_patch(&mut dev, &patch).context("loading patch into hardware")?;

    let tracefile = cli.tracefile.as_ref();
    if tracefile.is_some() || cli.iohook {
        let output_file = tracefile
            .map(std::fs::File::create)
            .transpose()
            .context("creating trace output file")?;

        let mut session = TraceSession::new(&mut patch, hooks, stop, output_file);
        let reason = session
            .run(&mut dev, !cli.no_dsi_reset, &cancel)
            .context("running trace session")?;

        match reason {
            StopReason::Quit(msg) => {
                eprintln!("{msg}");
                std::process::exit(1);
            }
            StopReason::Interrupted | StopReason::Time(_) | StopReason::Size(_) | StopReason::Addr(_) => {}
        }
    }

    Ok(())
}
