//! Hardware bring-up sequence (C8): drives the FPGA through Slave
//! SelectMAP configuration over the interface chip's bit-bang/GPIO paths.
//!
//! The GPIOH control lines (interface B, high byte) carry the configuration
//! handshake: CSI/RDWR/PROG are driven by the host, DONE and INIT are
//! sampled, and M0/M1 select Slave SelectMAP mode.

use std::thread::sleep;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use ov_bitstream::Bitfile;
use ov_device::{Device, DeviceError, Interface};

/// GPIOH pin assignment on interface B.
pub mod pins {
    pub const CSI: u8 = 1 << 0;
    pub const RDWR: u8 = 1 << 1;
    pub const DONE: u8 = 1 << 2;
    pub const PROG: u8 = 1 << 3;
    pub const INIT: u8 = 1 << 5;
    pub const M0: u8 = 1 << 6;
    pub const M1: u8 = 1 << 7;
}

/// The part number this hardware's bitstream is expected to target.
/// Mismatches are advisory (logged), not a refusal to configure.
pub const EXPECTED_PART: &str = "6slx9tqg144";

const CONFIG_BIT_RATE: u32 = 4_000_000;
const NUM_EXTRA_CLOCKS: usize = 512;
const BLOCK_SIZE: usize = 16 * 1024;
const PROG_PULSE_DELAY: Duration = Duration::from_millis(10);
const DONE_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Bit-reversal lookup table: SelectMAP wires the parallel data bus in the
/// opposite order from how bitstream files present their bytes.
const REVERSE_BITS: [u8; 256] = build_reverse_table();

const fn build_reverse_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = b.reverse_bits();
        i += 1;
    }
    table
}

/// Errors raised while bringing up the FPGA.
#[derive(Debug, Error)]
pub enum HwInitError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("DONE pin stuck high before configuration began")]
    DoneStuckHigh,
    #[error("configuration error: DONE did not go high after loading the bitstream")]
    ConfigurationFailed,
}

/// Drive the FPGA through a complete configuration cycle with `bitstream`.
/// Logs (does not fail) on a part-number mismatch or a failed internal CRC
/// check, matching the original controller's tolerance for both.
///
/// # Errors
///
/// Returns [`HwInitError::DoneStuckHigh`] if `DONE` reads high before
/// programming begins, [`HwInitError::ConfigurationFailed`] if `DONE` never
/// rises afterward, or a wrapped [`DeviceError`] on any transport failure.
pub fn load_bitstream(dev: &mut impl Device, bitstream: &Bitfile) -> Result<(), HwInitError> {
    if let Some(part) = &bitstream.part_number {
        if part != EXPECTED_PART {
            warn!("bitstream has incorrect part number '{part}'. Our hardware is '{EXPECTED_PART}'.");
        }
    }

    config_begin(dev)?;
    config_send_buffer(dev, &bitstream.payload)?;
    config_end(dev)
}

fn config_begin(dev: &mut impl Device) -> Result<(), HwInitError> {
    dev.reset()?;
    dev.set_bitbang(Interface::A, 0xFF, CONFIG_BIT_RATE)?;

    // CSI=RDWR=PROG=1 (deasserted), M1=1/M0=0 selects Slave SelectMAP.
    dev.write_pins(Interface::B, pins::CSI | pins::RDWR | pins::PROG | pins::M1)?;

    // Pulse PROG low, then back high, to begin configuration.
    dev.write_pins(Interface::B, pins::CSI | pins::RDWR | pins::M1)?;
    dev.write_pins(Interface::B, pins::CSI | pins::RDWR | pins::PROG | pins::M1)?;

    // Enter programming mode: drive CSI/RDWR low, keep PROG high.
    dev.write_pins(Interface::B, pins::PROG | pins::M1)?;

    sleep(PROG_PULSE_DELAY);

    log::info!("FPGA: sending configuration bitstream");

    let status = dev.read_pins(Interface::B)?;
    if status & pins::DONE != 0 {
        return Err(HwInitError::DoneStuckHigh);
    }

    Ok(())
}

fn config_send_buffer(dev: &mut impl Device, data: &[u8]) -> Result<(), HwInitError> {
    for chunk in data.chunks(BLOCK_SIZE) {
        let reversed: Vec<u8> = chunk.iter().map(|&b| REVERSE_BITS[b as usize]).collect();
        dev.write_bulk(Interface::A, &reversed)?;
    }
    Ok(())
}

fn config_end(dev: &mut impl Device) -> Result<(), HwInitError> {
    let zeroes = vec![0u8; NUM_EXTRA_CLOCKS];
    dev.write_bulk(Interface::A, &zeroes)?;

    sleep(DONE_SETTLE_DELAY);

    let status = dev.read_pins(Interface::B)?;

    if status & pins::INIT != 0 {
        log::info!("FPGA: CRC OK");
    } else {
        // Preserved from the original controller: this is logged, not
        // treated as a failure, since some boards lack a pull-up on INIT.
        warn!("FPGA: CRC failed");
    }

    if status & pins::DONE != 0 {
        log::info!("FPGA: configured");
        Ok(())
    } else {
        Err(HwInitError::ConfigurationFailed)
    }
}

/// Poll the current configuration status without reconfiguring: `Ok(true)`
/// if the FPGA reports a valid, completed configuration (`DONE` and `INIT`
/// both high).
///
/// # Errors
///
/// Propagates any [`DeviceError`] from the transport.
pub fn config_status(dev: &mut impl Device) -> Result<bool, HwInitError> {
    dev.set_bitbang(Interface::A, 0xFF, CONFIG_BIT_RATE)?;
    let status = dev.read_pins(Interface::B)?;
    Ok(status & pins::INIT != 0 && status & pins::DONE != 0)
}
