//! USB device façade (C4): the only external collaborator named as a
//! first-class component. Every other in-scope subsystem talks to the
//! interface chip only through the [`Device`] trait, never through `rusb`
//! directly.
//!
//! The trait boundary mirrors the FT2232H's two independent channels: a
//! byte-wide bulk/sync-FIFO interface (A) used for configuration writes and
//! trace streaming, and a GPIO/MPSSE interface (B) used only during FPGA
//! bring-up (`ov-hwinit`) to drive PROG/CSI/RDWR and sample DONE/INIT.

mod rusb_device;

pub use rusb_device::RusbDevice;

use thiserror::Error;

/// Which of the interface chip's two channels an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// Byte-wide bulk/bit-bang interface: configuration writes, trace
    /// streaming, and (during FPGA bring-up) the SelectMAP data bus.
    A,
    /// GPIO/MPSSE interface: PROG, CSI, RDWR, DONE, INIT, M0/M1.
    B,
}

/// Errors surfaced by the device façade.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("no device found matching the expected vendor/product ID")]
    NotFound,
    #[error("device claims {got} bytes at endpoint {endpoint:#04x}, expected at most {max}")]
    ShortTransfer {
        endpoint: u8,
        got: usize,
        max: usize,
    },
}

/// Abstract USB transport for the tracer/patcher hardware. Implemented by
/// [`RusbDevice`] for real hardware; tests and the higher-level crates'
/// unit tests use hand-rolled fakes behind the same trait.
pub trait Device {
    /// Reset the USB bridge to a known state (required before FPGA
    /// configuration bring-up).
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// Put `interface` into byte-wide bit-bang mode with the given output
    /// pin mask, at the given bit rate. Used only for interface A during
    /// FPGA configuration.
    fn set_bitbang(&mut self, interface: Interface, mask: u8, rate_hz: u32) -> Result<(), DeviceError>;

    /// Put interface A into synchronous FIFO mode for trace streaming and
    /// configuration register writes (the hardware's normal runtime mode).
    fn set_sync_fifo(&mut self, interface: Interface) -> Result<(), DeviceError>;

    /// Blocking bulk write; returns once the transfer is acknowledged.
    fn write_bulk(&mut self, interface: Interface, data: &[u8]) -> Result<usize, DeviceError>;

    /// Fire-and-forget bulk write: queued on a single-worker, one-in-flight
    /// FIFO per interface and returns immediately. Ordering relative to
    /// later synchronous writes on the same interface is preserved, but the
    /// caller observes no completion signal (§5 "Ordering guarantees").
    fn write_bulk_async(&mut self, interface: Interface, data: Vec<u8>) -> Result<(), DeviceError>;

    /// Blocking bulk read of up to `buf.len()` bytes; returns the number of
    /// bytes actually read.
    fn read_bulk(&mut self, interface: Interface, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Drain and discard any bytes currently sitting in the read buffer,
    /// without blocking once the buffer is empty. Used before enabling
    /// tracing so stale bytes from a previous session don't get parsed.
    fn drain(&mut self, interface: Interface) -> Result<(), DeviceError>;

    /// Sample the GPIO pins on `interface` (DONE/INIT/M0/M1 live on
    /// interface B during configuration).
    fn read_pins(&mut self, interface: Interface) -> Result<u8, DeviceError>;

    /// Drive the GPIO output pins on `interface` (PROG/CSI/RDWR).
    fn write_pins(&mut self, interface: Interface, value: u8) -> Result<(), DeviceError>;
}
