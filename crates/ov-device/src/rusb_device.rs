//! `rusb`-backed [`Device`] implementation for the FT2232H-class interface
//! chip. Bit-bang/MPSSE mode selection and GPIO pin access ride on FTDI's
//! vendor control requests; interface A's data path is a plain bulk
//! endpoint pair.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{DeviceHandle, UsbContext};

use crate::{Device, DeviceError, Interface};

const VENDOR_ID: u16 = 0x0403; // FTDI
const PRODUCT_ID: u16 = 0x6010; // FT2232H

const EP_A_OUT: u8 = 0x02;
const EP_A_IN: u8 = 0x81;
const EP_B_OUT: u8 = 0x04;
const EP_B_IN: u8 = 0x83;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const BULK_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

// FTDI vendor request numbers (libftdi naming).
const SIO_RESET_REQUEST: u8 = 0;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

/// FTDI bit-mode constants, passed in the high byte of `wValue` on
/// `SIO_SET_BITMODE_REQUEST`.
mod bitmode {
    pub const BITBANG: u8 = 0x01;
    pub const SYNC_FIFO: u8 = 0x40;
}

// MPSSE GPIO commands (interface B only uses the "high byte" pins, BC0-7 in
// the original pin table).
const MPSSE_SET_HIGH_BYTE: u8 = 0x82;
const MPSSE_GET_HIGH_BYTE: u8 = 0x83;

fn endpoints(interface: Interface) -> (u8, u8) {
    match interface {
        Interface::A => (EP_A_OUT, EP_A_IN),
        Interface::B => (EP_B_OUT, EP_B_IN),
    }
}

fn ftdi_interface_index(interface: Interface) -> u16 {
    match interface {
        Interface::A => 1,
        Interface::B => 2,
    }
}

enum AsyncJob {
    Write(Interface, Vec<u8>),
    Shutdown,
}

/// A `rusb`-backed device handle, owning the session's one USB device per
/// §5 "Shared resources". Async writes are handed to a single background
/// worker thread over a bounded (depth-1) channel, which gives the
/// one-in-flight-per-interface FIFO ordering the façade promises.
pub struct RusbDevice<T: UsbContext> {
    handle: Arc<Mutex<DeviceHandle<T>>>,
    async_tx: SyncSender<AsyncJob>,
    worker: Option<JoinHandle<()>>,
}

impl<T: UsbContext + Send + 'static> RusbDevice<T> {
    /// Open the first device matching the expected FTDI vendor/product ID.
    pub fn open() -> Result<Self, DeviceError> {
        let handle =
            rusb::open_device_with_vid_pid::<T>(VENDOR_ID, PRODUCT_ID).ok_or(DeviceError::NotFound)?;
        Ok(Self::from_handle(handle))
    }

    /// Wrap an already-opened handle (used by callers that need custom
    /// enumeration logic, and by tests against a loopback device).
    pub fn from_handle(mut handle: DeviceHandle<T>) -> Self {
        for iface in [0u8, 1u8] {
            if let Err(err) = handle.claim_interface(iface) {
                log::warn!("failed to claim USB interface {iface}: {err}");
            }
        }
        let handle = Arc::new(Mutex::new(handle));
        let (tx, rx): (SyncSender<AsyncJob>, Receiver<AsyncJob>) = sync_channel(1);
        let worker_handle = Arc::clone(&handle);
        let worker = std::thread::spawn(move || async_worker(worker_handle, rx));
        Self {
            handle,
            async_tx: tx,
            worker: Some(worker),
        }
    }

    fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<(), DeviceError> {
        let handle = self.handle.lock().expect("device mutex poisoned");
        handle
            .write_control(0x40, request, value, index, data, CONTROL_TIMEOUT)
            .map_err(DeviceError::from)?;
        Ok(())
    }
}

fn async_worker<T: UsbContext>(handle: Arc<Mutex<DeviceHandle<T>>>, rx: Receiver<AsyncJob>) {
    while let Ok(job) = rx.recv() {
        match job {
            AsyncJob::Write(interface, data) => {
                let (ep_out, _) = endpoints(interface);
                let mut guard = handle.lock().expect("device mutex poisoned");
                if let Err(err) = guard.write_bulk(ep_out, &data, BULK_TIMEOUT) {
                    log::warn!("async bulk write on interface {interface:?} failed: {err}");
                }
            }
            AsyncJob::Shutdown => break,
        }
    }
}

impl<T: UsbContext> Drop for RusbDevice<T> {
    fn drop(&mut self) {
        let _ = self.async_tx.send(AsyncJob::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T: UsbContext + Send + 'static> Device for RusbDevice<T> {
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.control_out(SIO_RESET_REQUEST, 0, ftdi_interface_index(Interface::A), &[])?;
        self.control_out(SIO_RESET_REQUEST, 0, ftdi_interface_index(Interface::B), &[])
    }

    fn set_bitbang(&mut self, interface: Interface, mask: u8, rate_hz: u32) -> Result<(), DeviceError> {
        let divisor = baud_divisor(rate_hz);
        let index = ftdi_interface_index(interface);
        self.control_out(3, divisor, index, &[])?;
        let value = u16::from(mask) | (u16::from(bitmode::BITBANG) << 8);
        self.control_out(SIO_SET_BITMODE_REQUEST, value, index, &[])
    }

    fn set_sync_fifo(&mut self, interface: Interface) -> Result<(), DeviceError> {
        let value = 0xFFu16 | (u16::from(bitmode::SYNC_FIFO) << 8);
        self.control_out(SIO_SET_BITMODE_REQUEST, value, ftdi_interface_index(interface), &[])
    }

    fn write_bulk(&mut self, interface: Interface, data: &[u8]) -> Result<usize, DeviceError> {
        let (ep_out, _) = endpoints(interface);
        let handle = self.handle.lock().expect("device mutex poisoned");
        Ok(handle.write_bulk(ep_out, data, BULK_TIMEOUT)?)
    }

    fn write_bulk_async(&mut self, interface: Interface, data: Vec<u8>) -> Result<(), DeviceError> {
        // A full queue (depth 1) means a write is already in flight; block
        // until it drains rather than dropping data, which still satisfies
        // "returns without waiting for acknowledgement" since we only wait
        // on queue space, not on the transfer itself.
        self.async_tx
            .send(AsyncJob::Write(interface, data))
            .map_err(|_| DeviceError::Usb(rusb::Error::NoDevice))
    }

    fn read_bulk(&mut self, interface: Interface, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let (_, ep_in) = endpoints(interface);
        let handle = self.handle.lock().expect("device mutex poisoned");
        loop {
            match handle.read_bulk(ep_in, buf, BULK_TIMEOUT) {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Io) => continue, // transient, retry silently (§5 Timeouts)
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn drain(&mut self, interface: Interface) -> Result<(), DeviceError> {
        let (_, ep_in) = endpoints(interface);
        let handle = self.handle.lock().expect("device mutex poisoned");
        let mut scratch = [0u8; 512];
        loop {
            match handle.read_bulk(ep_in, &mut scratch, DRAIN_TIMEOUT) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(rusb::Error::Timeout) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn read_pins(&mut self, interface: Interface) -> Result<u8, DeviceError> {
        debug_assert_eq!(interface, Interface::B, "GPIO pins live on interface B");
        let (ep_out, ep_in) = endpoints(interface);
        let handle = self.handle.lock().expect("device mutex poisoned");
        handle.write_bulk(ep_out, &[MPSSE_GET_HIGH_BYTE], BULK_TIMEOUT)?;
        let mut byte = [0u8; 1];
        handle.read_bulk(ep_in, &mut byte, BULK_TIMEOUT)?;
        Ok(byte[0])
    }

    fn write_pins(&mut self, interface: Interface, value: u8) -> Result<(), DeviceError> {
        debug_assert_eq!(interface, Interface::B, "GPIO pins live on interface B");
        let (ep_out, _) = endpoints(interface);
        let handle = self.handle.lock().expect("device mutex poisoned");
        // Direction is fixed: CSI/RDWR/PROG/M0/M1 output, DONE/INIT input
        // (bits 2 and 5; see ov-hwinit's pin constants for the assignment).
        let direction = 0b1101_1011u8;
        handle.write_bulk(ep_out, &[MPSSE_SET_HIGH_BYTE, value, direction], BULK_TIMEOUT)?;
        Ok(())
    }
}

/// FTDI baud-rate divisor encoding is nonlinear; the bit-bang clock this
/// hardware needs is fixed at a handful of rates, so this keeps only the
/// simple 16x-oversampled case (`divisor = 3_000_000 / rate_hz`).
fn baud_divisor(rate_hz: u32) -> u16 {
    let rate_hz = rate_hz.max(1);
    (3_000_000 / rate_hz).min(0xFFFF) as u16
}
