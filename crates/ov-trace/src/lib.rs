//! Trace engine (C5): orchestrates the streaming read, resyncs to the
//! packet stream on session start, dispatches each decoded packet, enforces
//! user stop conditions, and maintains the live status line.
//!
//! This repo takes the "pull-based sequence of chunks" realisation named in
//! `SPEC_FULL.md` §9 "Control flow inversion": [`Device::read_bulk`] is
//! called directly from [`TraceSession::run`] rather than registered as a
//! callback, so the session owns the loop and a shared cancellation flag
//! without any user-data indirection.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use ov_config::{config_write, regs};
use ov_device::{Device, DeviceError, Interface};
use ov_iohook::{HookEngine, HookError, IOH_ADDR};
use ov_patch::HwPatch;
use ov_wire::{MemPacket, PacketType};

/// Target memory addresses are 24 bits wide on the wire.
const RAM_ADDR_MASK: u32 = 0x00FF_FFFF;
/// Clock rate (Hz) the trace timestamp counter runs at, used to convert
/// accumulated cycles into the `time` stop condition's seconds.
pub const RAM_CLOCK_HZ: f64 = 4_350_000.0;

const CHUNK_SIZE: usize = 64 * 1024;

/// Errors raised while running a trace session. The non-fatal I/O-hook
/// validation failures (`HookError::Checksum`/`DataLength`/`Sequence`) are
/// deliberately not wrapped here: the session logs and drops those bursts
/// internally rather than surfacing them as an `Err`, matching §7 kind 6.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("hardware buffer overrun: the USB bus or host couldn't keep up, capture aborted")]
    Overrun,
}

/// A user-supplied stop condition: the first of `time`/`size`/`addr` to
/// fire ends the session. Unset fields default to "never".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopCondition {
    pub time: f64,
    pub size: f64,
    pub addr: Option<u32>,
}

impl Default for StopCondition {
    fn default() -> Self {
        Self {
            time: f64::INFINITY,
            size: f64::INFINITY,
            addr: None,
        }
    }
}

/// Error parsing a `--stop=COND` argument.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("can't parse stop condition string \"{0}\"")]
pub struct StopConditionParseError(String);

impl StopCondition {
    /// Parse one `time:SECONDS` / `size:MB` / `addr:HEX` condition into
    /// `self`, overwriting whichever field it names. Repeated `--stop`
    /// arguments accumulate this way: the caller folds over them.
    ///
    /// # Errors
    ///
    /// Returns [`StopConditionParseError`] if the string isn't
    /// `tag:value` with a recognised tag and a parseable value.
    pub fn apply(&mut self, cond: &str) -> Result<(), StopConditionParseError> {
        let err = || StopConditionParseError(cond.to_string());
        let (tag, arg) = cond.split_once(':').ok_or_else(err)?;
        match tag {
            "time" => self.time = arg.parse().map_err(|_| err())?,
            "size" => self.size = arg.parse().map_err(|_| err())?,
            "addr" => {
                let addr = u32::from_str_radix(arg, 16).map_err(|_| err())?;
                self.addr = Some(addr & RAM_ADDR_MASK);
            }
            _ => return Err(err()),
        }
        Ok(())
    }
}

/// Why a session ended cleanly (as opposed to erroring out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The `SIGINT`/cancellation flag was set.
    Interrupted,
    /// `stop.time` elapsed.
    Time(f64),
    /// `stop.size` (MB) was received.
    Size(f64),
    /// The target touched `stop.addr`.
    Addr(u32),
    /// The target issued an I/O-hook `QUIT` with this message.
    Quit(String),
}

/// Stream resync state machine (§4.5 "State machine per USB chunk").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    SearchSync,
    Streaming,
}

/// Owns every piece of transient state for one `HW_Trace`-equivalent
/// session: the resync state machine, accumulated timestamp, burst
/// tracking, spillover buffer between USB chunks, and the optional output
/// file and I/O-hook engine.
pub struct TraceSession<'a> {
    patch: &'a mut HwPatch,
    hooks: Option<HookEngine>,
    stop: StopCondition,
    output_file: Option<File>,

    sync_state: SyncState,
    timestamp: u64,
    last_addr: u32,
    last_read_addr: u32,
    last_write_addr: u32,
    burst_index: u32,
    packet_buf: [u8; 4],
    packet_buf_len: usize,
    bytes_received: u64,
}

impl<'a> TraceSession<'a> {
    /// Build a new session. `hooks`, if present, is consulted on every
    /// WRITE to the hook address; pass `None` when `--iohook` wasn't given.
    #[must_use]
    pub fn new(patch: &'a mut HwPatch, hooks: Option<HookEngine>, stop: StopCondition, output_file: Option<File>) -> Self {
        Self {
            patch,
            hooks,
            stop,
            output_file,
            sync_state: SyncState::SearchSync,
            timestamp: 0,
            last_addr: 0,
            last_read_addr: 0,
            last_write_addr: 0,
            burst_index: 0,
            packet_buf: [0; 4],
            packet_buf_len: 0,
            bytes_received: 0,
        }
    }

    /// Run the session's setup order (§4.5 "Session setup order" steps
    /// 2-6) and enter the blocking streaming read until a stop condition
    /// fires, `cancel` is set, or a fatal error occurs.
    ///
    /// `reset_dsi` asserts the target's reset line for the duration of
    /// setup, matching the original controller's synchronised-reset
    /// option. Returns the reason the session ended.
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::Overrun`] on the hardware overflow sentinel,
    /// or any transport/I/O error. Non-fatal wire anomalies and dropped
    /// I/O-hook bursts are logged via `warn!` and do not return an error.
    pub fn run(&mut self, dev: &mut impl Device, reset_dsi: bool, cancel: &Arc<AtomicBool>) -> Result<StopReason, TraceError> {
        eprintln!();

        let power_flags = regs::POWERFLAG_BATT;

        config_write(dev, regs::TRACEFLAGS, 0, false)?;
        if reset_dsi {
            config_write(dev, regs::POWERFLAGS, power_flags | regs::POWERFLAG_RESET, false)?;
        }

        dev.drain(Interface::A)?;

        let mut trace_flags = regs::TRACEFLAG_WRITES;
        if self.output_file.is_some() {
            trace_flags |= regs::TRACEFLAG_READS;
        }
        config_write(dev, regs::TRACEFLAGS, trace_flags, false)?;
        config_write(dev, regs::POWERFLAGS, power_flags, false)?;

        let mut chunk = vec![0u8; CHUNK_SIZE];
        let reason = loop {
            let n = dev.read_bulk(Interface::A, &mut chunk)?;

            if n > 0 {
                if let Some(reason) = self.ingest_chunk(dev, &chunk[..n])? {
                    break reason;
                }
            }

            if let Some(reason) = self.check_progress_stops() {
                break reason;
            }

            if cancel.load(Ordering::Relaxed) {
                break StopReason::Interrupted;
            }
        };

        self.hide_status();
        eprintln!("Capture ended.");
        if let Some(file) = self.output_file.take() {
            drop(file);
        }

        Ok(reason)
    }

    fn ingest_chunk(&mut self, dev: &mut impl Device, mut buffer: &[u8]) -> Result<Option<StopReason>, TraceError> {
        if self.sync_state == SyncState::SearchSync {
            while let Some(&byte) = buffer.first() {
                if byte & 0x80 != 0 {
                    self.sync_state = SyncState::Streaming;
                    break;
                }
                buffer = &buffer[1..];
            }
        }

        self.bytes_received += buffer.len() as u64;

        // Write to disk first, so a bug in the parser below never loses
        // the raw trace.
        if let Some(file) = self.output_file.as_mut() {
            file.write_all(buffer)?;
        }

        if self.sync_state != SyncState::Streaming {
            return Ok(None);
        }

        if self.packet_buf_len > 0 {
            let need = 4 - self.packet_buf_len;
            let take = need.min(buffer.len());
            self.packet_buf[self.packet_buf_len..self.packet_buf_len + take].copy_from_slice(&buffer[..take]);
            self.packet_buf_len += take;
            buffer = &buffer[take..];

            if self.packet_buf_len == 4 {
                if let Some(reason) = self.dispatch_bytes(dev, self.packet_buf)? {
                    return Ok(Some(reason));
                }
                self.packet_buf_len = 0;
            }
        }

        while buffer.len() >= 4 {
            let bytes: [u8; 4] = buffer[..4].try_into().expect("checked length");
            if let Some(reason) = self.dispatch_bytes(dev, bytes)? {
                return Ok(Some(reason));
            }
            buffer = &buffer[4..];
        }

        if !buffer.is_empty() {
            debug_assert_eq!(self.packet_buf_len, 0);
            self.packet_buf[..buffer.len()].copy_from_slice(buffer);
            self.packet_buf_len = buffer.len();
        }

        Ok(None)
    }

    fn dispatch_bytes(&mut self, dev: &mut impl Device, bytes: [u8; 4]) -> Result<Option<StopReason>, TraceError> {
        let packet = MemPacket::from_bytes(&bytes).expect("exactly 4 bytes");

        if packet.is_overflow() {
            self.hide_status();
            return Err(TraceError::Overrun);
        }

        if !packet.is_aligned() {
            self.hide_status();
            log::warn!(
                "packet alignment error: a trace packet is not properly aligned, \
                 some USB data has been dropped or corrupted"
            );
            return Ok(None);
        }
        if !packet.is_checksum_correct() {
            self.hide_status();
            log::warn!(
                "packet checksum error: a trace packet has an incorrect checksum, \
                 some USB data has been dropped or corrupted"
            );
            return Ok(None);
        }

        self.timestamp += u64::from(packet.duration());

        match packet.packet_type() {
            PacketType::Addr => {
                self.last_addr = packet.payload() << 1;
                self.burst_index = 0;
            }
            PacketType::Read => {
                self.last_read_addr = self.last_addr + (self.burst_index << 1);
                self.burst_index += 1;

                if Some(self.last_read_addr) == self.stop.addr {
                    self.hide_status();
                    eprintln!(
                        "STOP: Requested stop at address {:#010x} (read burst at {:#010x})",
                        self.stop.addr.unwrap_or_default(),
                        self.last_addr
                    );
                    return Ok(Some(StopReason::Addr(self.stop.addr.unwrap_or_default())));
                }
            }
            PacketType::Write => {
                self.last_write_addr = self.last_addr + (self.burst_index << 1);

                if let Some(hooks) = self.hooks.as_mut() {
                    if self.last_addr == (IOH_ADDR & RAM_ADDR_MASK) {
                        if let Some(reason) = Self::feed_hook(hooks, dev, self.patch, self.burst_index, packet.rw_word())? {
                            return Ok(Some(reason));
                        }
                    }
                }
                self.burst_index += 1;

                // Preserved from the original controller: this checks
                // `last_read_addr`, not `last_write_addr` (§9 "Open
                // questions", `MEMPKT_WRITE` stop check). Not "fixed".
                if Some(self.last_read_addr) == self.stop.addr {
                    self.hide_status();
                    eprintln!(
                        "STOP: Requested stop at address {:#010x} (write burst at {:#010x})",
                        self.stop.addr.unwrap_or_default(),
                        self.last_addr
                    );
                    return Ok(Some(StopReason::Addr(self.stop.addr.unwrap_or_default())));
                }
            }
            PacketType::Timestamp => {}
        }

        Ok(None)
    }

    /// Accumulate one burst word into the hook engine, returning a stop
    /// reason only for `QUIT` (every other hook error is non-fatal and
    /// logged internally by [`HookEngine`]'s caller contract here).
    fn feed_hook(
        hooks: &mut HookEngine,
        dev: &mut impl Device,
        patch: &mut HwPatch,
        burst_index: u32,
        word: u16,
    ) -> Result<Option<StopReason>, TraceError> {
        let Some(burst) = hooks.accumulate(burst_index, word) else {
            return Ok(None);
        };

        match hooks.process_burst(dev, patch, burst) {
            Ok(()) => Ok(None),
            Err(HookError::Quit(msg)) => Ok(Some(StopReason::Quit(msg))),
            Err(err @ (HookError::Checksum | HookError::DataLength(_) | HookError::Sequence { .. })) => {
                log::warn!("I/O hook: {err}");
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    fn check_progress_stops(&mut self) -> Option<StopReason> {
        let seconds = self.timestamp as f64 / RAM_CLOCK_HZ;
        let mb = self.bytes_received as f64 / (1024.0 * 1024.0);

        self.print_status(seconds, mb);

        if seconds > self.stop.time {
            self.hide_status();
            eprintln!("STOP: Requested stop at {:.02}s", self.stop.time);
            return Some(StopReason::Time(self.stop.time));
        }
        if mb > self.stop.size {
            self.hide_status();
            eprintln!("STOP: Requested stop at {:.02} MB", self.stop.size);
            return Some(StopReason::Size(self.stop.size));
        }
        None
    }

    fn print_status(&self, seconds: f64, mb: f64) {
        eprint!(
            "{seconds:10.02}s [ {mb:9.3} MB captured ] - RD:{:08x} WR:{:08x}\r",
            self.last_read_addr, self.last_write_addr
        );
    }

    /// Erase the live status line before printing a diagnostic, so a
    /// warning or stop message never ends up trailing the progress bar.
    fn hide_status(&self) {
        eprint!("{}\r", " ".repeat(109));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeDevice {
        writes: Vec<Vec<u8>>,
    }

    impl Device for FakeDevice {
        fn reset(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_bitbang(&mut self, _: Interface, _: u8, _: u32) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_sync_fifo(&mut self, _: Interface) -> Result<(), DeviceError> {
            Ok(())
        }
        fn write_bulk(&mut self, _: Interface, data: &[u8]) -> Result<usize, DeviceError> {
            self.writes.push(data.to_vec());
            Ok(data.len())
        }
        fn write_bulk_async(&mut self, _: Interface, data: Vec<u8>) -> Result<(), DeviceError> {
            self.writes.push(data);
            Ok(())
        }
        fn read_bulk(&mut self, _: Interface, _: &mut [u8]) -> Result<usize, DeviceError> {
            Ok(0)
        }
        fn drain(&mut self, _: Interface) -> Result<(), DeviceError> {
            Ok(())
        }
        fn read_pins(&mut self, _: Interface) -> Result<u8, DeviceError> {
            Ok(0)
        }
        fn write_pins(&mut self, _: Interface, _: u8) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn addr_packet_bytes(word_addr: u32) -> [u8; 4] {
        MemPacket::encode(PacketType::Addr, word_addr).raw().to_be_bytes()
    }

    #[test]
    fn stream_resync_discards_leading_garbage_before_first_aligned_byte() {
        let mut patch = HwPatch::new();
        let mut session = TraceSession::new(&mut patch, None, StopCondition::default(), None);
        let mut dev = FakeDevice::default();

        // Two non-aligned junk bytes (no 0x80 bit) precede a well-formed
        // ADDR packet for word address 0x1234; the junk must be discarded
        // and the packet decoded once the aligned byte is found (§8
        // scenario 4, "Stream resync").
        let mut chunk = vec![0x12u8, 0x34u8];
        chunk.extend_from_slice(&addr_packet_bytes(0x1234));

        let result = session.ingest_chunk(&mut dev, &chunk).unwrap();
        assert!(result.is_none());
        assert_eq!(session.sync_state, SyncState::Streaming);
        assert_eq!(session.last_addr, 0x1234 << 1);
        assert_eq!(session.burst_index, 0);
        assert!(dev.writes.is_empty());
    }

    #[test]
    fn overflow_sentinel_mid_stream_aborts_the_session() {
        let mut patch = HwPatch::new();
        let mut session = TraceSession::new(&mut patch, None, StopCondition::default(), None);
        let mut dev = FakeDevice::default();

        // Get into STREAMING first with a harmless ADDR packet, then feed
        // the overflow sentinel as if it arrived mid-stream.
        session.ingest_chunk(&mut dev, &addr_packet_bytes(0)).unwrap();

        let overflow_chunk = ov_wire::packet::OVERFLOW.to_be_bytes();
        let err = session.ingest_chunk(&mut dev, &overflow_chunk).unwrap_err();
        assert!(matches!(err, TraceError::Overrun));
    }

    #[test]
    fn residual_bytes_carry_over_between_chunks() {
        let mut patch = HwPatch::new();
        let mut session = TraceSession::new(&mut patch, None, StopCondition::default(), None);
        let mut dev = FakeDevice::default();

        let packet = addr_packet_bytes(5);
        session.ingest_chunk(&mut dev, &packet[..2]).unwrap();
        assert_eq!(session.packet_buf_len, 2);

        session.ingest_chunk(&mut dev, &packet[2..]).unwrap();
        assert_eq!(session.packet_buf_len, 0);
        assert_eq!(session.last_addr, 5 << 1);
    }

    #[test]
    fn stop_condition_defaults_to_never() {
        let stop = StopCondition::default();
        assert_eq!(stop.time, f64::INFINITY);
        assert_eq!(stop.size, f64::INFINITY);
        assert_eq!(stop.addr, None);
    }

    #[test]
    fn parses_time_condition() {
        let mut stop = StopCondition::default();
        stop.apply("time:12.5").unwrap();
        assert_eq!(stop.time, 12.5);
    }

    #[test]
    fn parses_size_condition() {
        let mut stop = StopCondition::default();
        stop.apply("size:64").unwrap();
        assert_eq!(stop.size, 64.0);
    }

    #[test]
    fn parses_addr_condition_and_masks_to_24_bits() {
        let mut stop = StopCondition::default();
        stop.apply("addr:FF020000").unwrap();
        assert_eq!(stop.addr, Some(0x00020000));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut stop = StopCondition::default();
        assert!(stop.apply("bogus:1").is_err());
    }

    #[test]
    fn rejects_missing_colon() {
        let mut stop = StopCondition::default();
        assert!(stop.apply("time").is_err());
    }
}
