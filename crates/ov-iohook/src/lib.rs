//! I/O hook protocol engine (C6): validates inbound 32-byte bursts observed
//! at the hook address, dispatches each to a service handler, and schedules
//! the response back into the hardware's patch table.
//!
//! The hook region is observed by the target as a read-only window that the
//! host secretly rewrites between polls — the target can tell a fresh
//! response arrived because the sequence number in the footer changes.

mod services;

use log::warn;
use thiserror::Error;

use ov_config::{config_write, update_patch_region, ConfigError};
use ov_device::Device;
use ov_patch::HwPatch;
use ov_wire::hook::{IOHookBuffer, DATA_LEN};

pub use services::HookServices;

/// The hook region's target-visible address, and its size in the patch
/// content buffer.
pub const IOH_ADDR: u32 = 0x02ef_ffe0;
pub const IOH_REGION_SIZE: u32 = 32;

const SVC_LOG_STR: u8 = 0x01;
const SVC_LOG_HEX: u8 = 0x02;
const SVC_FOPEN_R: u8 = 0x03;
const SVC_FOPEN_W: u8 = 0x04;
const SVC_FSEEK: u8 = 0x05;
const SVC_FWRITE: u8 = 0x06;
const SVC_FREAD: u8 = 0x07;
const SVC_QUIT: u8 = 0x08;
const SVC_SETCLOCK: u8 = 0x09;
const SVC_INIT: u8 = 0x0A;

/// Errors raised while processing an I/O hook burst. The first three
/// variants are non-fatal: the trace engine logs and drops the burst,
/// keeping the session alive. `Quit` is the target's own termination
/// request, handled as a clean session stop rather than a crash. The rest
/// are transport/config failures that abort the session.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("I/O hook checksum mismatch")]
    Checksum,
    #[error("I/O hook data length error: {0} > {DATA_LEN}")]
    DataLength(u8),
    #[error("I/O hook sequence error: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },
    #[error("target requested quit: {0}")]
    Quit(String),
    #[error(transparent)]
    Alloc(#[from] ov_patch::AllocError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tracks the I/O hook engine's per-session state: the expected sequence
/// number, the in-progress burst being assembled from the wire, and where
/// the response shadow buffer lives in the patch's content memory.
pub struct HookEngine {
    expected_seq: u8,
    shadow_offset: usize,
    services: HookServices,
    burst_words: [u16; ov_wire::hook::WORDS_PER_BURST],
}

impl HookEngine {
    /// Reserve the 32-byte hook region in `patch` and start a fresh session
    /// (expected sequence 0).
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Alloc`] if the patch allocator has no room left
    /// for the hook region.
    pub fn new(patch: &mut HwPatch) -> Result<Self, HookError> {
        let shadow_offset = patch.content_size();
        patch.alloc_region(IOH_ADDR, IOH_REGION_SIZE)?;
        Ok(Self {
            expected_seq: 0,
            shadow_offset,
            services: HookServices::new(),
            burst_words: [0; ov_wire::hook::WORDS_PER_BURST],
        })
    }

    /// Fold one word observed at the hook address (the trace engine's
    /// `burstIndex`-th write of the current burst) into the in-progress
    /// burst. Returns the assembled [`IOHookBuffer`] once word 15 (the
    /// last of the burst) has arrived, `None` otherwise.
    ///
    /// `index` wraps modulo the burst length: a stream that never quite
    /// resyncs on a 16-word boundary still produces *a* burst every 16
    /// words rather than silently wedging the accumulator.
    pub fn accumulate(&mut self, index: u32, word: u16) -> Option<IOHookBuffer> {
        let slot = (index as usize) % ov_wire::hook::WORDS_PER_BURST;
        self.burst_words[slot] = word;
        if slot == ov_wire::hook::WORDS_PER_BURST - 1 {
            Some(IOHookBuffer::from_words(self.burst_words))
        } else {
            None
        }
    }

    /// Validate, dispatch, and (if the service produced a response)
    /// schedule a burst observed on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Checksum`], [`HookError::DataLength`], or
    /// [`HookError::Sequence`] for a malformed/out-of-order burst (the
    /// caller should log and continue the session); returns
    /// [`HookError::Quit`] when the target asked to terminate; propagates
    /// any transport/config error otherwise.
    pub fn process_burst(
        &mut self,
        dev: &mut impl Device,
        patch: &mut HwPatch,
        burst: IOHookBuffer,
    ) -> Result<(), HookError> {
        if !burst.checksum_correct() {
            return Err(HookError::Checksum);
        }

        let length = burst.length();
        if length as usize > DATA_LEN {
            return Err(HookError::DataLength(length));
        }

        if burst.service() == SVC_INIT {
            self.expected_seq = 0;
        }
        if burst.sequence() != self.expected_seq {
            return Err(HookError::Sequence {
                expected: self.expected_seq,
                got: burst.sequence(),
            });
        }

        let data = burst.data_bytes();
        let input = &data[..length as usize];
        let response = self.dispatch(dev, burst.service(), input)?;

        self.expected_seq = self.expected_seq.wrapping_add(1);

        if !response.is_empty() {
            self.publish_response(dev, patch, &burst, &response)?;
        }

        Ok(())
    }

    fn dispatch(&mut self, dev: &mut impl Device, service: u8, data: &[u8]) -> Result<Vec<u8>, HookError> {
        match service {
            SVC_INIT => {
                log::info!("Inited IOHook sequence.");
                Ok(Vec::new())
            }
            SVC_LOG_STR => self.services.log_str(data),
            SVC_LOG_HEX => self.services.log_hex(data),
            SVC_FOPEN_R => self.services.fopen(data, false),
            SVC_FOPEN_W => self.services.fopen(data, true),
            SVC_FSEEK => self.services.fseek(data),
            SVC_FWRITE => self.services.fwrite(data),
            SVC_FREAD => self.services.fread(data),
            SVC_QUIT => Err(HookError::Quit(HookServices::packet_string(data))),
            SVC_SETCLOCK => self.services.setclock(dev, data),
            other => {
                warn!("IOH: Unknown service {other:#04x}");
                Ok(Vec::new())
            }
        }
    }

    fn publish_response(
        &self,
        dev: &mut impl Device,
        patch: &mut HwPatch,
        burst: &IOHookBuffer,
        response: &[u8],
    ) -> Result<(), HookError> {
        let mut words = [0u32; 7];
        for (i, chunk) in response.chunks(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            words[i] = u32::from_le_bytes(bytes);
        }

        let reply = IOHookBuffer::from_fields(words, burst.service(), burst.sequence(), response.len() as u8);

        let mut raw = [0u8; IOH_REGION_SIZE as usize];
        for (i, word) in reply.to_words().iter().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
        }

        patch.write_at(self.shadow_offset, &raw);
        update_patch_region(dev, patch, self.shadow_offset, IOH_REGION_SIZE as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ov_device::{DeviceError, Interface};

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

    #[test]
    fn accumulate_yields_burst_only_on_last_word() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();

        let burst = IOHookBuffer::from_fields([1, 2, 3, 4, 5, 6, 7], SVC_LOG_STR, 0, 0);
        let words = burst.to_words();
        for (i, &word) in words.iter().enumerate().take(15) {
            assert!(engine.accumulate(i as u32, word).is_none());
        }
        let assembled = engine.accumulate(15, words[15]).unwrap();
        assert_eq!(assembled, burst);
    }

    #[test]
    fn init_resets_sequence_and_needs_no_response() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let burst = IOHookBuffer::from_fields([0; 7], SVC_INIT, 0, 0);
        engine.process_burst(&mut dev, &mut patch, burst).unwrap();
        assert_eq!(engine.expected_seq, 1);
        assert!(dev.writes.is_empty());
    }

    #[test]
    fn sequence_mismatch_is_rejected() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let burst = IOHookBuffer::from_fields([0; 7], SVC_LOG_STR, 5, 0);
        let err = engine.process_burst(&mut dev, &mut patch, burst).unwrap_err();
        assert!(matches!(err, HookError::Sequence { expected: 0, got: 5 }));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let burst = IOHookBuffer::from_fields([0; 7], SVC_LOG_STR, 0, 0);
        // Corrupt the checksum by rebuilding from words with a flipped check byte
        // (the low byte of the footer's low word).
        let mut words = burst.to_words();
        words[14] ^= 0x00FF;
        let burst = IOHookBuffer::from_words(words);
        let err = engine.process_burst(&mut dev, &mut patch, burst).unwrap_err();
        assert!(matches!(err, HookError::Checksum));
    }

    #[test]
    fn data_length_over_limit_is_rejected() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let burst = IOHookBuffer::from_fields([0; 7], SVC_LOG_STR, 0, 29);
        let err = engine.process_burst(&mut dev, &mut patch, burst).unwrap_err();
        assert!(matches!(err, HookError::DataLength(29)));
    }

    #[test]
    fn quit_service_surfaces_message() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let mut data = [0u32; 7];
        data[0] = u32::from_le_bytes([b'b', b'y', b'e', 0]);
        let burst = IOHookBuffer::from_fields(data, SVC_QUIT, 0, 3);
        let err = engine.process_burst(&mut dev, &mut patch, burst).unwrap_err();
        assert!(matches!(err, HookError::Quit(msg) if msg == "bye"));
    }

    #[test]
    fn fread_with_no_open_file_returns_empty_response() {
        let mut patch = HwPatch::new();
        let mut engine = HookEngine::new(&mut patch).unwrap();
        let mut dev = FakeDevice::default();

        let mut data = [0u32; 7];
        data[0] = 16;
        let burst = IOHookBuffer::from_fields(data, SVC_FREAD, 0, 4);
        engine.process_burst(&mut dev, &mut patch, burst).unwrap();
        assert!(dev.writes.is_empty());
    }

    #[test]
    fn clock_step_matches_expected_quantization() {
        assert_eq!(((10.0f64 / (200.0 / 0x8_0000 as f64)) + 0.5) as u32, 26214);
    }
}
