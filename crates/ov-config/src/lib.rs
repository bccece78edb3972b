//! Configuration-register write packer (C3).
//!
//! Batches `(register address, 16-bit value)` pairs into the padded 8-byte
//! wire form the FPGA's configuration bus expects, and sequences the
//! content/CAM registers that load a [`HwPatch`] into hardware.

pub mod regs;

use ov_device::{Device, DeviceError, Interface};
use ov_patch::HwPatch;
use thiserror::Error;

/// Errors raised while writing configuration registers.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// One padded wire record: 5 meaningful bytes of an 8-byte slot.
///
/// Byte 0 is sacrificial padding (the leading byte of every 8-byte slot is
/// reserved to absorb a hardware bug where the FT2232H/FPGA path
/// occasionally eats the first byte of a USB packet); bytes 6-7 are zero
/// filler kept only so each record lands on a round 8-byte boundary.
const WRITE_SIZE: usize = 8;
const WRITE_OFFSET: usize = 1;

fn pack_record(out: &mut [u8], addr: u16, data: u16) {
    out[0] = 0x80 | (((addr & 0xC000) >> 12) as u8) | (((data & 0xC000) >> 14) as u8);
    out[1] = ((addr & 0x3F80) >> 7) as u8;
    out[2] = (addr & 0x007F) as u8;
    out[3] = ((data & 0x3F80) >> 7) as u8;
    out[4] = (data & 0x007F) as u8;
}

/// Write any number of register `(address, data)` pairs to the hardware in
/// a single USB transfer. `async_` selects fire-and-forget vs.
/// block-until-acknowledged (see [`ov_device::Device::write_bulk_async`]).
///
/// # Errors
///
/// Propagates the underlying [`DeviceError`] from the device façade.
pub fn config_write_multiple(
    dev: &mut impl Device,
    pairs: &[(u16, u16)],
    async_: bool,
) -> Result<(), ConfigError> {
    let mut buffer = vec![0u8; pairs.len() * WRITE_SIZE];
    for (i, &(addr, data)) in pairs.iter().enumerate() {
        let slot = &mut buffer[i * WRITE_SIZE + WRITE_OFFSET..i * WRITE_SIZE + WRITE_OFFSET + 5];
        pack_record(slot, addr, data);
    }

    if async_ {
        dev.write_bulk_async(Interface::A, buffer)?;
    } else {
        dev.write_bulk(Interface::A, &buffer)?;
    }
    Ok(())
}

/// Write a single configuration register. Exactly
/// [`config_write_multiple`] with a one-entry batch.
///
/// # Errors
///
/// Propagates the underlying [`DeviceError`] from the device façade.
pub fn config_write(dev: &mut impl Device, addr: u16, data: u16, async_: bool) -> Result<(), ConfigError> {
    config_write_multiple(dev, &[(addr, data)], async_)
}

/// Load a [`HwPatch`]'s content, block offsets, and CAM entries into
/// hardware in one batch: content memory, then all block offsets, then per
/// block the five CAM registers in the order the hardware requires
/// (`CAM_INDEX` commits the preceding four writes into slot `i`).
///
/// # Errors
///
/// Propagates the underlying [`DeviceError`] from the device façade.
pub fn load_patch(dev: &mut impl Device, patch: &HwPatch) -> Result<(), ConfigError> {
    let mut pairs = Vec::with_capacity(
        ov_patch::CONTENT_SIZE / 2 + ov_patch::NUM_BLOCKS + ov_patch::NUM_BLOCKS * 5,
    );

    for i in 0..ov_patch::CONTENT_SIZE / 2 {
        pairs.push((regs::PATCH_CONTENT + i as u16, patch.content_word(i)));
    }

    for (i, &offset) in patch.raw_block_offsets().iter().enumerate() {
        pairs.push((regs::PATCH_OFFSETS + i as u16, offset));
    }

    for (i, block) in patch.iter_blocks().enumerate() {
        pairs.push((regs::CAM_ADDR_LOW, block.addr as u16));
        pairs.push((regs::CAM_ADDR_HIGH, (block.addr >> 16) as u16));
        pairs.push((regs::CAM_MASK_LOW, block.mask as u16));
        pairs.push((regs::CAM_MASK_HIGH, (block.mask >> 16) as u16));
        pairs.push((regs::CAM_INDEX, i as u16));
    }

    config_write_multiple(dev, &pairs, false)
}

/// Clock synthesiser step size: the smallest frequency increment
/// `REG_SYSCLK` can express, in MHz.
const SYNTH_STEP_MHZ: f64 = 200.0 / 0x8_0000 as f64;

/// Configure the system clock synthesiser to the closest representable
/// approximation of `mhz`, logging the actual frequency selected.
///
/// # Errors
///
/// Propagates the underlying [`DeviceError`] from the device façade.
pub fn set_system_clock(dev: &mut impl Device, mhz: f64) -> Result<(), ConfigError> {
    let mut reg_value = ((mhz / SYNTH_STEP_MHZ) + 0.5) as u32;
    if reg_value > 0xFFFF {
        reg_value = 0xFFFF;
    }
    let actual = f64::from(reg_value) * SYNTH_STEP_MHZ;
    log::info!("CLOCK: Setting system clock to {actual:.6} MHz ({reg_value:#06x})");
    config_write(dev, regs::SYSCLK, reg_value as u16, true)
}

/// Send an incremental content update for a previously allocated region
/// (used by `ov-iohook` to publish a response burst). `offset`/`len` are
/// byte offsets/lengths into the patch's content buffer; writes are
/// word-rounded, matching `HW_UpdatePatchRegion`.
///
/// # Errors
///
/// Propagates the underlying [`DeviceError`] from the device façade.
pub fn update_patch_region(
    dev: &mut impl Device,
    patch: &HwPatch,
    offset: usize,
    len: usize,
) -> Result<(), ConfigError> {
    debug_assert_eq!(offset & 1, 0, "region updates must be word-aligned");
    let word_offset = offset >> 1;
    let num_words = (len + 1) >> 1;

    let pairs: Vec<(u16, u16)> = (0..num_words)
        .map(|i| {
            (
                regs::PATCH_CONTENT + (word_offset + i) as u16,
                patch.content_word(word_offset + i),
            )
        })
        .collect();

    config_write_multiple(dev, &pairs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_record_layout() {
        let mut slot = [0u8; 5];
        pack_record(&mut slot, 0x7FFF, 0x3FFF);
        // addr=0x7FFF -> high bits (0x4000 & 0xC000)>>12 = 0x4; data high (0x0000&0xC000)>>14=0
        assert_eq!(slot[0], 0x80 | 0x4 | 0x0);
        assert_eq!(slot[1], (0x7FFF & 0x3F80) >> 7);
        assert_eq!(slot[2], 0x7FFF & 0x007F);
        assert_eq!(slot[3], (0x3FFF & 0x3F80) >> 7);
        assert_eq!(slot[4], 0x3FFF & 0x007F);
    }

    #[test]
    fn padding_bytes_are_zero() {
        let mut buffer = vec![0u8; WRITE_SIZE];
        pack_record(&mut buffer[WRITE_OFFSET..WRITE_OFFSET + 5], 0x1234, 0x5678);
        assert_eq!(buffer[0], 0);
        assert_eq!(buffer[6], 0);
        assert_eq!(buffer[7], 0);
    }

    /// Minimal in-memory `Device` fake for exercising the writer without
    /// real hardware: records every bulk write (sync and async) in order.
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
    fn config_write_multiple_packs_all_entries_in_one_buffer() {
        let mut dev = FakeDevice::default();
        config_write_multiple(&mut dev, &[(0x0001, 0xABCD), (0x7004, 3)], false).unwrap();
        assert_eq!(dev.writes.len(), 1);
        assert_eq!(dev.writes[0].len(), 2 * WRITE_SIZE);
    }

    #[test]
    fn load_patch_writes_cam_index_last_per_block() {
        let mut patch = HwPatch::new();
        patch.alloc_region(0x1000, 16).unwrap();
        let mut dev = FakeDevice::default();
        load_patch(&mut dev, &patch).unwrap();

        assert_eq!(dev.writes.len(), 1);
        let buf = &dev.writes[0];
        let num_records = buf.len() / WRITE_SIZE;
        // Last record written overall must be the block's CAM_INDEX.
        let last = &buf[(num_records - 1) * WRITE_SIZE + WRITE_OFFSET..];
        let addr = (u16::from(last[0] & 0x3) << 14) | (u16::from(last[1]) << 7) | u16::from(last[2]);
        assert_eq!(addr, regs::CAM_INDEX);
    }
}
