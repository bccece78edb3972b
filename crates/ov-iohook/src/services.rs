//! I/O hook service handlers: logging, file I/O, and clock control. Mirrors
//! the original dispatch table one service at a time rather than as a
//! single large match, so each handler can own its own small bit of state.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use log::{info, warn};

use ov_device::Device;
use ov_wire::hook::DATA_LEN;

use ov_config::set_system_clock;

use crate::HookError;

/// Owns the "current file" the `FOPEN_*`/`FSEEK`/`FREAD`/`FWRITE` services
/// operate on (§5 "Shared resources": one current file per session).
#[derive(Default)]
pub struct HookServices {
    current_file: Option<File>,
}

impl HookServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret `data` as a (not necessarily NUL-terminated) string, the
    /// way the original packet-to-string helper does.
    #[must_use]
    pub fn packet_string(data: &[u8]) -> String {
        String::from_utf8_lossy(data).into_owned()
    }

    pub(crate) fn log_str(&mut self, data: &[u8]) -> Result<Vec<u8>, HookError> {
        info!("LOG: {}", Self::packet_string(data));
        Ok(Vec::new())
    }

    pub(crate) fn log_hex(&mut self, data: &[u8]) -> Result<Vec<u8>, HookError> {
        let mut line = String::from("LOG:");
        if data.len() % 4 != 0 {
            for byte in data {
                line.push_str(&format!(" {byte:02x}"));
            }
        } else {
            for chunk in data.chunks(4) {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                line.push_str(&format!(" {word:08x}"));
            }
        }
        info!("{line}");
        Ok(Vec::new())
    }

    pub(crate) fn fopen(&mut self, data: &[u8], write: bool) -> Result<Vec<u8>, HookError> {
        let filename = Self::packet_string(data);
        self.current_file = None; // drop (and close) any previously open file

        info!("FILE: Opening \"{filename}\" ({})", if write { "w+" } else { "r+" });
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(write)
            .truncate(write)
            .open(&filename)?;
        self.current_file = Some(file);
        Ok(Vec::new())
    }

    pub(crate) fn fseek(&mut self, data: &[u8]) -> Result<Vec<u8>, HookError> {
        let Some(file) = self.current_file.as_mut() else {
            warn!("FILE: Seek attempt with no open file!");
            return Ok(Vec::new());
        };
        let offset = read_u32_le(data);
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        Ok(Vec::new())
    }

    pub(crate) fn fread(&mut self, data: &[u8]) -> Result<Vec<u8>, HookError> {
        let Some(file) = self.current_file.as_mut() else {
            warn!("FILE: Read attempt with no open file!");
            return Ok(Vec::new());
        };
        let requested = read_u32_le(data) as usize;
        let capped = requested.min(DATA_LEN);
        let mut buf = vec![0u8; capped];
        let actual = file.read(&mut buf)?;
        buf.truncate(actual);
        Ok(buf)
    }

    pub(crate) fn fwrite(&mut self, data: &[u8]) -> Result<Vec<u8>, HookError> {
        let Some(file) = self.current_file.as_mut() else {
            warn!("FILE: Write attempt with no open file!");
            return Ok(Vec::new());
        };
        file.write_all(data)?;
        Ok(Vec::new())
    }

    pub(crate) fn setclock(&mut self, dev: &mut impl Device, data: &[u8]) -> Result<Vec<u8>, HookError> {
        let khz = read_u32_le(data);
        set_system_clock(dev, f64::from(khz) / 1000.0)?;
        Ok(Vec::new())
    }
}

/// Read a little-endian `u32` from `data`, zero-padding if it's shorter than
/// 4 bytes. `process_burst` truncates a burst's payload to its declared
/// `length`, so a short FSEEK/FREAD/SETCLOCK burst is a malformed-but-valid
/// burst, not a reason to panic — the original reads the same fixed-size
/// buffer regardless of `length` and never faults on it either.
fn read_u32_le(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = data.len().min(4);
    buf[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(buf)
}
