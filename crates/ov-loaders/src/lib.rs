//! Patch-source loaders (C7): each format reads its input and fills a
//! region allocated from a [`HwPatch`] via [`ov_patch::HwPatch::alloc_region`].
//!
//! [`parse_spec`] implements the `tag:arg1[:arg2]` grammar accepted on the
//! command line; the individual `load_*` functions can also be called
//! directly by a caller that already has the relevant bytes in hand.

mod elf;

use std::fs;

use thiserror::Error;

use ov_patch::{AllocError, HwPatch};

pub use elf::load_elf;

/// Errors raised while loading a patch source.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("can't parse patch string \"{0}\"")]
    BadSpec(String),
    #[error("hexadecimal patch has odd length")]
    HexOddLength,
    #[error("illegal byte in hexadecimal patch: '{0}'")]
    HexIllegalChar(char),
    #[error("not an ELF file (bad magic)")]
    ElfBadMagic,
    #[error("not a 32-bit little-endian ELF file")]
    ElfWrongClass,
    #[error("bad ELF version ({0})")]
    ElfBadVersion(u8),
    #[error("ELF segment at {addr:#010x}: file size {filesz} exceeds memory size {memsz}")]
    ElfSegmentTooLarge { addr: u32, filesz: u32, memsz: u32 },
    #[error("ELF segment at {addr:#010x}: patched memory must be read-only")]
    ElfSegmentNotReadOnly { addr: u32 },
}

/// Copy `fileName`'s entire contents into a freshly allocated region at
/// `addr`.
///
/// # Errors
///
/// Returns [`LoaderError::Io`] if the file can't be read, or
/// [`LoaderError::Alloc`] if the patch allocator rejects the region.
pub fn load_flat(patch: &mut HwPatch, addr: u32, file_name: &str) -> Result<(), LoaderError> {
    let bytes = fs::read(file_name)?;
    let region = patch.alloc_region(addr, bytes.len() as u32)?;
    region[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

/// Copy `string`'s bytes (optionally NUL-terminated) into a freshly
/// allocated region at `addr`.
///
/// # Errors
///
/// Returns [`LoaderError::Alloc`] if the patch allocator rejects the region.
pub fn load_string(patch: &mut HwPatch, addr: u32, string: &str, nul_terminate: bool) -> Result<(), LoaderError> {
    let mut bytes = string.as_bytes().to_vec();
    if nul_terminate {
        bytes.push(0);
    }
    let region = patch.alloc_region(addr, bytes.len() as u32)?;
    region[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

/// Widen `string`'s bytes into little-endian UTF-16-ish code units (each
/// input byte becomes `[b, 0]`, matching the original loader's naive
/// widening rather than a real UTF-16 transcode), optionally NUL-terminated.
///
/// # Errors
///
/// Returns [`LoaderError::Alloc`] if the patch allocator rejects the region.
pub fn load_string_utf16(patch: &mut HwPatch, addr: u32, string: &str, nul_terminate: bool) -> Result<(), LoaderError> {
    let mut units: Vec<u8> = string.bytes().flat_map(|b| [b, 0]).collect();
    if nul_terminate {
        units.push(0);
        units.push(0);
    }
    let region = patch.alloc_region(addr, units.len() as u32)?;
    region[..units.len()].copy_from_slice(&units);
    Ok(())
}

fn parse_hex(string: &str) -> Result<Vec<u8>, LoaderError> {
    let mut out = Vec::new();
    let mut nybble: Option<u8> = None;
    for c in string.chars() {
        if c.is_whitespace() {
            continue;
        }
        let c = c.to_ascii_lowercase();
        let value = match c {
            '0'..='9' => c as u8 - b'0',
            'a'..='f' => c as u8 - b'a' + 10,
            other => return Err(LoaderError::HexIllegalChar(other)),
        };
        match nybble {
            None => nybble = Some(value),
            Some(high) => {
                out.push((high << 4) | value);
                nybble = None;
            }
        }
    }
    if nybble.is_some() {
        return Err(LoaderError::HexOddLength);
    }
    Ok(out)
}

/// Parse whitespace-tolerant hex digits from `string` and write the decoded
/// bytes into a freshly allocated region at `addr`.
///
/// # Errors
///
/// Returns [`LoaderError::HexOddLength`] or [`LoaderError::HexIllegalChar`]
/// on malformed input, or [`LoaderError::Alloc`] if the allocator rejects
/// the region.
pub fn load_hex(patch: &mut HwPatch, addr: u32, string: &str) -> Result<(), LoaderError> {
    let bytes = parse_hex(string)?;
    let region = patch.alloc_region(addr, bytes.len() as u32)?;
    region[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

/// Parse a command-line patch specification and apply it to `patch`.
/// Grammar: `tag:arg1[:arg2]`, where `tag` selects one of `flat`, `ascii`,
/// `asciiz`, `utf16`, `utf16z`, `hex`, or `elf`; all but `elf` take a
/// hexadecimal address as `arg1`.
///
/// # Errors
///
/// Returns [`LoaderError::BadSpec`] for an unrecognised tag or missing
/// arguments, or whatever error the selected loader returns.
pub fn parse_spec(patch: &mut HwPatch, spec: &str) -> Result<(), LoaderError> {
    let mut parts = spec.splitn(3, ':');
    let tag = parts.next().unwrap_or("");

    if tag == "elf" {
        let path = parts.next().ok_or_else(|| LoaderError::BadSpec(spec.to_string()))?;
        let bytes = fs::read(path)?;
        return load_elf(patch, &bytes);
    }

    let addr_str = parts.next().ok_or_else(|| LoaderError::BadSpec(spec.to_string()))?;
    let rest = parts.next().ok_or_else(|| LoaderError::BadSpec(spec.to_string()))?;
    let addr = u32::from_str_radix(addr_str, 16).map_err(|_| LoaderError::BadSpec(spec.to_string()))?;

    match tag {
        "flat" => load_flat(patch, addr, rest),
        "ascii" => load_string(patch, addr, rest, false),
        "asciiz" => load_string(patch, addr, rest, true),
        "utf16" => load_string_utf16(patch, addr, rest, false),
        "utf16z" => load_string_utf16(patch, addr, rest, true),
        "hex" => load_hex(patch, addr, rest),
        _ => Err(LoaderError::BadSpec(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_writes_exact_bytes() {
        let mut patch = HwPatch::new();
        load_string(&mut patch, 0x1000, "hi", false).unwrap();
        assert_eq!(patch.content_size(), 2);
        assert_eq!(&patch.content()[..2], b"hi");
    }

    #[test]
    fn asciiz_adds_terminator() {
        let mut patch = HwPatch::new();
        load_string(&mut patch, 0x1000, "hi", true).unwrap();
        assert_eq!(patch.content_size(), 4); // rounded up to even
        assert_eq!(&patch.content()[..3], b"hi\0");
    }

    #[test]
    fn utf16_widens_each_byte() {
        let mut patch = HwPatch::new();
        load_string_utf16(&mut patch, 0x1000, "AB", false).unwrap();
        assert_eq!(&patch.content()[..4], &[b'A', 0, b'B', 0]);
    }

    #[test]
    fn hex_parses_ignoring_whitespace() {
        let mut patch = HwPatch::new();
        load_hex(&mut patch, 0x1000, "DE AD be ef").unwrap();
        assert_eq!(&patch.content()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn hex_odd_length_is_fatal() {
        let mut patch = HwPatch::new();
        assert!(matches!(load_hex(&mut patch, 0x1000, "ABC"), Err(LoaderError::HexOddLength)));
    }

    #[test]
    fn hex_illegal_char_is_fatal() {
        let mut patch = HwPatch::new();
        assert!(matches!(
            load_hex(&mut patch, 0x1000, "ZZ"),
            Err(LoaderError::HexIllegalChar('z'))
        ));
    }

    #[test]
    fn spec_dispatches_ascii() {
        let mut patch = HwPatch::new();
        parse_spec(&mut patch, "ascii:1000:hi").unwrap();
        assert_eq!(&patch.content()[..2], b"hi");
    }

    #[test]
    fn spec_rejects_unknown_tag() {
        let mut patch = HwPatch::new();
        assert!(matches!(parse_spec(&mut patch, "bogus:1000:hi"), Err(LoaderError::BadSpec(_))));
    }

    #[test]
    fn spec_rejects_missing_arguments() {
        let mut patch = HwPatch::new();
        assert!(matches!(parse_spec(&mut patch, "ascii:1000"), Err(LoaderError::BadSpec(_))));
    }
}
