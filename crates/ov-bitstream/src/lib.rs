//! Xilinx `.bit` container reader (supplementary, C4's sibling file-format
//! crate).
//!
//! A `.bit` file is a 13-byte magic number followed by a sequence of
//! type-tagged fields: `a`/`b`/`c`/`d` carry a 16-bit length-prefixed string
//! (NCD filename, part number, date, time), and `e` ends the header with a
//! 32-bit length for the raw bitstream payload that follows. This reader is
//! intentionally thin: it validates only the magic and the field tags, not
//! the string contents.

use std::io::Read;

use thiserror::Error;

const MAGIC: [u8; 13] = [
    0x00, 0x09, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x00, 0x00, 0x01,
];

/// Errors raised while parsing a `.bit` container.
#[derive(Debug, Error)]
pub enum BitstreamError {
    #[error("unexpected end of file while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("bad magic number: not a Xilinx .bit file")]
    BadMagic,
    #[error("unknown header field tag {0:#04x}")]
    UnknownField(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed `.bit` file: header metadata plus the raw bitstream payload.
#[derive(Debug, Clone)]
pub struct Bitfile {
    pub ncd_filename: Option<String>,
    pub part_number: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub payload: Vec<u8>,
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8], what: &'static str) -> Result<(), BitstreamError> {
    r.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            BitstreamError::UnexpectedEof(what)
        } else {
            BitstreamError::Io(err)
        }
    })
}

fn read_u16(r: &mut impl Read) -> Result<u16, BitstreamError> {
    let mut buf = [0u8; 2];
    read_exact_or_eof(r, &mut buf, "field length (16-bit)")?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32, BitstreamError> {
    let mut buf = [0u8; 4];
    read_exact_or_eof(r, &mut buf, "field length (32-bit)")?;
    Ok(u32::from_be_bytes(buf))
}

fn read_string_field(r: &mut impl Read) -> Result<String, BitstreamError> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    read_exact_or_eof(r, &mut buf, "string field body")?;
    // On-disk strings are nominally NUL-terminated; trim it if present
    // rather than trusting it, matching the original loader's caution.
    if buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl Bitfile {
    /// Parse a complete `.bit` file (header and payload) from `r`.
    ///
    /// # Errors
    ///
    /// Returns [`BitstreamError::BadMagic`] if the leading 13 bytes don't
    /// match the expected magic, [`BitstreamError::UnknownField`] if a
    /// header tag outside `a`-`e` is encountered, or
    /// [`BitstreamError::UnexpectedEof`]/[`BitstreamError::Io`] on I/O
    /// failure.
    pub fn parse(mut r: impl Read) -> Result<Self, BitstreamError> {
        let mut magic = [0u8; 13];
        read_exact_or_eof(&mut r, &mut magic, "magic number")?;
        if magic != MAGIC {
            return Err(BitstreamError::BadMagic);
        }

        let mut bitfile = Bitfile {
            ncd_filename: None,
            part_number: None,
            date: None,
            time: None,
            payload: Vec::new(),
        };

        loop {
            let mut tag = [0u8; 1];
            read_exact_or_eof(&mut r, &mut tag, "header field tag")?;
            match tag[0] {
                b'a' => bitfile.ncd_filename = Some(read_string_field(&mut r)?),
                b'b' => bitfile.part_number = Some(read_string_field(&mut r)?),
                b'c' => bitfile.date = Some(read_string_field(&mut r)?),
                b'd' => bitfile.time = Some(read_string_field(&mut r)?),
                b'e' => {
                    let length = read_u32(&mut r)? as usize;
                    let mut payload = vec![0u8; length];
                    read_exact_or_eof(&mut r, &mut payload, "bitstream payload")?;
                    bitfile.payload = payload;
                    break;
                }
                other => return Err(BitstreamError::UnknownField(other)),
            }
        }

        Ok(bitfile)
    }

    /// Read and parse a `.bit` file from `path`.
    ///
    /// # Errors
    ///
    /// See [`Self::parse`]; I/O errors opening the file are wrapped in
    /// [`BitstreamError::Io`].
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, BitstreamError> {
        let file = std::fs::File::open(path)?;
        Self::parse(std::io::BufReader::new(file))
    }
}
