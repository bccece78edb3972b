//! ELF32 little-endian `PT_LOAD` segment loader.

use ov_patch::HwPatch;

use crate::LoaderError;

const EI_NIDENT: usize = 16;
const EHDR_SIZE: usize = EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2 + 2 + 2 + 2;
const PHDR_SIZE: usize = 4 * 8;

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const PT_LOAD: u32 = 1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Parse an ELF32 little-endian image and load every `PT_LOAD` segment into
/// `patch`, using each segment's physical address. Read-only segments
/// (`PF_R` with no `PF_W`) are copied in; no-access segments (no flags) are
/// skipped as dummy placeholders; any other permission combination is
/// rejected, since the hardware only exposes a read-only view of patched
/// memory to the target.
///
/// # Errors
///
/// Returns [`LoaderError::ElfBadMagic`]/[`LoaderError::ElfWrongClass`]/
/// [`LoaderError::ElfBadVersion`] if the header doesn't describe a 32-bit
/// little-endian ELF file, [`LoaderError::ElfSegmentTooLarge`] if a
/// segment's file size exceeds its memory size, or
/// [`LoaderError::ElfSegmentNotReadOnly`] for an unsupported permission
/// combination.
pub fn load_elf(patch: &mut HwPatch, data: &[u8]) -> Result<(), LoaderError> {
    if data.len() < EHDR_SIZE {
        return Err(LoaderError::ElfBadMagic);
    }
    if data[0..4] != [0x7F, b'E', b'L', b'F'] {
        return Err(LoaderError::ElfBadMagic);
    }
    if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
        return Err(LoaderError::ElfWrongClass);
    }
    if data[6] != EV_CURRENT {
        return Err(LoaderError::ElfBadVersion(data[6]));
    }

    let e_phoff = u32_at(data, EI_NIDENT + 2 + 2 + 4 + 4) as usize;
    let e_phentsize = u16_at(data, EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2) as usize;
    let e_phnum = u16_at(data, EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2) as usize;

    let mut ph_offset = e_phoff;
    for _ in 0..e_phnum {
        let phdr = &data[ph_offset..ph_offset + PHDR_SIZE];
        ph_offset += e_phentsize.max(PHDR_SIZE);

        let p_type = u32_at(phdr, 0);
        if p_type != PT_LOAD {
            continue;
        }

        let p_offset = u32_at(phdr, 4) as usize;
        let p_paddr = u32_at(phdr, 12);
        let p_filesz = u32_at(phdr, 16);
        let p_memsz = u32_at(phdr, 20);
        let p_flags = u32_at(phdr, 24);

        if p_filesz > p_memsz {
            return Err(LoaderError::ElfSegmentTooLarge {
                addr: p_paddr,
                filesz: p_filesz,
                memsz: p_memsz,
            });
        }

        match p_flags & (PF_R | PF_W) {
            f if f == PF_R => {
                let region = patch.alloc_region(p_paddr, p_memsz)?;
                if p_filesz > 0 {
                    let src = &data[p_offset..p_offset + p_filesz as usize];
                    region[..p_filesz as usize].copy_from_slice(src);
                }
            }
            0 => {} // no-access dummy segment, nothing to load
            _ => return Err(LoaderError::ElfSegmentNotReadOnly { addr: p_paddr }),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_elf(segments: &[(u32, u32, u32, u32, &[u8])]) -> Vec<u8> {
        // segments: (p_paddr, p_filesz, p_memsz, p_flags, file_bytes)
        let mut buf = vec![0u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2LSB;
        buf[6] = EV_CURRENT;

        let phoff = buf.len() as u32;
        buf[EI_NIDENT + 2 + 2 + 4 + 4..EI_NIDENT + 2 + 2 + 4 + 4 + 4].copy_from_slice(&phoff.to_le_bytes());
        buf[EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2..EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2]
            .copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2..EI_NIDENT + 2 + 2 + 4 + 4 + 4 + 4 + 4 + 2 + 2 + 2]
            .copy_from_slice(&(segments.len() as u16).to_le_bytes());

        let mut ph_region = vec![0u8; PHDR_SIZE * segments.len()];
        let mut payloads = Vec::new();
        let mut data_cursor = (buf.len() + ph_region.len()) as u32;

        for (i, (paddr, filesz, memsz, flags, bytes)) in segments.iter().enumerate() {
            let base = i * PHDR_SIZE;
            ph_region[base..base + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            ph_region[base + 4..base + 8].copy_from_slice(&data_cursor.to_le_bytes());
            ph_region[base + 12..base + 16].copy_from_slice(&paddr.to_le_bytes());
            ph_region[base + 16..base + 20].copy_from_slice(&filesz.to_le_bytes());
            ph_region[base + 20..base + 24].copy_from_slice(&memsz.to_le_bytes());
            ph_region[base + 24..base + 28].copy_from_slice(&flags.to_le_bytes());
            payloads.extend_from_slice(bytes);
            data_cursor += bytes.len() as u32;
        }

        buf.extend_from_slice(&ph_region);
        buf.extend_from_slice(&payloads);
        buf
    }

    #[test]
    fn loads_read_only_segment() {
        let data = build_elf(&[(0x2000, 4, 4, PF_R, &[1, 2, 3, 4])]);
        let mut patch = HwPatch::new();
        load_elf(&mut patch, &data).unwrap();
        assert_eq!(patch.content_size(), 4);
        assert_eq!(&patch.content()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn zero_fills_bss_tail() {
        let data = build_elf(&[(0x2000, 2, 8, PF_R, &[0xAA, 0xBB])]);
        let mut patch = HwPatch::new();
        load_elf(&mut patch, &data).unwrap();
        assert_eq!(patch.content_size(), 8);
        assert_eq!(&patch.content()[..8], &[0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn skips_no_access_segment() {
        let data = build_elf(&[(0x2000, 0, 4, 0, &[])]);
        let mut patch = HwPatch::new();
        load_elf(&mut patch, &data).unwrap();
        assert_eq!(patch.num_blocks(), 0);
        assert_eq!(patch.content_size(), 0);
    }

    #[test]
    fn rejects_writable_segment() {
        let data = build_elf(&[(0x2000, 4, 4, PF_R | PF_W, &[1, 2, 3, 4])]);
        let mut patch = HwPatch::new();
        assert!(matches!(
            load_elf(&mut patch, &data),
            Err(LoaderError::ElfSegmentNotReadOnly { .. })
        ));
    }

    #[test]
    fn rejects_filesz_over_memsz() {
        let data = build_elf(&[(0x2000, 8, 4, PF_R, &[0; 8])]);
        let mut patch = HwPatch::new();
        assert!(matches!(
            load_elf(&mut patch, &data),
            Err(LoaderError::ElfSegmentTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_elf(&[(0x2000, 0, 0, 0, &[])]);
        data[0] = 0;
        let mut patch = HwPatch::new();
        assert!(matches!(load_elf(&mut patch, &data), Err(LoaderError::ElfBadMagic)));
    }
}
