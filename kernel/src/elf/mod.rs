//! ELF64 static loader
//!
//! Materialises a user task image in memory: the whole file is read into
//! a fixed staging buffer, the header is validated (64-bit,
//! little-endian, `ET_EXEC`, x86-64), and each `PT_LOAD` segment is
//! copied to its `p_paddr` with the BSS tail zero-filled. `p_paddr` is
//! the physical destination directly; segments must fall inside the
//! user window of the identity map.

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    error::{ElfError, KernelError, KernelResult},
    fs::{NodeKind, VfsNode},
    mm::paging,
};

/// Staging buffer size; files larger than this are rejected.
pub const ELF_MAX_SIZE: usize = 512 * 1024;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

static STAGING: Mutex<StagingBuffer> = Mutex::new(StagingBuffer([0; ELF_MAX_SIZE]));

struct StagingBuffer([u8; ELF_MAX_SIZE]);

/// One `PT_LOAD` segment of a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Destination physical address (`p_paddr`).
    pub dest: u64,
    /// Offset of the file-backed bytes within the image.
    pub file_offset: u64,
    /// Number of file-backed bytes.
    pub file_size: u64,
    /// Total in-memory size; the tail beyond `file_size` is zero-filled.
    pub mem_size: u64,
}

/// A validated image, ready to be copied into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

fn read_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

fn read_u32(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        image[offset],
        image[offset + 1],
        image[offset + 2],
        image[offset + 3],
    ])
}

fn read_u64(image: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Validate the identification, header, and program headers of an ELF64
/// image, returning the segment copy plan.
pub fn parse_and_validate(image: &[u8]) -> Result<LoadPlan, ElfError> {
    if image.len() < 64 {
        return Err(ElfError::ShortRead);
    }
    if image[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if image[4] != ELFCLASS64 {
        return Err(ElfError::Not64Bit);
    }
    if image[5] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if read_u16(image, 16) != ET_EXEC {
        return Err(ElfError::WrongType);
    }
    if read_u16(image, 18) != EM_X86_64 {
        return Err(ElfError::WrongMachine);
    }

    let entry = read_u64(image, 24);
    let phoff = read_u64(image, 32) as usize;
    let phentsize = read_u16(image, 54) as usize;
    let phnum = read_u16(image, 56) as usize;

    let mut segments = Vec::new();
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if off + 56 > image.len() {
            return Err(ElfError::ShortRead);
        }
        if read_u32(image, off) != PT_LOAD {
            continue;
        }
        let segment = Segment {
            file_offset: read_u64(image, off + 8),
            dest: read_u64(image, off + 24), // p_paddr
            file_size: read_u64(image, off + 32),
            mem_size: read_u64(image, off + 40),
        };
        if segment
            .file_offset
            .checked_add(segment.file_size)
            .is_none_or(|end| end > image.len() as u64)
        {
            return Err(ElfError::ShortRead);
        }
        segments.push(segment);
    }

    Ok(LoadPlan { entry, segments })
}

/// Check that every segment lands inside the user window of the
/// identity map.
fn check_user_window(plan: &LoadPlan) -> KernelResult<()> {
    for segment in &plan.segments {
        let end = segment
            .dest
            .checked_add(segment.mem_size)
            .ok_or(KernelError::InvalidAddress {
                addr: segment.dest as usize,
            })?;
        if segment.dest < paging::USER_BASE || end > paging::IDENTITY_SIZE {
            return Err(KernelError::InvalidAddress {
                addr: segment.dest as usize,
            });
        }
    }
    Ok(())
}

/// Copy the plan's segments into place and zero their BSS tails.
///
/// # Safety
///
/// The destinations must lie inside the identity-mapped user window
/// (enforced by `check_user_window`) and must not overlap live kernel
/// data.
unsafe fn copy_segments(plan: &LoadPlan, image: &[u8]) {
    for segment in &plan.segments {
        // SAFETY: destinations were validated against the user window;
        // the source range was bounds-checked during parsing.
        unsafe {
            if segment.file_size > 0 {
                core::ptr::copy_nonoverlapping(
                    image.as_ptr().add(segment.file_offset as usize),
                    segment.dest as *mut u8,
                    segment.file_size as usize,
                );
            }
            if segment.mem_size > segment.file_size {
                core::ptr::write_bytes(
                    (segment.dest + segment.file_size) as *mut u8,
                    0,
                    (segment.mem_size - segment.file_size) as usize,
                );
            }
        }
    }
}

/// Load a static ELF64 executable from a VFS node into the user window
/// and return its entry point.
pub fn load(node: &Arc<dyn VfsNode>) -> KernelResult<u64> {
    if node.kind() != NodeKind::File {
        return Err(ElfError::NotAFile.into());
    }
    let size = node.size() as usize;
    if size > ELF_MAX_SIZE {
        return Err(ElfError::TooLarge.into());
    }

    let mut staging = STAGING.lock();
    let read = node.read(0, &mut staging.0[..size]).map_err(KernelError::Fs)?;
    if read < size {
        return Err(ElfError::ShortRead.into());
    }

    let image = &staging.0[..size];
    let plan = parse_and_validate(image).map_err(KernelError::Elf)?;
    check_user_window(&plan)?;
    // SAFETY: the window check guarantees the copies stay inside the
    // identity-mapped user region.
    unsafe {
        copy_segments(&plan, image);
    }
    Ok(plan.entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ELF64 image with the given identification and one
    /// PT_LOAD segment carrying `payload`.
    fn make_elf(class: u8, data: u8, etype: u16, machine: u16, payload: &[u8]) -> Vec<u8> {
        let phoff = 64usize;
        let phentsize = 56usize;
        let data_off = phoff + phentsize;
        let mut image = alloc::vec![0u8; data_off + payload.len()];

        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = class;
        image[5] = data;
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&etype.to_le_bytes());
        image[18..20].copy_from_slice(&machine.to_le_bytes());
        image[24..32].copy_from_slice(&0xC0_1000u64.to_le_bytes()); // e_entry
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes());
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let ph = phoff;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&(data_off as u64).to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&0xC0_0000u64.to_le_bytes()); // p_vaddr
        image[ph + 24..ph + 32].copy_from_slice(&0xC0_0000u64.to_le_bytes()); // p_paddr
        image[ph + 32..ph + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&(payload.len() as u64 + 16).to_le_bytes());

        image[data_off..].copy_from_slice(payload);
        image
    }

    #[test]
    fn test_valid_image_parses() {
        let image = make_elf(ELFCLASS64, ELFDATA2LSB, ET_EXEC, EM_X86_64, b"code");
        let plan = parse_and_validate(&image).unwrap();
        assert_eq!(plan.entry, 0xC0_1000);
        assert_eq!(plan.segments.len(), 1);
        let seg = plan.segments[0];
        assert_eq!(seg.dest, 0xC0_0000);
        assert_eq!(seg.file_size, 4);
        assert_eq!(seg.mem_size, 20);
    }

    #[test]
    fn test_bad_magic_rejected() {
        // "\x7FXLF" -- the scenario where only one identification byte
        // is off
        let mut image = make_elf(ELFCLASS64, ELFDATA2LSB, ET_EXEC, EM_X86_64, b"");
        image[1] = b'X';
        assert_eq!(parse_and_validate(&image), Err(ElfError::BadMagic));
    }

    #[test]
    fn test_not_64_bit_rejected() {
        let image = make_elf(1, ELFDATA2LSB, ET_EXEC, EM_X86_64, b"");
        assert_eq!(parse_and_validate(&image), Err(ElfError::Not64Bit));
    }

    #[test]
    fn test_big_endian_rejected() {
        let image = make_elf(ELFCLASS64, 2, ET_EXEC, EM_X86_64, b"");
        assert_eq!(parse_and_validate(&image), Err(ElfError::NotLittleEndian));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let image = make_elf(ELFCLASS64, ELFDATA2LSB, 3 /* ET_DYN */, EM_X86_64, b"");
        assert_eq!(parse_and_validate(&image), Err(ElfError::WrongType));
    }

    #[test]
    fn test_wrong_machine_rejected() {
        let image = make_elf(ELFCLASS64, ELFDATA2LSB, ET_EXEC, 40 /* ARM */, b"");
        assert_eq!(parse_and_validate(&image), Err(ElfError::WrongMachine));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert_eq!(parse_and_validate(&[0x7F, b'E']), Err(ElfError::ShortRead));
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let mut image = make_elf(ELFCLASS64, ELFDATA2LSB, ET_EXEC, EM_X86_64, b"payload");
        // Claim more file bytes than the image holds
        let ph = 64;
        image[ph + 32..ph + 40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert_eq!(parse_and_validate(&image), Err(ElfError::ShortRead));
    }

    #[test]
    fn test_non_load_segments_skipped() {
        let mut image = make_elf(ELFCLASS64, ELFDATA2LSB, ET_EXEC, EM_X86_64, b"code");
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&4u32.to_le_bytes()); // PT_NOTE
        let plan = parse_and_validate(&image).unwrap();
        assert!(plan.segments.is_empty());
    }

    #[test]
    fn test_window_check() {
        let mut plan = LoadPlan {
            entry: 0xC0_1000,
            segments: alloc::vec![Segment {
                dest: 0xC0_0000,
                file_offset: 0,
                file_size: 4,
                mem_size: 4,
            }],
        };
        assert!(check_user_window(&plan).is_ok());

        // Below the user split
        plan.segments[0].dest = 0x8_0000;
        assert!(check_user_window(&plan).is_err());

        // Past the identity window
        plan.segments[0].dest = paging::IDENTITY_SIZE - 2;
        assert!(check_user_window(&plan).is_err());
    }
}
