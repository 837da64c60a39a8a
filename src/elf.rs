//! ELF32 header/program-header parsing (`SPEC_FULL.md` §6.2): `ET_EXEC`,
//! `EM_386`, little-endian only.
//!
//! Adapted from the teacher's `ElfHdr`/`ProgHdr` (same `repr(C)` pair of
//! structs, same `ELF_PROG_LOAD` constant and `is_valid`/`is_prog_load`
//! naming) narrowed from its 64-bit RISC-V field widths down to the 32-bit
//! fields a real ELF32 file has, with real validation added — the
//! teacher's `is_valid` only checks the magic number, but this kernel has
//! no `original_source/` mkfs equivalent quietly guaranteeing every loaded
//! file is well-formed, so class/data/version/type/machine are all checked.

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

/// "\x7FELF" in little endian
pub const ELF_MAGIC: u32 = 0x464c_457f;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;

/// Values for Proghdr type
pub const ELF_PROG_LOAD: u32 = 1;

bitflags! {
    #[derive(Default)]
    pub struct ElfProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// File header.
#[derive(Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct ElfHdr {
    pub ident: [u8; 16],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfError {
    BadMagic,
    WrongClass,
    WrongEndian,
    WrongVersion,
    NotExecutable,
    WrongMachine,
}

impl ElfHdr {
    /// ELF32, little-endian, ET_EXEC, EM_386 per §6.2; anything else is
    /// rejected outright rather than best-effort loaded.
    pub fn validate(&self) -> Result<(), ElfError> {
        let magic = u32::from_le_bytes([self.ident[0], self.ident[1], self.ident[2], self.ident[3]]);
        if magic != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if self.ident[EI_CLASS] != ELFCLASS32 {
            return Err(ElfError::WrongClass);
        }
        if self.ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::WrongEndian);
        }
        if self.ident[EI_VERSION] != EV_CURRENT {
            return Err(ElfError::WrongVersion);
        }
        if self.typ != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if self.machine != EM_386 {
            return Err(ElfError::WrongMachine);
        }
        Ok(())
    }

    pub fn program_header_table_size(&self) -> usize {
        self.phnum as usize * core::mem::size_of::<ProgHdr>()
    }
}

/// Program section header.
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgHdr {
    pub fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }

    pub fn prog_flags(&self) -> ElfProgFlags {
        ElfProgFlags::from_bits_truncate(self.flags)
    }

    pub fn is_writable(&self) -> bool {
        self.prog_flags().contains(ElfProgFlags::WRITE)
    }

    /// §6.2: every `PT_LOAD` segment must be page-aligned and land inside
    /// `[USER_EXEC_ADDR, USER_MMAP_ADDR)`, and `memsz` can never be
    /// smaller than `filesz` (the tail beyond `filesz` is BSS, zero-filled,
    /// never shrinking what's actually on disk).
    pub fn validate_load(&self, page_size: usize, exec_base: usize, mmap_base: usize) -> Result<(), ElfError> {
        if self.align as usize != page_size
            || self.vaddr as usize % page_size != 0
            || self.memsz < self.filesz
            || (self.vaddr as usize) < exec_base
            || (self.vaddr as usize).saturating_add(self.memsz as usize) > mmap_base
        {
            return Err(ElfError::NotExecutable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> ElfHdr {
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELF_MAGIC.to_le_bytes());
        ident[EI_CLASS] = ELFCLASS32;
        ident[EI_DATA] = ELFDATA2LSB;
        ident[EI_VERSION] = EV_CURRENT;
        ElfHdr {
            ident,
            typ: ET_EXEC,
            machine: EM_386,
            version: 1,
            entry: 0x0100_0000,
            phoff: 52,
            shoff: 0,
            flags: 0,
            ehsize: 52,
            phentsize: 32,
            phnum: 1,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        }
    }

    #[test]
    fn well_formed_header_validates() {
        assert_eq!(valid_header().validate(), Ok(()));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut h = valid_header();
        h.ident[0] = 0;
        assert_eq!(h.validate(), Err(ElfError::BadMagic));
    }

    #[test]
    fn wrong_machine_is_rejected() {
        let mut h = valid_header();
        h.machine = 0xf3; // EM_RISCV
        assert_eq!(h.validate(), Err(ElfError::WrongMachine));
    }

    #[test]
    fn non_exec_type_is_rejected() {
        let mut h = valid_header();
        h.typ = 3; // ET_DYN
        assert_eq!(h.validate(), Err(ElfError::NotExecutable));
    }

    #[test]
    fn load_segment_must_be_page_aligned() {
        let ph = ProgHdr {
            typ: ELF_PROG_LOAD,
            vaddr: 0x0100_1000,
            memsz: 0x1000,
            filesz: 0x1000,
            align: 4096,
            ..Default::default()
        };
        assert_eq!(ph.validate_load(4096, 0x0100_0000, 0x0800_0000), Ok(()));
        let bad = ProgHdr {
            vaddr: 0x0100_1001,
            ..ph
        };
        assert!(bad.validate_load(4096, 0x0100_0000, 0x0800_0000).is_err());
    }

    #[test]
    fn memsz_smaller_than_filesz_is_rejected() {
        let ph = ProgHdr {
            typ: ELF_PROG_LOAD,
            vaddr: 0x0100_1000,
            memsz: 0x1000,
            filesz: 0x2000,
            align: 4096,
            ..Default::default()
        };
        assert!(ph.validate_load(4096, 0x0100_0000, 0x0800_0000).is_err());
    }

    #[test]
    fn segment_outside_user_image_window_is_rejected() {
        let ph = ProgHdr {
            typ: ELF_PROG_LOAD,
            vaddr: 0x0800_0000,
            memsz: 0x1000,
            filesz: 0x1000,
            align: 4096,
            ..Default::default()
        };
        assert!(ph.validate_load(4096, 0x0100_0000, 0x0800_0000).is_err());
    }
}
