//! Width- and endianness-dependent structure layout.
//!
//! ELF32 and ELF64 differ only in field widths and offsets for the three
//! structures the scanner reads. [`Layout`] captures those differences once,
//! from the identification bytes, so the parsing code is written a single time.

use super::header::{ElfClass, ElfData, ident};
use super::{EI_NIDENT, ELF_MAGIC, ElfError, ElfResult};

/// Field offsets of the ELF file header that the scanner consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub size: usize,
    pub e_type: usize,
    pub e_shoff: usize,
    pub e_shentsize: usize,
    pub e_shnum: usize,
    pub e_shstrndx: usize,
}

/// Field offsets of a section header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFields {
    pub size: usize,
    pub sh_name: usize,
    pub sh_type: usize,
    pub sh_offset: usize,
    pub sh_size: usize,
    pub sh_entsize: usize,
}

/// Field offsets of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFields {
    pub size: usize,
    pub st_name: usize,
    pub st_value: usize,
    pub st_size: usize,
    pub st_info: usize,
    pub st_other: usize,
    pub st_shndx: usize,
}

const HEADER_32: HeaderFields = HeaderFields {
    size: 52,
    e_type: 16,
    e_shoff: 32,
    e_shentsize: 46,
    e_shnum: 48,
    e_shstrndx: 50,
};

const HEADER_64: HeaderFields = HeaderFields {
    size: 64,
    e_type: 16,
    e_shoff: 40,
    e_shentsize: 58,
    e_shnum: 60,
    e_shstrndx: 62,
};

const SECTION_32: SectionFields = SectionFields {
    size: 40,
    sh_name: 0,
    sh_type: 4,
    sh_offset: 16,
    sh_size: 20,
    sh_entsize: 36,
};

const SECTION_64: SectionFields = SectionFields {
    size: 64,
    sh_name: 0,
    sh_type: 4,
    sh_offset: 24,
    sh_size: 32,
    sh_entsize: 56,
};

const SYMBOL_32: SymbolFields = SymbolFields {
    size: 16,
    st_name: 0,
    st_value: 4,
    st_size: 8,
    st_info: 12,
    st_other: 13,
    st_shndx: 14,
};

const SYMBOL_64: SymbolFields = SymbolFields {
    size: 24,
    st_name: 0,
    st_info: 4,
    st_other: 5,
    st_shndx: 6,
    st_value: 8,
    st_size: 16,
};

/// Structure layout selected from the ELF identification block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub class: ElfClass,
    pub encoding: ElfData,
    pub header: HeaderFields,
    pub section: SectionFields,
    pub symbol: SymbolFields,
}

impl Layout {
    /// Select the layout from the first [`EI_NIDENT`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// Fails on short input, bad magic, or an unsupported class/encoding byte.
    pub fn from_ident(data: &[u8]) -> ElfResult<Self> {
        if data.len() < EI_NIDENT {
            return Err(ElfError::BufferTooSmall {
                needed: EI_NIDENT,
                available: data.len(),
            });
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }

        let class_byte = data[ident::EI_CLASS];
        let class = match ElfClass::try_from(class_byte) {
            Ok(c @ (ElfClass::Elf32 | ElfClass::Elf64)) => c,
            _ => return Err(ElfError::UnsupportedClass(class_byte)),
        };

        let data_byte = data[ident::EI_DATA];
        let encoding = match ElfData::try_from(data_byte) {
            Ok(e @ (ElfData::Lsb | ElfData::Msb)) => e,
            _ => return Err(ElfError::UnsupportedEncoding(data_byte)),
        };

        let (header, section, symbol) = match class {
            ElfClass::Elf32 => (HEADER_32, SECTION_32, SYMBOL_32),
            _ => (HEADER_64, SECTION_64, SYMBOL_64),
        };

        Ok(Self {
            class,
            encoding,
            header,
            section,
            symbol,
        })
    }

    /// Width in bytes of address/offset sized fields (`Elf32_Off` vs `Elf64_Off`).
    #[must_use]
    pub const fn word_size(&self) -> usize {
        match self.class {
            ElfClass::Elf32 => 4,
            _ => 8,
        }
    }

    pub fn u8_at(&self, data: &[u8], offset: usize) -> ElfResult<u8> {
        Ok(fixed::<1>(data, offset)?[0])
    }

    pub fn u16_at(&self, data: &[u8], offset: usize) -> ElfResult<u16> {
        let raw = fixed::<2>(data, offset)?;
        Ok(match self.encoding {
            ElfData::Msb => u16::from_be_bytes(raw),
            _ => u16::from_le_bytes(raw),
        })
    }

    pub fn u32_at(&self, data: &[u8], offset: usize) -> ElfResult<u32> {
        let raw = fixed::<4>(data, offset)?;
        Ok(match self.encoding {
            ElfData::Msb => u32::from_be_bytes(raw),
            _ => u32::from_le_bytes(raw),
        })
    }

    pub fn u64_at(&self, data: &[u8], offset: usize) -> ElfResult<u64> {
        let raw = fixed::<8>(data, offset)?;
        Ok(match self.encoding {
            ElfData::Msb => u64::from_be_bytes(raw),
            _ => u64::from_le_bytes(raw),
        })
    }

    /// Read an address/offset sized field, widened to `u64`.
    pub fn word_at(&self, data: &[u8], offset: usize) -> ElfResult<u64> {
        match self.class {
            ElfClass::Elf32 => self.u32_at(data, offset).map(u64::from),
            _ => self.u64_at(data, offset),
        }
    }
}

fn fixed<const N: usize>(data: &[u8], offset: usize) -> ElfResult<[u8; N]> {
    let end = offset.checked_add(N).ok_or(ElfError::InvalidOffset {
        kind: "field",
        offset: offset as u64,
    })?;
    data.get(offset..end)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(ElfError::BufferTooSmall {
            needed: end,
            available: data.len(),
        })
}

/// Resolve `[offset, offset + size)` inside `data`, rejecting overflow and overrun.
pub fn checked_range(
    data: &[u8],
    kind: &'static str,
    offset: u64,
    size: u64,
) -> ElfResult<core::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| ElfError::InvalidOffset { kind, offset })?;
    let len = usize::try_from(size).map_err(|_| ElfError::InvalidOffset { kind, offset })?;
    let end = start
        .checked_add(len)
        .ok_or(ElfError::InvalidOffset { kind, offset })?;
    if end > data.len() {
        return Err(ElfError::BufferTooSmall {
            needed: end,
            available: data.len(),
        });
    }
    Ok(start..end)
}
