//! ELF section header parsing.

use super::layout::{Layout, checked_range};
use super::{ElfError, ElfResult};

/// Section header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    /// Inactive section
    Null,
    /// Program data
    Progbits,
    /// Symbol table
    Symtab,
    /// String table
    Strtab,
    /// Relocation with addends
    Rela,
    /// Symbol hash table
    Hash,
    /// Dynamic linking information
    Dynamic,
    /// Notes
    Note,
    /// Uninitialized data (BSS)
    Nobits,
    /// Relocation without addends
    Rel,
    /// Dynamic linker symbol table
    Dynsym,
    /// GNU hash table
    GnuHash,
    /// Unknown type
    Unknown(u32),
}

impl From<u32> for SectionType {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Null,
            1 => Self::Progbits,
            2 => Self::Symtab,
            3 => Self::Strtab,
            4 => Self::Rela,
            5 => Self::Hash,
            6 => Self::Dynamic,
            7 => Self::Note,
            8 => Self::Nobits,
            9 => Self::Rel,
            11 => Self::Dynsym,
            0x6fff_fff6 => Self::GnuHash,
            other => Self::Unknown(other),
        }
    }
}

/// Section header, widened to 64-bit fields regardless of class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name (index into the section-name string table)
    pub sh_name: u32,
    /// Section type
    pub sh_type: SectionType,
    /// Offset in file
    pub sh_offset: u64,
    /// Size in bytes
    pub sh_size: u64,
    /// Entry size if section holds table
    pub sh_entsize: u64,
}

impl SectionHeader {
    /// Parse the section header starting at `offset`.
    pub fn parse(data: &[u8], offset: usize, layout: &Layout) -> ElfResult<Self> {
        let f = &layout.section;
        let at = |field: usize| {
            offset.checked_add(field).ok_or(ElfError::InvalidOffset {
                kind: "section header",
                offset: offset as u64,
            })
        };

        Ok(Self {
            sh_name: layout.u32_at(data, at(f.sh_name)?)?,
            sh_type: SectionType::from(layout.u32_at(data, at(f.sh_type)?)?),
            sh_offset: layout.word_at(data, at(f.sh_offset)?)?,
            sh_size: layout.word_at(data, at(f.sh_size)?)?,
            sh_entsize: layout.word_at(data, at(f.sh_entsize)?)?,
        })
    }

    /// Bytes covered by this section, bounds-checked against `data`.
    pub fn contents<'a>(&self, data: &'a [u8]) -> ElfResult<&'a [u8]> {
        let range = checked_range(data, "section", self.sh_offset, self.sh_size)?;
        Ok(&data[range])
    }

    /// Check if this is a symbol table section.
    pub fn is_symtab(&self) -> bool {
        matches!(self.sh_type, SectionType::Symtab | SectionType::Dynsym)
    }

    /// Check if this is a string table section.
    pub fn is_strtab(&self) -> bool {
        matches!(self.sh_type, SectionType::Strtab)
    }
}

/// Parse all section headers from an ELF file.
pub fn parse_section_headers(
    data: &[u8],
    shoff: u64,
    shentsize: u16,
    shnum: u16,
    layout: &Layout,
) -> ElfResult<Vec<SectionHeader>> {
    let shentsize = shentsize as usize;
    let shnum = shnum as usize;

    if shnum > 0 && shentsize < layout.section.size {
        return Err(ElfError::BufferTooSmall {
            needed: layout.section.size,
            available: shentsize,
        });
    }

    let table_len = shentsize
        .checked_mul(shnum)
        .ok_or(ElfError::InvalidOffset {
            kind: "section header table",
            offset: shoff,
        })?;
    let table = checked_range(data, "section header table", shoff, table_len as u64)?;

    let mut headers = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let offset = table.start + i * shentsize;
        headers.push(SectionHeader::parse(data, offset, layout)?);
    }

    Ok(headers)
}
