//! ELF file header parsing.
//!
//! Only the identification block and the section-table coordinates are read;
//! program headers, entry point and machine fields are ignored.

use super::layout::Layout;
use super::{ElfError, ElfResult};

/// Indices into the e_ident array.
pub(crate) mod ident {
    pub const EI_CLASS: usize = 4;
    pub const EI_DATA: usize = 5;
}

/// ELF class (32-bit or 64-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElfClass {
    /// Invalid class
    None = 0,
    /// 32-bit objects
    Elf32 = 1,
    /// 64-bit objects
    Elf64 = 2,
}

impl TryFrom<u8> for ElfClass {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Elf32),
            2 => Ok(Self::Elf64),
            _ => Err(value),
        }
    }
}

/// ELF data encoding (endianness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElfData {
    /// Invalid encoding
    None = 0,
    /// Little-endian (2's complement)
    Lsb = 1,
    /// Big-endian (2's complement)
    Msb = 2,
}

impl TryFrom<u8> for ElfData {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lsb),
            2 => Ok(Self::Msb),
            _ => Err(value),
        }
    }
}

/// ELF object file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfType {
    /// No file type
    None,
    /// Relocatable file
    Rel,
    /// Executable file
    Exec,
    /// Shared object file
    Dyn,
    /// Core file
    Core,
    /// Unknown type
    Unknown(u16),
}

impl From<u16> for ElfType {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Rel,
            2 => Self::Exec,
            3 => Self::Dyn,
            4 => Self::Core,
            other => Self::Unknown(other),
        }
    }
}

impl ElfType {
    /// Convert to the raw u16 value.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Rel => 1,
            Self::Exec => 2,
            Self::Dyn => 3,
            Self::Core => 4,
            Self::Unknown(v) => v,
        }
    }
}

/// The subset of the ELF file header needed to walk the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Object file type
    pub e_type: ElfType,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section header string table index
    pub e_shstrndx: u16,
}

impl FileHeader {
    /// Parse the file header using an already-selected layout.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError::BufferTooSmall`] if the buffer is shorter than the
    /// class-specific header size.
    pub fn parse(data: &[u8], layout: &Layout) -> ElfResult<Self> {
        let fields = &layout.header;
        if data.len() < fields.size {
            return Err(ElfError::BufferTooSmall {
                needed: fields.size,
                available: data.len(),
            });
        }

        Ok(Self {
            e_type: ElfType::from(layout.u16_at(data, fields.e_type)?),
            e_shoff: layout.word_at(data, fields.e_shoff)?,
            e_shentsize: layout.u16_at(data, fields.e_shentsize)?,
            e_shnum: layout.u16_at(data, fields.e_shnum)?,
            e_shstrndx: layout.u16_at(data, fields.e_shstrndx)?,
        })
    }

    /// Check if this is a shared object (library).
    pub fn is_shared_object(&self) -> bool {
        matches!(self.e_type, ElfType::Dyn)
    }
}
