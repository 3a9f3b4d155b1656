//! ELF symbol table parsing.
//!
//! Symbols represent named entities (functions, variables) in an ELF file.

use super::layout::Layout;
use super::{ElfError, ElfResult};

/// Symbol binding (scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBinding {
    /// Local (not visible outside object file)
    Local,
    /// Global (visible everywhere)
    Global,
    /// Weak (like global, but may be overridden)
    Weak,
    /// Unknown binding
    Unknown(u8),
}

impl From<u8> for SymbolBinding {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Local,
            1 => Self::Global,
            2 => Self::Weak,
            other => Self::Unknown(other),
        }
    }
}

/// Symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    /// Unspecified type
    NoType,
    /// Data object (variable)
    Object,
    /// Function
    Func,
    /// Section
    Section,
    /// Source file name
    File,
    /// Common symbol
    Common,
    /// TLS data object
    Tls,
    /// Indirect function (GNU extension)
    IFunc,
    /// Unknown type
    Unknown(u8),
}

impl From<u8> for SymbolType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoType,
            1 => Self::Object,
            2 => Self::Func,
            3 => Self::Section,
            4 => Self::File,
            5 => Self::Common,
            6 => Self::Tls,
            10 => Self::IFunc,
            other => Self::Unknown(other),
        }
    }
}

/// Special section indices.
pub mod section_index {
    /// Undefined symbol
    pub const SHN_UNDEF: u16 = 0;
}

/// Symbol table entry, widened to 64-bit fields regardless of class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name (index into string table)
    pub st_name: u32,
    /// Symbol info (type and binding)
    pub st_info: u8,
    /// Symbol visibility
    pub st_other: u8,
    /// Section index
    pub st_shndx: u16,
    /// Symbol value (address)
    pub st_value: u64,
    /// Symbol size
    pub st_size: u64,
}

impl Symbol {
    /// Parse the symbol entry starting at `offset`.
    pub fn parse(data: &[u8], offset: usize, layout: &Layout) -> ElfResult<Self> {
        let f = &layout.symbol;
        let end = offset.checked_add(f.size).ok_or(ElfError::InvalidOffset {
            kind: "symbol",
            offset: offset as u64,
        })?;
        if end > data.len() {
            return Err(ElfError::BufferTooSmall {
                needed: end,
                available: data.len(),
            });
        }

        Ok(Self {
            st_name: layout.u32_at(data, offset + f.st_name)?,
            st_info: layout.u8_at(data, offset + f.st_info)?,
            st_other: layout.u8_at(data, offset + f.st_other)?,
            st_shndx: layout.u16_at(data, offset + f.st_shndx)?,
            st_value: layout.word_at(data, offset + f.st_value)?,
            st_size: layout.word_at(data, offset + f.st_size)?,
        })
    }

    /// Get the symbol binding.
    pub fn binding(&self) -> SymbolBinding {
        SymbolBinding::from(self.st_info >> 4)
    }

    /// Get the symbol type.
    pub fn symbol_type(&self) -> SymbolType {
        SymbolType::from(self.st_info & 0xf)
    }

    /// Check if this is a function symbol.
    pub fn is_function(&self) -> bool {
        matches!(self.symbol_type(), SymbolType::Func)
    }

    /// Check if this is a global symbol.
    pub fn is_global(&self) -> bool {
        matches!(self.binding(), SymbolBinding::Global)
    }
}

/// Get a string from a string table.
pub fn get_string(strtab: &[u8], index: u32) -> ElfResult<&str> {
    let start = index as usize;
    if start >= strtab.len() {
        return Err(ElfError::InvalidStringIndex(index));
    }

    // Find null terminator
    let end = strtab[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::InvalidStringIndex(index))?;

    core::str::from_utf8(&strtab[start..start + end])
        .map_err(|_| ElfError::InvalidStringIndex(index))
}
