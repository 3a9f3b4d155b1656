//! ELF dynamic-symbol scanning.
//!
//! Read-only probe of compiled test modules: decides whether a file is an ELF
//! shared object and lists the global functions it defines in `.text`. Nothing
//! is mapped into the address space; relocation and symbol versioning are not
//! interpreted.
//!
//! Both ELF classes are handled by one code path. The class and data-encoding
//! bytes select a [`Layout`] once, and every header, section-header and symbol
//! read goes through it.
//!
//! Malformed input never surfaces as an error from the public probe functions:
//! truncated files, bad magic, unsupported classes and non-`ET_DYN` objects all
//! read as "not found".

pub mod header;
pub mod layout;
pub mod scan;
pub mod section;
pub mod symbol;

pub use header::{ElfClass, ElfData, ElfType, FileHeader};
pub use layout::Layout;
pub use scan::{
    is_shared_object, is_shared_object_bytes, scan_function_symbols, scan_function_symbols_bytes,
};
pub use section::{SectionHeader, SectionType};
pub use symbol::{Symbol, SymbolBinding, SymbolType};

/// ELF magic bytes: "\x7fELF"
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Size of ELF identification array
pub const EI_NIDENT: usize = 16;

/// Error type for ELF parsing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    /// Invalid ELF magic bytes
    InvalidMagic,
    /// Class byte is neither ELFCLASS32 nor ELFCLASS64
    UnsupportedClass(u8),
    /// Data encoding is neither LSB nor MSB
    UnsupportedEncoding(u8),
    /// Object type is not `ET_DYN`
    NotSharedObject(u16),
    /// Offset arithmetic overflowed or pointed outside the file
    InvalidOffset { kind: &'static str, offset: u64 },
    /// Buffer too small for requested operation
    BufferTooSmall { needed: usize, available: usize },
    /// Invalid string table index
    InvalidStringIndex(u32),
    /// A section the scan depends on is absent
    MissingSection(&'static str),
}

impl core::fmt::Display for ElfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid ELF magic"),
            Self::UnsupportedClass(c) => write!(f, "unsupported ELF class: {c}"),
            Self::UnsupportedEncoding(e) => write!(f, "unsupported data encoding: {e}"),
            Self::NotSharedObject(t) => write!(f, "not a shared object (e_type {t})"),
            Self::InvalidOffset { kind, offset } => {
                write!(f, "invalid {kind} offset: {offset:#x}")
            }
            Self::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {needed}, have {available}")
            }
            Self::InvalidStringIndex(idx) => write!(f, "invalid string index: {idx}"),
            Self::MissingSection(name) => write!(f, "missing section: {name}"),
        }
    }
}

impl std::error::Error for ElfError {}

/// Result type for ELF operations.
pub type ElfResult<T> = Result<T, ElfError>;
