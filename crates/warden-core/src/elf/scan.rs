//! Shared-object probe and dynamic function-symbol scan.

use std::path::Path;

use super::header::FileHeader;
use super::layout::Layout;
use super::section::{SectionHeader, parse_section_headers};
use super::symbol::{Symbol, get_string, section_index};
use super::{ElfError, ElfResult};

const DYNSYM: &str = ".dynsym";
const DYNSTR: &str = ".dynstr";
const TEXT: &str = ".text";

/// Sections located by the single pass over the section header table.
#[derive(Debug, Clone, Copy)]
struct DynamicTables {
    dynsym: SectionHeader,
    dynstr: SectionHeader,
    text_index: u16,
}

/// Returns true iff `path` names an ELF shared object (`ET_DYN`).
///
/// Fails closed: unreadable files and anything that does not parse are `false`.
pub fn is_shared_object(path: impl AsRef<Path>) -> bool {
    std::fs::read(path)
        .map(|data| is_shared_object_bytes(&data))
        .unwrap_or(false)
}

/// In-memory variant of [`is_shared_object`].
#[must_use]
pub fn is_shared_object_bytes(data: &[u8]) -> bool {
    probe(data).is_ok()
}

/// Names of the global functions a shared object defines in `.text`, in
/// symbol-table order.
///
/// Empty when the file cannot be read, is not a shared object, or lacks any
/// of `.dynsym`, `.dynstr` or `.text`. Callers that need a stable order sort
/// the result themselves.
pub fn scan_function_symbols(path: impl AsRef<Path>) -> Vec<String> {
    std::fs::read(path)
        .map(|data| scan_function_symbols_bytes(&data))
        .unwrap_or_default()
}

/// In-memory variant of [`scan_function_symbols`].
#[must_use]
pub fn scan_function_symbols_bytes(data: &[u8]) -> Vec<String> {
    collect_function_symbols(data).unwrap_or_default()
}

fn probe(data: &[u8]) -> ElfResult<(Layout, FileHeader)> {
    let layout = Layout::from_ident(data)?;
    let header = FileHeader::parse(data, &layout)?;
    if !header.is_shared_object() {
        return Err(ElfError::NotSharedObject(header.e_type.to_u16()));
    }
    Ok((layout, header))
}

fn locate_tables(data: &[u8], layout: &Layout, header: &FileHeader) -> ElfResult<DynamicTables> {
    let sections = parse_section_headers(
        data,
        header.e_shoff,
        header.e_shentsize,
        header.e_shnum,
        layout,
    )?;

    let shstrtab = sections
        .get(header.e_shstrndx as usize)
        .ok_or(ElfError::MissingSection(".shstrtab"))?
        .contents(data)?;

    let mut dynsym = None;
    let mut dynstr = None;
    let mut text_index = None;

    for (index, section) in sections.iter().enumerate() {
        let Ok(name) = get_string(shstrtab, section.sh_name) else {
            continue;
        };
        // A name on a section of the wrong type does not count.
        match name {
            DYNSYM if dynsym.is_none() && section.is_symtab() => dynsym = Some(*section),
            DYNSTR if dynstr.is_none() && section.is_strtab() => dynstr = Some(*section),
            TEXT if text_index.is_none() => text_index = u16::try_from(index).ok(),
            _ => {}
        }
    }

    let text_index = match text_index {
        Some(idx) if idx != section_index::SHN_UNDEF => idx,
        _ => return Err(ElfError::MissingSection(TEXT)),
    };

    Ok(DynamicTables {
        dynsym: dynsym.ok_or(ElfError::MissingSection(DYNSYM))?,
        dynstr: dynstr.ok_or(ElfError::MissingSection(DYNSTR))?,
        text_index,
    })
}

fn collect_function_symbols(data: &[u8]) -> ElfResult<Vec<String>> {
    let (layout, header) = probe(data)?;
    let tables = locate_tables(data, &layout, &header)?;

    let symtab = tables.dynsym.contents(data)?;
    let strtab = tables.dynstr.contents(data)?;

    let entsize = usize::try_from(tables.dynsym.sh_entsize).unwrap_or(0);
    if entsize == 0 {
        return Ok(Vec::new());
    }
    let count = symtab.len() / entsize;

    let mut names = Vec::new();
    for i in 0..count {
        let Ok(symbol) = Symbol::parse(symtab, i * entsize, &layout) else {
            break;
        };
        if !symbol.is_function() || !symbol.is_global() {
            continue;
        }
        if symbol.st_shndx != tables.text_index || symbol.st_name == 0 {
            continue;
        }
        if let Ok(name) = get_string(strtab, symbol.st_name)
            && !name.is_empty()
        {
            names.push(name.to_string());
        }
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ELF_MAGIC;

    #[test]
    fn empty_and_garbage_are_not_shared_objects() {
        assert!(!is_shared_object_bytes(&[]));
        assert!(!is_shared_object_bytes(b"#!/bin/sh\necho hi\n"));
        assert!(scan_function_symbols_bytes(b"not an elf").is_empty());
    }

    #[test]
    fn header_only_dyn_object_probes_true_but_scans_empty() {
        let mut data = [0u8; 64];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = 2;
        data[5] = 1;
        data[16] = 3;
        assert!(is_shared_object_bytes(&data));
        assert!(scan_function_symbols_bytes(&data).is_empty());
    }

    #[test]
    fn missing_file_fails_closed() {
        let path = std::env::temp_dir().join("warden_scan_missing_file.so");
        let _ = std::fs::remove_file(&path);
        assert!(!is_shared_object(&path));
        assert!(scan_function_symbols(&path).is_empty());
    }
}
