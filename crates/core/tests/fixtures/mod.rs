//! Synthetic objects for backend and pipeline tests.
//!
//! Relocatable objects get their allocatable sections laid out back to back
//! from `RELOCATABLE_BASE`, so with byte alignment `.rodata` starts right
//! after the last `.text` byte.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use object::read::{Object as _, ObjectSection as _};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

pub use dictgen_core::services::image::RELOCATABLE_BASE;

/// Address `.rodata` will be mapped at for a `.text` of `text_len` bytes.
pub fn rodata_address(text_len: usize) -> u64 {
    RELOCATABLE_BASE + text_len as u64
}

/// Little-endian imm32 for an absolute address in the synthetic layout.
pub fn imm32(addr: u64) -> [u8; 4] {
    (addr as u32).to_le_bytes()
}

/// Write an x86_64 ELF object with one `.text`, one `.rodata` and a global
/// function symbol per `(name, offset)` pair.
pub fn write_elf(
    dir: &Path,
    name: &str,
    text: &[u8],
    rodata: &[u8],
    funcs: &[(&str, u64)],
) -> PathBuf {
    write_object(dir, name, BinaryFormat::Elf, Architecture::X86_64, text, rodata, funcs)
}

/// Like [`write_elf`] for any format and architecture `object` can emit.
/// Mach-O symbols get the usual leading underscore from the writer.
pub fn write_object(
    dir: &Path,
    name: &str,
    format: BinaryFormat,
    arch: Architecture,
    text: &[u8],
    rodata: &[u8],
    funcs: &[(&str, u64)],
) -> PathBuf {
    let mut obj = Object::new(format, arch, Endianness::Little);
    let text_id = obj.section_id(StandardSection::Text);
    obj.section_mut(text_id).set_data(text.to_vec(), 1);
    let ro_id = obj.section_id(StandardSection::ReadOnlyData);
    obj.section_mut(ro_id).set_data(rodata.to_vec(), 1);

    for (func, offset) in funcs {
        let flags = match format {
            BinaryFormat::Elf => SymbolFlags::Elf { st_info: 0x12, st_other: 0 },
            _ => SymbolFlags::None,
        };
        obj.add_symbol(Symbol {
            name: func.as_bytes().to_vec(),
            value: *offset,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text_id),
            flags,
        });
    }

    let path = dir.join(name);
    std::fs::write(&path, obj.write().expect("serialize object")).expect("write fixture");
    path
}

/// Address the writer assigned to section `name`, as recorded in the file.
pub fn section_address(path: &Path, name: &str) -> u64 {
    let bytes = std::fs::read(path).expect("read fixture");
    let file = object::File::parse(&*bytes).expect("parse fixture");
    file.section_by_name(name).expect("section present").address()
}

/// `mov edi, <string>; ret` followed by a lone `0x0f` that cannot be decoded,
/// with `good` at offset 0 and `broken` on the trailing byte.
pub fn string_and_broken_function(dir: &Path, strings: &[&[u8]]) -> PathBuf {
    let mut rodata = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(rodata.len());
        rodata.extend_from_slice(s);
        rodata.push(0);
    }
    // Each string gets its own `mov edi, imm32` (5 bytes), then ret + 0x0f.
    let text_len = strings.len() * 5 + 2;
    let base = rodata_address(text_len);
    let mut text = Vec::new();
    for off in offsets {
        text.push(0xbf);
        text.extend_from_slice(&imm32(base + off as u64));
    }
    text.push(0xc3);
    text.push(0x0f);
    write_elf(dir, "strings.o", &text, &rodata, &[("good", 0), ("broken", (text_len - 1) as u64)])
}
