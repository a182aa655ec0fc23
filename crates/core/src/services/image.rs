//! Memory image of an executable, built from its section table with `goblin`.
//!
//! Only file-backed bytes are readable; zero-fill sections (`.bss`,
//! `__zerofill`) occupy address space but read as unmapped.

use std::collections::{HashMap, HashSet};

use goblin::{elf, mach, pe, Object};

/// Load address for the first allocatable section of a relocatable ELF object.
pub const RELOCATABLE_BASE: u64 = 0x10_0000;

const MACH_SECTION_TYPE: u32 = 0xff;
const MACH_S_ZEROFILL: u32 = 0x1;
const MACH_S_GB_ZEROFILL: u32 = 0xc;
const MACH_S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
const MACH_S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
const MACH_S_ATTR_SOME_INSTRUCTIONS: u32 = 0x400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub file_offset: usize,
    /// Number of bytes backed by the file, starting at `start`.
    pub file_size: usize,
    pub executable: bool,
}

impl Section {
    fn contains_backed(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.file_size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: Option<u64>,
}

/// Parsed binary: sections mapped at virtual addresses plus function symbols.
#[derive(Debug)]
pub struct BinaryImage {
    bytes: Vec<u8>,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub entry: Option<u64>,
    /// Capstone architecture name inferred from the header, if recognised.
    pub arch: Option<String>,
    pub word_size: usize,
    pub little_endian: bool,
}

impl BinaryImage {
    /// Parse ELF, PE or thin Mach-O bytes.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, String> {
        let parsed = match Object::parse(&bytes) {
            Ok(Object::Elf(elf)) => elf_parts(&elf, bytes.len()),
            Ok(Object::PE(pe)) => pe_parts(&pe, bytes.len()),
            Ok(Object::Mach(mach::Mach::Binary(bin))) => mach_parts(&bin, bytes.len()),
            Ok(Object::Mach(mach::Mach::Fat(_))) => {
                return Err("fat Mach-O archives are not supported; extract a slice first".into())
            }
            Ok(_) => return Err("unsupported object format".into()),
            Err(e) => return Err(format!("not a recognised executable: {e}")),
        };

        let mut symbols = Vec::new();
        let mut seen = HashSet::new();
        for sym in parsed.symbols {
            let in_code = parsed
                .sections
                .iter()
                .any(|s| s.executable && s.contains_backed(sym.address));
            if in_code && seen.insert(sym.address) {
                symbols.push(sym);
            }
        }

        Ok(Self {
            bytes,
            sections: parsed.sections,
            symbols,
            entry: parsed.entry,
            arch: parsed.arch,
            word_size: parsed.word_size,
            little_endian: parsed.little_endian,
        })
    }

    /// Section whose file-backed range contains `addr`.
    pub fn section_at(&self, addr: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_backed(addr))
    }

    pub fn executable_section_at(&self, addr: u64) -> Option<&Section> {
        self.section_at(addr).filter(|s| s.executable)
    }

    /// Bytes from `addr` to the end of its section's file-backed data.
    pub fn tail_at(&self, addr: u64) -> Option<&[u8]> {
        let sec = self.section_at(addr)?;
        let start = sec.file_offset.checked_add((addr - sec.start) as usize)?;
        let end = sec.file_offset.checked_add(sec.file_size)?.min(self.bytes.len());
        self.bytes.get(start..end)
    }

    /// Like `tail_at`, restricted to executable sections.
    pub fn code_at(&self, addr: u64) -> Option<&[u8]> {
        self.executable_section_at(addr)?;
        self.tail_at(addr)
    }

    pub fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        self.tail_at(addr).and_then(|tail| tail.get(..len))
    }

    /// Read an unsigned integer of `width` bytes (1..=8) in image byte order.
    pub fn read_uint(&self, addr: u64, width: usize) -> Option<u64> {
        if width == 0 || width > 8 {
            return None;
        }
        let raw = self.read(addr, width)?;
        let mut value = 0u64;
        if self.little_endian {
            for (i, b) in raw.iter().enumerate() {
                value |= (*b as u64) << (8 * i);
            }
        } else {
            for b in raw {
                value = (value << 8) | *b as u64;
            }
        }
        Some(value)
    }

    pub fn read_word(&self, addr: u64) -> Option<u64> {
        self.read_uint(addr, self.word_size)
    }

    /// Printable run starting at `addr`, if it is terminated by a NUL byte.
    pub fn c_string_at(&self, addr: u64) -> Option<&[u8]> {
        let tail = self.tail_at(addr)?;
        let len = tail.iter().position(|b| !is_printable(*b))?;
        if tail[len] == 0 {
            Some(&tail[..len])
        } else {
            None
        }
    }
}

/// Printable ASCII in the C-locale sense, whitespace included.
pub fn is_printable(b: u8) -> bool {
    matches!(b, 0x20..=0x7e | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

struct ImageParts {
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    entry: Option<u64>,
    arch: Option<String>,
    word_size: usize,
    little_endian: bool,
}

fn clamp_file_size(offset: u64, size: u64, bytes_len: usize) -> usize {
    let available = (bytes_len as u64).saturating_sub(offset);
    size.min(available) as usize
}

fn elf_parts(elf: &elf::Elf, bytes_len: usize) -> ImageParts {
    let relocatable = elf.header.e_type == elf::header::ET_REL;
    let mut next_base = RELOCATABLE_BASE;
    let mut bases = HashMap::new();
    let mut sections = Vec::new();

    for (idx, sh) in elf.section_headers.iter().enumerate() {
        if sh.sh_flags & elf::section_header::SHF_ALLOC as u64 == 0 {
            continue;
        }
        // Objects have every section at address 0; lay them out back to back.
        let start = if relocatable {
            let Some(base) = next_base.checked_next_multiple_of(sh.sh_addralign.max(1)) else {
                log::debug!("section {idx} does not fit the relocatable layout; skipped");
                continue;
            };
            next_base = base.saturating_add(sh.sh_size);
            base
        } else {
            sh.sh_addr
        };
        bases.insert(idx, start);
        let file_size = if sh.sh_type == elf::section_header::SHT_NOBITS {
            0
        } else {
            clamp_file_size(sh.sh_offset, sh.sh_size, bytes_len)
        };
        sections.push(Section {
            name: elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string(),
            start,
            end: start.saturating_add(sh.sh_size),
            file_offset: sh.sh_offset as usize,
            file_size,
            executable: sh.sh_flags & elf::section_header::SHF_EXECINSTR as u64 != 0,
        });
    }

    let mut symbols = Vec::new();
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in tables {
        for sym in syms.iter() {
            if !sym.is_function() || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
                continue;
            }
            let address = if relocatable {
                match bases.get(&sym.st_shndx) {
                    Some(base) => base.saturating_add(sym.st_value),
                    None => continue,
                }
            } else if sym.st_value > 0 {
                sym.st_value
            } else {
                continue;
            };
            let name = strtab.get_at(sym.st_name).unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            let size = if sym.st_size > 0 { Some(sym.st_size) } else { None };
            symbols.push(Symbol { name, address, size });
        }
    }

    let arch = match elf.header.e_machine {
        elf::header::EM_X86_64 => Some("x86_64".into()),
        elf::header::EM_386 => Some("x86".into()),
        elf::header::EM_AARCH64 => Some("arm64".into()),
        elf::header::EM_ARM => Some("arm".into()),
        _ => None,
    };
    let entry = (!relocatable && elf.header.e_entry != 0).then_some(elf.header.e_entry);

    ImageParts {
        sections,
        symbols,
        entry,
        arch,
        word_size: if elf.is_64 { 8 } else { 4 },
        little_endian: elf.little_endian,
    }
}

/// `image_base + rva`, or `None` when a crafted header overflows.
fn rebase(image_base: u64, rva: u64) -> Option<u64> {
    image_base.checked_add(rva)
}

fn pe_parts(pe: &pe::PE, bytes_len: usize) -> ImageParts {
    let image_base = pe.image_base as u64;
    let sections = pe
        .sections
        .iter()
        .filter_map(|sec| {
            let virtual_size = if sec.virtual_size == 0 {
                sec.size_of_raw_data as u64
            } else {
                sec.virtual_size as u64
            };
            let start = rebase(image_base, sec.virtual_address as u64)?;
            let raw = (sec.size_of_raw_data as u64).min(virtual_size);
            Some(Section {
                name: sec.name().unwrap_or_default().to_string(),
                start,
                end: start.saturating_add(virtual_size),
                file_offset: sec.pointer_to_raw_data as usize,
                file_size: clamp_file_size(sec.pointer_to_raw_data as u64, raw, bytes_len),
                executable: sec.characteristics
                    & (pe::section_table::IMAGE_SCN_MEM_EXECUTE
                        | pe::section_table::IMAGE_SCN_CNT_CODE)
                    != 0,
            })
        })
        .collect();

    let symbols = pe
        .exports
        .iter()
        .filter(|exp| exp.rva != 0)
        .filter_map(|exp| {
            let name = exp.name.unwrap_or_default().to_string();
            if name.is_empty() {
                return None;
            }
            let address = rebase(image_base, exp.rva as u64)?;
            Some(Symbol { name, address, size: None })
        })
        .collect();

    let arch = match pe.header.coff_header.machine {
        pe::header::COFF_MACHINE_X86 => Some("x86".into()),
        pe::header::COFF_MACHINE_X86_64 => Some("x86_64".into()),
        pe::header::COFF_MACHINE_ARM => Some("arm".into()),
        pe::header::COFF_MACHINE_ARM64 => Some("arm64".into()),
        _ => None,
    };
    let entry = if pe.entry == 0 { None } else { rebase(image_base, pe.entry as u64) };

    ImageParts {
        sections,
        symbols,
        entry,
        arch,
        word_size: if pe.is_64 { 8 } else { 4 },
        little_endian: true,
    }
}

fn mach_parts(bin: &mach::MachO, bytes_len: usize) -> ImageParts {
    let sections: Vec<Section> = bin
        .segments
        .sections()
        .flatten()
        .filter_map(|res| res.ok())
        .map(|(sec, _)| {
            let zerofill = matches!(
                sec.flags & MACH_SECTION_TYPE,
                MACH_S_ZEROFILL | MACH_S_GB_ZEROFILL | MACH_S_THREAD_LOCAL_ZEROFILL
            );
            Section {
                name: sec.name().unwrap_or("").to_string(),
                start: sec.addr,
                end: sec.addr.saturating_add(sec.size),
                file_offset: sec.offset as usize,
                file_size: if zerofill {
                    0
                } else {
                    clamp_file_size(sec.offset as u64, sec.size, bytes_len)
                },
                executable: sec.flags
                    & (MACH_S_ATTR_PURE_INSTRUCTIONS | MACH_S_ATTR_SOME_INSTRUCTIONS)
                    != 0,
            }
        })
        .collect();

    let mut symbols = Vec::new();
    for sym in bin.symbols() {
        let Ok((name, nlist)) = sym else { continue };
        // Debugger stabs and undefined/absolute symbols carry no code address.
        if nlist.n_type & 0xe0 != 0 || nlist.n_sect == 0 {
            continue;
        }
        let name = name.trim_start_matches('_').to_string();
        if name.is_empty() {
            continue;
        }
        symbols.push(Symbol { name, address: nlist.n_value, size: None });
    }

    let arch = match bin.header.cputype() {
        mach::cputype::CPU_TYPE_X86 => Some("x86".into()),
        mach::cputype::CPU_TYPE_X86_64 => Some("x86_64".into()),
        mach::cputype::CPU_TYPE_ARM => Some("arm".into()),
        mach::cputype::CPU_TYPE_ARM64 => Some("arm64".into()),
        _ => None,
    };
    let entry = (bin.entry != 0).then_some(bin.entry);

    ImageParts {
        sections,
        symbols,
        entry,
        arch,
        word_size: if bin.is_64 { 8 } else { 4 },
        little_endian: bin.little_endian,
    }
}
