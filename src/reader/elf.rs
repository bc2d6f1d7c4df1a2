//! Reader for ELF64 relocatable objects
//!
//! Lowers little-endian `ET_REL` inputs for x86-64 and ARM64 into the
//! intermediate representation. Section indices are preserved one to one,
//! with non-allocatable and metadata sections tagged `Unknown`, so symbol
//! and relocation indices from the input remain valid.

use log::warn;
use num_traits::FromPrimitive;

use crate::base::{
    Format, Machine, Object, Relocation, RelocationKind, RelocationTarget, Section, SectionFlags,
    SectionKind, Symbol, SymbolBinding, SymbolKind,
};
use crate::error::{Error, Result};
use crate::image::elf::{
    ElfMachineType, ElfObjectType, ElfSectionType, R_AARCH64_ABS64, R_AARCH64_ADD_ABS_LO12_NC,
    R_AARCH64_ADR_GOT_PAGE, R_AARCH64_ADR_PREL_PG_HI21, R_AARCH64_CALL26, R_AARCH64_JUMP26,
    R_AARCH64_LD64_GOT_LO12_NC, R_AARCH64_LDST64_ABS_LO12_NC, R_X86_64_64, R_X86_64_GOTPCREL,
    R_X86_64_GOTPCRELX, R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX, SHF_ALLOC,
    SHF_EXECINSTR, SHF_TLS, SHF_WRITE, SHN_UNDEF, STB_GLOBAL, STB_WEAK, STT_FUNC, STT_OBJECT,
    STT_SECTION,
};
use crate::reader::Cursor;

/// One parsed section header
struct RawSectionHeader {
    name: u32,
    r#type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
}

/// The normalized kind for a section header
fn section_kind(header: &RawSectionHeader) -> SectionKind {
    if header.r#type != ElfSectionType::ProgBits as u32
        && header.r#type != ElfSectionType::NoBits as u32
    {
        return SectionKind::Unknown;
    }
    if header.flags & SHF_ALLOC == 0 {
        return SectionKind::Unknown;
    }
    if header.flags & SHF_TLS != 0 {
        return if header.r#type == ElfSectionType::NoBits as u32 {
            SectionKind::ThreadBss
        } else {
            SectionKind::ThreadData
        };
    }
    if header.r#type == ElfSectionType::NoBits as u32 {
        return SectionKind::Bss;
    }
    if header.flags & SHF_EXECINSTR != 0 {
        return SectionKind::Text;
    }
    if header.flags & SHF_WRITE != 0 {
        return SectionKind::Data;
    }
    SectionKind::ReadOnlyData
}

/// The permission flags for a section header
fn section_flags(header: &RawSectionHeader) -> SectionFlags {
    let mut flags = SectionFlags::empty();
    if header.flags & SHF_ALLOC != 0 {
        flags |= SectionFlags::ALLOCATABLE;
    }
    if header.flags & SHF_WRITE != 0 {
        flags |= SectionFlags::WRITABLE;
    }
    if header.flags & SHF_EXECINSTR != 0 {
        flags |= SectionFlags::EXECUTABLE;
    }
    flags
}

/// Map an ELF relocation type to the unified kind
fn relocation_kind(machine: Machine, r_type: u32, name: &str) -> RelocationKind {
    let kind = match machine {
        Machine::X86_64 => match r_type {
            R_X86_64_64 => Some(RelocationKind::X64Abs64),
            R_X86_64_PC32 => Some(RelocationKind::X64Pc32),
            R_X86_64_PLT32 => Some(RelocationKind::X64Plt32),
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                Some(RelocationKind::X64GotPcRel)
            }
            _ => None,
        },
        Machine::Arm64 => match r_type {
            R_AARCH64_ABS64 => Some(RelocationKind::Arm64Abs64),
            R_AARCH64_CALL26 => Some(RelocationKind::Arm64Call26),
            R_AARCH64_JUMP26 => Some(RelocationKind::Arm64Jump26),
            R_AARCH64_ADR_PREL_PG_HI21 => Some(RelocationKind::Arm64AdrPrelPgHi21),
            R_AARCH64_ADD_ABS_LO12_NC => Some(RelocationKind::Arm64AddAbsLo12Nc),
            R_AARCH64_LDST64_ABS_LO12_NC => Some(RelocationKind::Arm64Ldst64AbsLo12Nc),
            R_AARCH64_ADR_GOT_PAGE => Some(RelocationKind::Arm64GotLoadPage21),
            R_AARCH64_LD64_GOT_LO12_NC => Some(RelocationKind::Arm64GotLoadPageOff12),
            _ => None,
        },
    };
    kind.unwrap_or_else(|| {
        warn!("unknown relocation type {r_type} in {name}, treating as no-op");
        RelocationKind::None
    })
}

/// Parse an ELF64 relocatable object into the intermediate representation
pub fn read_object(name: &str, bytes: &[u8]) -> Result<Object> {
    let cursor = Cursor::new(name, bytes);
    let invalid = |reason: &str| Error::InvalidObject {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if cursor.u8_at(4)? != 2 || cursor.u8_at(5)? != 1 {
        return Err(invalid("not a little-endian ELF64 file"));
    }
    let r#type = cursor.u16_at(16)?;
    if ElfObjectType::from_u16(r#type) != Some(ElfObjectType::Relocatable) {
        return Err(invalid("not a relocatable object"));
    }
    let machine = match ElfMachineType::from_u16(cursor.u16_at(18)?) {
        Some(ElfMachineType::X86_64) => Machine::X86_64,
        Some(ElfMachineType::Aarch64) => Machine::Arm64,
        None => return Err(invalid("unsupported machine")),
    };
    let shoff = cursor.u64_at(40)? as usize;
    let shentsize = cursor.u16_at(58)? as usize;
    let shnum = cursor.u16_at(60)? as usize;
    let shstrndx = cursor.u16_at(62)? as usize;
    if shentsize != 64 {
        return Err(invalid("unexpected section header entry size"));
    }

    let mut headers = Vec::with_capacity(shnum);
    for index in 0..shnum {
        let at = shoff + index * shentsize;
        headers.push(RawSectionHeader {
            name: cursor.u32_at(at)?,
            r#type: cursor.u32_at(at + 4)?,
            flags: cursor.u64_at(at + 8)?,
            offset: cursor.u64_at(at + 24)?,
            size: cursor.u64_at(at + 32)?,
            link: cursor.u32_at(at + 40)?,
            info: cursor.u32_at(at + 44)?,
            addralign: cursor.u64_at(at + 48)?,
        });
    }
    let shstrtab = headers
        .get(shstrndx)
        .ok_or_else(|| invalid("missing section name table"))?
        .offset as usize;

    // Sections, index for index with the input
    let mut sections = Vec::with_capacity(shnum);
    for header in &headers {
        let section_name = cursor.cstr_at(shstrtab, header.name as usize)?;
        let kind = section_kind(header);
        let content = if kind == SectionKind::Unknown || kind.is_zero_fill() {
            None
        } else {
            Some(cursor.bytes_at(header.offset as usize, header.size as usize)?.to_vec())
        };
        let mut section = Section::builder()
            .name(section_name)
            .kind(kind)
            .size(header.size)
            .align(header.addralign.max(1))
            .flags(section_flags(header))
            .build();
        section.content = content;
        sections.push(section);
    }

    // Symbols from the first SHT_SYMTAB, index for index with the input.
    // The raw type and section index of each entry are kept so relocations
    // against section symbols can be rewritten as section targets.
    let mut symbols = Vec::new();
    let mut raw_symbols: Vec<(u8, u16)> = Vec::new();
    if let Some(symtab) = headers
        .iter()
        .find(|header| header.r#type == ElfSectionType::SymTab as u32)
    {
        let strtab = headers
            .get(symtab.link as usize)
            .ok_or_else(|| invalid("symbol table has no string table"))?
            .offset as usize;
        let count = (symtab.size / 24) as usize;
        for index in 0..count {
            let at = symtab.offset as usize + index * 24;
            let name_offset = cursor.u32_at(at)? as usize;
            let info = cursor.u8_at(at + 4)?;
            let shndx = cursor.u16_at(at + 6)?;
            let value = cursor.u64_at(at + 8)?;
            let size = cursor.u64_at(at + 16)?;
            raw_symbols.push((info, shndx));

            let binding = match info >> 4 {
                STB_GLOBAL => SymbolBinding::Global,
                STB_WEAK => SymbolBinding::Weak,
                _ => SymbolBinding::Local,
            };
            let kind = match info & 0xF {
                STT_FUNC => SymbolKind::Func,
                STT_OBJECT => SymbolKind::Object,
                _ => SymbolKind::NoType,
            };
            let mut symbol = Symbol::builder()
                .name(cursor.cstr_at(strtab, name_offset)?)
                .kind(kind)
                .binding(binding)
                .value(value)
                .size(size)
                .build();
            match shndx {
                SHN_UNDEF => {}
                // Absolute and common symbols carry their value directly.
                special if special >= 0xFF00 => symbol.is_defined = true,
                section => {
                    symbol.is_defined = true;
                    symbol.section = Some(section as usize);
                }
            }
            symbols.push(symbol);
        }
    }

    // Relocations from every SHT_RELA section
    let mut relocations = Vec::new();
    for header in &headers {
        if header.r#type != ElfSectionType::RelA as u32 {
            continue;
        }
        let target_section = header.info as usize;
        if sections
            .get(target_section)
            .map(|section| section.kind == SectionKind::Unknown)
            .unwrap_or(true)
        {
            continue;
        }
        let count = (header.size / 24) as usize;
        for index in 0..count {
            let at = header.offset as usize + index * 24;
            let offset = cursor.u64_at(at)?;
            let info = cursor.u64_at(at + 8)?;
            let addend = cursor.i64_at(at + 16)?;
            let symbol_index = (info >> 32) as usize;
            let r_type = (info & 0xFFFF_FFFF) as u32;

            let (raw_info, raw_shndx) = raw_symbols
                .get(symbol_index)
                .copied()
                .ok_or_else(|| invalid("relocation names a symbol out of range"))?;
            let target = if raw_info & 0xF == STT_SECTION {
                RelocationTarget::Section(raw_shndx as usize)
            } else {
                RelocationTarget::Symbol(symbol_index)
            };
            relocations.push(
                Relocation::builder()
                    .offset(offset)
                    .addend(addend)
                    .target(target)
                    .section(target_section)
                    .kind(relocation_kind(machine, r_type, name))
                    .build(),
            );
        }
    }

    Ok(Object::builder()
        .name(name)
        .format(Format::Elf)
        .machine(machine)
        .sections(sections)
        .symbols(symbols)
        .relocations(relocations)
        .build())
}
