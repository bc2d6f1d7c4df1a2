//! Reader for Mach-O ARM64 relocatable objects
//!
//! Lowers `MH_OBJECT` inputs into the intermediate representation. Symbol
//! values in Mach-O objects are addresses in the object's flat section
//! space; they are rebased to section-relative offsets here. An
//! `ARM64_RELOC_ADDEND` entry carries the addend for the entry that
//! follows it; `ARM64_RELOC_PAGEOFF12` is split into the ADD and LDR
//! kinds by inspecting the instruction at the patch site.

use log::warn;

use crate::arch::aarch64::is_ldst64_imm;
use crate::base::{
    Format, Machine, Object, Relocation, RelocationKind, RelocationTarget, Section, SectionFlags,
    SectionKind, Symbol, SymbolBinding, SymbolKind,
};
use crate::error::{Error, Result};
use crate::image::macho::{
    ARM64_RELOC_ADDEND, ARM64_RELOC_BRANCH26, ARM64_RELOC_GOT_LOAD_PAGE21,
    ARM64_RELOC_GOT_LOAD_PAGEOFF12, ARM64_RELOC_PAGE21, ARM64_RELOC_PAGEOFF12,
    ARM64_RELOC_TLVP_LOAD_PAGE21, ARM64_RELOC_TLVP_LOAD_PAGEOFF12, ARM64_RELOC_UNSIGNED,
    CPU_TYPE_ARM64, LC_SEGMENT_64, LC_SYMTAB, MH_OBJECT, N_EXT, N_SECT, N_TYPE_MASK, N_UNDF,
    SECTION_TYPE_MASK, S_ATTR_PURE_INSTRUCTIONS, S_CSTRING_LITERALS, S_REGULAR,
    S_THREAD_LOCAL_REGULAR, S_THREAD_LOCAL_VARIABLES, S_THREAD_LOCAL_ZEROFILL, S_ZEROFILL,
};
use crate::reader::Cursor;

/// `N_WEAK_DEF` in `n_desc`
const N_WEAK_DEF: u16 = 0x0080;

/// One parsed section record plus the reader state it carries
struct RawSection {
    addr: u64,
    offset: u32,
    reloff: u32,
    nreloc: u32,
}

/// The normalized kind for a section record
fn section_kind(sectname: &str, segname: &str, flags: u32) -> SectionKind {
    match flags & SECTION_TYPE_MASK {
        S_ZEROFILL => return SectionKind::Bss,
        S_CSTRING_LITERALS => return SectionKind::ReadOnlyData,
        S_THREAD_LOCAL_VARIABLES => return SectionKind::ThreadVars,
        S_THREAD_LOCAL_REGULAR => return SectionKind::ThreadData,
        S_THREAD_LOCAL_ZEROFILL => return SectionKind::ThreadBss,
        S_REGULAR => {}
        _ => return SectionKind::Unknown,
    }
    if segname == "__DWARF" || sectname.starts_with("__debug") || sectname == "__compact_unwind" || sectname == "__eh_frame" {
        return SectionKind::Unknown;
    }
    if flags & S_ATTR_PURE_INSTRUCTIONS != 0 || sectname == "__text" {
        return SectionKind::Text;
    }
    match segname {
        "__TEXT" => SectionKind::ReadOnlyData,
        "__DATA" => SectionKind::Data,
        _ => SectionKind::Unknown,
    }
}

/// Permission flags for a normalized kind
fn section_flags(kind: SectionKind) -> SectionFlags {
    match kind {
        SectionKind::Text => SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE,
        SectionKind::ReadOnlyData => SectionFlags::ALLOCATABLE,
        SectionKind::Unknown => SectionFlags::empty(),
        _ => SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE,
    }
}

/// Trim the NUL padding of a fixed 16-byte name field
fn unpack_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Parse a Mach-O ARM64 relocatable object into the intermediate
/// representation
pub fn read_object(name: &str, bytes: &[u8]) -> Result<Object> {
    let cursor = Cursor::new(name, bytes);
    let invalid = |reason: &str| Error::InvalidObject {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if cursor.u32_at(4)? != CPU_TYPE_ARM64 {
        return Err(invalid("not an ARM64 Mach-O file"));
    }
    if cursor.u32_at(12)? != MH_OBJECT {
        return Err(invalid("not a relocatable object"));
    }
    let ncmds = cursor.u32_at(16)? as usize;

    let mut raw_sections: Vec<RawSection> = Vec::new();
    let mut sections: Vec<Section> = Vec::new();
    let mut symtab: Option<(usize, usize, usize)> = None;

    let mut command_offset = 32usize;
    for _ in 0..ncmds {
        let cmd = cursor.u32_at(command_offset)?;
        let cmdsize = cursor.u32_at(command_offset + 4)? as usize;
        match cmd {
            LC_SEGMENT_64 => {
                let nsects = cursor.u32_at(command_offset + 64)? as usize;
                for index in 0..nsects {
                    let at = command_offset + 72 + index * 80;
                    let sectname = unpack_name(cursor.bytes_at(at, 16)?);
                    let segname = unpack_name(cursor.bytes_at(at + 16, 16)?);
                    let addr = cursor.u64_at(at + 32)?;
                    let size = cursor.u64_at(at + 40)?;
                    let offset = cursor.u32_at(at + 48)?;
                    let align = 1u64 << cursor.u32_at(at + 52)?;
                    let reloff = cursor.u32_at(at + 56)?;
                    let nreloc = cursor.u32_at(at + 60)?;
                    let flags = cursor.u32_at(at + 64)?;

                    let kind = section_kind(&sectname, &segname, flags);
                    let mut section = Section::builder()
                        .name(sectname)
                        .kind(kind)
                        .size(size)
                        .align(align)
                        .flags(section_flags(kind))
                        .build();
                    if kind != SectionKind::Unknown && !kind.is_zero_fill() {
                        section.content =
                            Some(cursor.bytes_at(offset as usize, size as usize)?.to_vec());
                    }
                    sections.push(section);
                    raw_sections.push(RawSection {
                        addr,
                        offset,
                        reloff,
                        nreloc,
                    });
                }
            }
            LC_SYMTAB => {
                let symoff = cursor.u32_at(command_offset + 8)? as usize;
                let nsyms = cursor.u32_at(command_offset + 12)? as usize;
                let stroff = cursor.u32_at(command_offset + 16)? as usize;
                symtab = Some((symoff, nsyms, stroff));
            }
            _ => {}
        }
        command_offset += cmdsize;
    }

    // Symbols, rebased from flat addresses to section-relative values
    let mut symbols = Vec::new();
    if let Some((symoff, nsyms, stroff)) = symtab {
        for index in 0..nsyms {
            let at = symoff + index * 16;
            let n_strx = cursor.u32_at(at)? as usize;
            let n_type = cursor.u8_at(at + 4)?;
            let n_sect = cursor.u8_at(at + 5)?;
            let n_desc = cursor.u16_at(at + 6)?;
            let n_value = cursor.u64_at(at + 8)?;

            let binding = if n_type & N_EXT != 0 {
                if n_desc & N_WEAK_DEF != 0 {
                    SymbolBinding::Weak
                } else {
                    SymbolBinding::Global
                }
            } else {
                SymbolBinding::Local
            };
            let mut symbol = Symbol::builder()
                .name(cursor.cstr_at(stroff, n_strx)?)
                .binding(binding)
                .value(n_value)
                .build();
            match n_type & N_TYPE_MASK {
                N_SECT => {
                    let section_index = n_sect
                        .checked_sub(1)
                        .map(usize::from)
                        .ok_or_else(|| invalid("defined symbol without a section"))?;
                    let raw = raw_sections
                        .get(section_index)
                        .ok_or_else(|| invalid("symbol names a section out of range"))?;
                    symbol.is_defined = true;
                    symbol.section = Some(section_index);
                    symbol.value = n_value - raw.addr;
                    symbol.kind = match sections[section_index].kind {
                        SectionKind::Text => SymbolKind::Func,
                        _ => SymbolKind::Object,
                    };
                }
                N_UNDF => {}
                // N_ABS and anything exotic keep the declared value.
                _ => symbol.is_defined = true,
            }
            symbols.push(symbol);
        }
    }

    // Relocations per section; ADDEND entries fold into their successor
    let mut relocations = Vec::new();
    for (section_index, raw) in raw_sections.iter().enumerate() {
        if sections[section_index].kind == SectionKind::Unknown {
            continue;
        }
        let mut pending_addend: i64 = 0;
        for index in 0..raw.nreloc as usize {
            let at = raw.reloff as usize + index * 8;
            let r_address = cursor.u32_at(at)?;
            let word = cursor.u32_at(at + 4)?;
            let r_symbolnum = word & 0x00FF_FFFF;
            let r_extern = (word >> 27) & 1 == 1;
            let r_type = word >> 28;

            if r_type == ARM64_RELOC_ADDEND {
                // Sign-extend the 24-bit payload.
                pending_addend = ((r_symbolnum as i64) << 40) >> 40;
                continue;
            }

            let site = r_address as u64;
            let content = sections[section_index].content.as_deref().unwrap_or(&[]);
            let kind = match r_type {
                ARM64_RELOC_UNSIGNED => RelocationKind::Arm64Abs64,
                ARM64_RELOC_BRANCH26 => RelocationKind::Arm64Call26,
                ARM64_RELOC_PAGE21 => RelocationKind::Arm64AdrPrelPgHi21,
                ARM64_RELOC_PAGEOFF12 => {
                    if is_ldst64_imm(content, site as usize) {
                        RelocationKind::Arm64Ldst64AbsLo12Nc
                    } else {
                        RelocationKind::Arm64AddAbsLo12Nc
                    }
                }
                ARM64_RELOC_GOT_LOAD_PAGE21 => RelocationKind::Arm64GotLoadPage21,
                ARM64_RELOC_GOT_LOAD_PAGEOFF12 => RelocationKind::Arm64GotLoadPageOff12,
                ARM64_RELOC_TLVP_LOAD_PAGE21 => RelocationKind::Arm64TlvpLoadPage21,
                ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => RelocationKind::Arm64TlvpLoadPageOff12,
                other => {
                    warn!("unknown relocation type {other} in {name}, treating as no-op");
                    RelocationKind::None
                }
            };

            let mut addend = std::mem::take(&mut pending_addend);
            let target = if r_extern {
                RelocationTarget::Symbol(r_symbolnum as usize)
            } else {
                let target_index = (r_symbolnum as usize)
                    .checked_sub(1)
                    .ok_or_else(|| invalid("internal relocation without a section"))?;
                let target_raw = raw_sections
                    .get(target_index)
                    .ok_or_else(|| invalid("relocation names a section out of range"))?;
                if kind == RelocationKind::Arm64Abs64 {
                    // Internal absolute slots store the flat target address;
                    // rebase it to an addend against the target section.
                    let stored = cursor
                        .i64_at(raw.offset as usize + site as usize)
                        .unwrap_or(0);
                    addend = stored - target_raw.addr as i64;
                }
                RelocationTarget::Section(target_index)
            };

            relocations.push(
                Relocation::builder()
                    .offset(site)
                    .addend(addend)
                    .target(target)
                    .section(section_index)
                    .kind(kind)
                    .build(),
            );
        }
    }

    Ok(Object::builder()
        .name(name)
        .format(Format::MachO)
        .machine(Machine::Arm64)
        .sections(sections)
        .symbols(symbols)
        .relocations(relocations)
        .build())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::image::macho::{MachHeader, MH_MAGIC_64};
    use crate::HasWrittenSize;

    /// Build a minimal MH_OBJECT: one __text section with `bl 0; ret`, a
    /// defined `_main`, an undefined `_printf`, and a BRANCH26 relocation.
    fn sample_object() -> Vec<u8> {
        let code: Vec<u8> = [0x9400_0000u32, 0xD65F_03C0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        let strtab = b"\0_main\0_printf\0".to_vec();

        let sizeofcmds = (72 + 80 + 24) as u32;
        let text_off = 32 + sizeofcmds;
        let reloc_off = text_off + code.len() as u32;
        let sym_off = reloc_off + 8;
        let str_off = sym_off + 2 * 16;

        let mut file = Vec::new();
        file.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        file.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&MH_OBJECT.to_le_bytes());
        file.extend_from_slice(&2u32.to_le_bytes());
        file.extend_from_slice(&sizeofcmds.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(file.len(), MachHeader::SIZE);

        // LC_SEGMENT_64 with one section
        file.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        file.extend_from_slice(&(72u32 + 80).to_le_bytes());
        file.extend_from_slice(&[0u8; 16]);
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&(code.len() as u64).to_le_bytes());
        file.extend_from_slice(&u64::from(text_off).to_le_bytes());
        file.extend_from_slice(&(code.len() as u64).to_le_bytes());
        file.extend_from_slice(&7u32.to_le_bytes());
        file.extend_from_slice(&7u32.to_le_bytes());
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());

        let mut sectname = [0u8; 16];
        sectname[..6].copy_from_slice(b"__text");
        let mut segname = [0u8; 16];
        segname[..6].copy_from_slice(b"__TEXT");
        file.extend_from_slice(&sectname);
        file.extend_from_slice(&segname);
        file.extend_from_slice(&0u64.to_le_bytes()); // addr
        file.extend_from_slice(&(code.len() as u64).to_le_bytes());
        file.extend_from_slice(&text_off.to_le_bytes());
        file.extend_from_slice(&2u32.to_le_bytes()); // align 4
        file.extend_from_slice(&reloc_off.to_le_bytes());
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&(S_REGULAR | S_ATTR_PURE_INSTRUCTIONS).to_le_bytes());
        file.extend_from_slice(&[0u8; 12]);

        // LC_SYMTAB
        file.extend_from_slice(&LC_SYMTAB.to_le_bytes());
        file.extend_from_slice(&24u32.to_le_bytes());
        file.extend_from_slice(&sym_off.to_le_bytes());
        file.extend_from_slice(&2u32.to_le_bytes());
        file.extend_from_slice(&str_off.to_le_bytes());
        file.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

        file.extend_from_slice(&code);

        // BRANCH26 at offset 0 against symbol 1 (_printf), extern
        file.extend_from_slice(&0u32.to_le_bytes());
        let word = 1u32 | (1 << 24) | (2 << 25) | (1 << 27) | (ARM64_RELOC_BRANCH26 << 28);
        file.extend_from_slice(&word.to_le_bytes());

        // _main: defined in section 1; _printf: undefined external
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&[N_SECT | N_EXT, 1]);
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&7u32.to_le_bytes());
        file.extend_from_slice(&[N_UNDF | N_EXT, 0]);
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());

        file.extend_from_slice(&strtab);
        file
    }

    #[test]
    fn test_reads_sample_object() {
        let bytes = sample_object();
        let object = read_object("sample.o", &bytes).unwrap();
        assert_eq!(object.machine, Machine::Arm64);
        assert_eq!(object.format, Format::MachO);

        assert_eq!(object.sections.len(), 1);
        assert_eq!(object.sections[0].kind, SectionKind::Text);
        assert_eq!(object.sections[0].name, "__text");
        assert_eq!(object.sections[0].align, 4);

        assert_eq!(object.symbols.len(), 2);
        assert_eq!(object.symbols[0].name, "_main");
        assert!(object.symbols[0].is_defined);
        assert_eq!(object.symbols[0].section, Some(0));
        assert_eq!(object.symbols[0].kind, SymbolKind::Func);
        assert_eq!(object.symbols[1].name, "_printf");
        assert!(!object.symbols[1].is_defined);

        assert_eq!(object.relocations.len(), 1);
        let relocation = &object.relocations[0];
        assert_eq!(relocation.kind, RelocationKind::Arm64Call26);
        assert_eq!(relocation.target, RelocationTarget::Symbol(1));
        assert_eq!(relocation.offset, 0);
    }

    #[test]
    fn test_rejects_wrong_cpu() {
        let mut bytes = sample_object();
        bytes[4] = 7;
        assert!(read_object("sample.o", &bytes).is_err());
    }

    #[test]
    fn test_section_kind_mapping() {
        assert_eq!(
            section_kind("__text", "__TEXT", S_ATTR_PURE_INSTRUCTIONS),
            SectionKind::Text
        );
        assert_eq!(
            section_kind("__cstring", "__TEXT", S_CSTRING_LITERALS),
            SectionKind::ReadOnlyData
        );
        assert_eq!(section_kind("__data", "__DATA", S_REGULAR), SectionKind::Data);
        assert_eq!(section_kind("__bss", "__DATA", S_ZEROFILL), SectionKind::Bss);
        assert_eq!(
            section_kind("__thread_vars", "__DATA", S_THREAD_LOCAL_VARIABLES),
            SectionKind::ThreadVars
        );
        assert_eq!(
            section_kind("__debug_info", "__DWARF", S_REGULAR),
            SectionKind::Unknown
        );
    }
}
