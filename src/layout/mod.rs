//! Section layout and address finalization
//!
//! Merges same-kinded sections across objects in stable object-insertion
//! order, assigns every merged section a virtual address in the canonical
//! order, and finalizes symbol addresses. Address assignment runs exactly
//! once; every later phase (dynamic-link materialization, relocation,
//! image writing) reads only the finalized values.

use log::debug;

use crate::base::{
    align_up, Contribution, Format, MergedSection, Object, SectionFlags, SectionKind,
};
use crate::error::Error;

/// ELF page size in bytes
pub const ELF_PAGE_SIZE: u64 = 0x1000;
/// Mach-O page size in bytes
pub const MACHO_PAGE_SIZE: u64 = 0x4000;

/// ELF base virtual address for non-PIE output
pub const ELF_BASE: u64 = 0x400000;
/// Mach-O base virtual address, directly above `__PAGEZERO`
pub const MACHO_BASE: u64 = 0x1_0000_0000;

/// The platform page size for `format`
pub fn page_size(format: Format) -> u64 {
    match format {
        Format::Elf => ELF_PAGE_SIZE,
        Format::MachO => MACHO_PAGE_SIZE,
    }
}

/// The output section name for a merged section of `kind`
pub fn output_name(kind: SectionKind, format: Format) -> &'static str {
    match format {
        Format::Elf => match kind {
            SectionKind::Text => ".text",
            SectionKind::ReadOnlyData => ".rodata",
            SectionKind::Stubs => ".stubs",
            SectionKind::Got => ".got",
            SectionKind::Data => ".data",
            SectionKind::ThreadVars => ".tlv",
            SectionKind::ThreadData => ".tdata",
            SectionKind::ThreadBss => ".tbss",
            SectionKind::Bss => ".bss",
            SectionKind::Unknown => "",
        },
        Format::MachO => match kind {
            SectionKind::Text => "__text",
            SectionKind::ReadOnlyData => "__const",
            SectionKind::Stubs => "__stubs",
            SectionKind::Got => "__got",
            SectionKind::Data => "__data",
            SectionKind::ThreadVars => "__thread_vars",
            SectionKind::ThreadData => "__thread_data",
            SectionKind::ThreadBss => "__thread_bss",
            SectionKind::Bss => "__bss",
            SectionKind::Unknown => "",
        },
    }
}

/// Merge all placeable input sections by kind, in canonical order
///
/// `stub_count` and `got_count` size the synthetic Mach-O sections; both
/// are zero for ELF output. The payload of the synthetic sections is
/// zero-filled here and written by dynamic-link materialization.
pub fn merge(
    objects: &mut [Object],
    format: Format,
    stub_count: usize,
    got_count: usize,
) -> Result<Vec<MergedSection>, Vec<Error>> {
    let mut errors = Vec::new();
    let mut merged: Vec<MergedSection> = Vec::new();

    for object in objects.iter_mut() {
        object.section_bases = vec![None; object.sections.len()];
    }

    let input_kinds = [
        SectionKind::Text,
        SectionKind::ReadOnlyData,
        SectionKind::Data,
        SectionKind::ThreadVars,
        SectionKind::ThreadData,
        SectionKind::ThreadBss,
        SectionKind::Bss,
    ];
    for kind in input_kinds {
        let mut section = MergedSection::new(kind, output_name(kind, format));
        for (object_index, object) in objects.iter().enumerate() {
            for (section_index, input) in object.sections.iter().enumerate() {
                if input.kind != kind {
                    continue;
                }
                let cursor = align_up(section.size, input.align.max(1));
                if !kind.is_zero_fill() {
                    let Some(content) = input.content.as_ref() else {
                        errors.push(Error::InvalidSection {
                            object: object_index,
                            section: section_index,
                        });
                        continue;
                    };
                    section.data.resize(cursor as usize, 0);
                    section.data.extend_from_slice(content);
                }
                section.contributions.push(Contribution {
                    object: object_index,
                    section: section_index,
                    offset: cursor,
                    size: input.size,
                });
                section.size = cursor + input.size;
                section.align = section.align.max(input.align);
                section.flags |= input.flags;
            }
        }
        if !section.contributions.is_empty() {
            merged.push(section);
        }
    }

    if stub_count > 0 {
        let mut stubs = MergedSection::new(SectionKind::Stubs, output_name(SectionKind::Stubs, format));
        stubs.size = stub_count as u64 * crate::arch::aarch64::STUB_SIZE;
        stubs.align = 4;
        stubs.flags = SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE;
        stubs.data = vec![0; stubs.size as usize];
        merged.push(stubs);
    }
    if got_count > 0 {
        let mut got = MergedSection::new(SectionKind::Got, output_name(SectionKind::Got, format));
        got.size = got_count as u64 * 8;
        got.align = 8;
        got.flags = SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE;
        got.data = vec![0; got.size as usize];
        merged.push(got);
    }

    merged.sort_by_key(|section| section.kind.canonical_rank());

    if errors.is_empty() {
        Ok(merged)
    } else {
        Err(errors)
    }
}

/// Assign virtual addresses to the merged sections and populate every
/// object's per-section base addresses
///
/// `text_start` is the finalized address of the first text byte: the base
/// plus one page for ELF, or the base plus the header-and-load-commands
/// padding for Mach-O. Segment boundaries round up to the platform page
/// size; within a segment the canonical per-kind alignments apply.
pub fn assign_addresses(
    merged: &mut [MergedSection],
    objects: &mut [Object],
    format: Format,
    text_start: u64,
) {
    let page = page_size(format);
    let mut cursor = text_start;
    let mut in_data_segment = false;
    let mut in_zero_fill = false;

    for section in merged.iter_mut() {
        cursor = match section.kind {
            SectionKind::Text => align_up(cursor, section.align.max(1)),
            SectionKind::ReadOnlyData => align_up(cursor, section.align.max(8)),
            SectionKind::Stubs => align_up(cursor, 4),
            // The GOT opens its own read-only data segment on a page
            // boundary.
            SectionKind::Got => align_up(cursor, page),
            SectionKind::Data | SectionKind::ThreadVars | SectionKind::ThreadData => {
                let aligned = if in_data_segment {
                    align_up(cursor, section.align.max(8))
                } else {
                    align_up(cursor, page)
                };
                in_data_segment = true;
                aligned
            }
            SectionKind::ThreadBss | SectionKind::Bss => {
                // ELF gives the zero-fill range its own load segment; the
                // Mach-O data segment carries it as trailing vm space.
                let aligned = match format {
                    Format::Elf if !in_zero_fill => align_up(cursor, page),
                    _ if !in_data_segment => align_up(cursor, page),
                    _ => align_up(cursor, section.align.max(8)),
                };
                in_data_segment = true;
                in_zero_fill = true;
                aligned
            }
            SectionKind::Unknown => cursor,
        };
        section.vaddr = cursor;
        cursor += section.size;
        debug!(
            "placed {} at {:#x}..{:#x}",
            section.name,
            section.vaddr,
            section.vaddr + section.size
        );

        for contribution in &section.contributions {
            objects[contribution.object].section_bases[contribution.section] =
                Some(section.vaddr + contribution.offset);
        }
    }
}

/// Finalize the address of every defined symbol
///
/// Runs after address assignment and before any consumer of symbol
/// addresses. Absolute and common symbols keep their declared value;
/// symbols in unplaced (debug) sections stay unaddressed.
pub fn finalize_symbols(objects: &mut [Object]) -> Vec<Error> {
    let mut errors = Vec::new();
    for (object_index, object) in objects.iter_mut().enumerate() {
        let bases = object.section_bases.clone();
        let kinds: Vec<SectionKind> = object.sections.iter().map(|s| s.kind).collect();
        for symbol in object.symbols.iter_mut() {
            if !symbol.is_defined {
                continue;
            }
            match symbol.section {
                Some(section) => match bases.get(section).copied().flatten() {
                    Some(base) => symbol.final_address = Some(base + symbol.value),
                    None => {
                        if kinds.get(section) != Some(&SectionKind::Unknown) {
                            errors.push(Error::InvalidSection {
                                object: object_index,
                                section,
                            });
                        }
                    }
                },
                // Absolute and common symbols retain their declared value.
                None => symbol.final_address = Some(symbol.value),
            }
        }
    }
    errors
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{Machine, Section, Symbol, SymbolBinding, SymbolKind};

    fn text_section(object: usize, size: u64, align: u64) -> Section {
        Section::builder()
            .name(".text")
            .kind(SectionKind::Text)
            .size(size)
            .align(align)
            .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
            .content(vec![0x90; size as usize])
            .object(object)
            .build()
    }

    fn bss_section(object: usize, size: u64, align: u64) -> Section {
        Section::builder()
            .name(".bss")
            .kind(SectionKind::Bss)
            .size(size)
            .align(align)
            .flags(SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE)
            .object(object)
            .build()
    }

    fn object(name: &str, sections: Vec<Section>) -> Object {
        Object::builder()
            .name(name)
            .format(Format::Elf)
            .machine(Machine::X86_64)
            .sections(sections)
            .build()
    }

    #[test]
    fn test_merge_aligns_contributions() {
        let mut objects = vec![
            object("a.o", vec![text_section(0, 6, 4)]),
            object("b.o", vec![text_section(1, 8, 16)]),
        ];
        let merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assert_eq!(merged.len(), 1);
        let text = &merged[0];
        assert_eq!(text.contributions[0].offset, 0);
        // The second contributor starts at the next 16-byte boundary.
        assert_eq!(text.contributions[1].offset, 16);
        assert_eq!(text.size, 24);
        assert_eq!(text.align, 16);
        assert_eq!(text.data.len(), 24);
        // Inter-contribution padding is zero-filled.
        assert_eq!(&text.data[6..16], &[0; 10]);
    }

    #[test]
    fn test_merge_rejects_missing_content() {
        let mut objects = vec![object(
            "a.o",
            vec![Section::builder()
                .name(".text")
                .kind(SectionKind::Text)
                .size(4)
                .build()],
        )];
        let errors = merge(&mut objects, Format::Elf, 0, 0).unwrap_err();
        assert_eq!(
            errors,
            vec![Error::InvalidSection {
                object: 0,
                section: 0
            }]
        );
    }

    #[test]
    fn test_canonical_order_and_monotonic_addresses() {
        let mut objects = vec![object(
            "a.o",
            vec![
                bss_section(0, 32, 8),
                text_section(0, 16, 4),
                Section::builder()
                    .name(".data")
                    .kind(SectionKind::Data)
                    .size(8)
                    .align(8)
                    .flags(SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE)
                    .content(vec![1; 8])
                    .object(0)
                    .build(),
            ],
        )];
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_BASE + ELF_PAGE_SIZE);
        let kinds: Vec<SectionKind> = merged.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![SectionKind::Text, SectionKind::Data, SectionKind::Bss]
        );
        let mut last = 0;
        for section in &merged {
            assert!(section.vaddr >= last);
            last = section.vaddr + section.size;
        }
        // Data opens a fresh page-aligned segment, bss another.
        assert_eq!(merged[1].vaddr % ELF_PAGE_SIZE, 0);
        assert_eq!(merged[2].vaddr % ELF_PAGE_SIZE, 0);
    }

    #[test]
    fn test_macho_got_on_page_boundary() {
        let mut objects = vec![object("a.o", vec![text_section(0, 20, 4)])];
        let mut merged = merge(&mut objects, Format::MachO, 2, 3).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x500);
        let stubs = merged
            .iter()
            .find(|m| m.kind == SectionKind::Stubs)
            .unwrap();
        let got = merged.iter().find(|m| m.kind == SectionKind::Got).unwrap();
        assert_eq!(stubs.size, 24);
        assert_eq!(got.size, 24);
        assert_eq!(got.vaddr % MACHO_PAGE_SIZE, 0);
        assert!(got.vaddr >= stubs.vaddr + stubs.size);
    }

    #[test]
    fn test_section_bases_and_symbol_finalization() {
        let mut objects = vec![
            object(
                "a.o",
                vec![{
                    let mut section = text_section(0, 6, 4);
                    section.name = ".text".into();
                    section
                }],
            ),
            object("b.o", vec![text_section(1, 8, 16)]),
        ];
        objects[1].symbols.push(
            Symbol::builder()
                .name("_helper")
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .section(0)
                .value(4)
                .is_defined(true)
                .build(),
        );
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_BASE + ELF_PAGE_SIZE);
        let errors = finalize_symbols(&mut objects);
        assert!(errors.is_empty());

        let text = &merged[0];
        assert_eq!(objects[0].base_of(0), Some(text.vaddr));
        assert_eq!(objects[1].base_of(0), Some(text.vaddr + 16));
        // final_address == section_bases[k] + value
        assert_eq!(
            objects[1].symbols[0].final_address,
            Some(objects[1].base_of(0).unwrap() + 4)
        );
        let address = objects[1].symbols[0].final_address.unwrap();
        assert!(text.contains(address));
    }

    #[test]
    fn test_absolute_symbol_keeps_value() {
        let mut objects = vec![object("a.o", vec![])];
        objects[0].symbols.push(
            Symbol::builder()
                .name("_absolute")
                .binding(SymbolBinding::Global)
                .value(0xdead)
                .is_defined(true)
                .build(),
        );
        let errors = finalize_symbols(&mut objects);
        assert!(errors.is_empty());
        assert_eq!(objects[0].symbols[0].final_address, Some(0xdead));
    }
}
