//! Relocation processing
//!
//! A pure fold over every relocation of every object: resolve the target
//! address, compute the patch value from (S, A, P), range-check it against
//! the kind's field width, and patch the correct bits of the correct word
//! in the merged section payload. External Mach-O calls and GOT references
//! are redirected through their stub or GOT slot. The fold collects
//! errors; a non-empty error vector fails the overall link.

use log::debug;

use crate::arch::{aarch64, x86_64, PatchError};
use crate::base::{
    Format, MergedSection, Object, Relocation, RelocationKind, RelocationTarget, Resolution,
    SectionKind,
};
use crate::dynlink::DynLinkPlan;
use crate::error::Error;
use crate::resolve::SymbolDirectory;

/// An address slot the dynamic loader fixes up with a runtime symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRelocation {
    /// The virtual address of the 8-byte slot
    pub address: u64,
    /// The runtime symbol whose address the loader stores there
    pub symbol: String,
}

/// Everything the fold reads besides the objects themselves
#[derive(Debug)]
pub struct RelocationContext<'a> {
    /// The output container format
    pub format: Format,
    /// The global symbol directory from resolution
    pub directory: &'a SymbolDirectory,
    /// The stub and GOT slot assignment (empty for ELF)
    pub plan: &'a DynLinkPlan,
    /// The finalized stubs section address, when stubs exist
    pub stubs_vaddr: Option<u64>,
    /// The finalized GOT section address, when GOT slots exist
    pub got_vaddr: Option<u64>,
    /// Verbose per-site traces for GOT and stub references
    pub got_debug: bool,
    /// Verbose per-site traces for thread-local references
    pub tlv_debug: bool,
}

/// The resolved target of one relocation
enum Target {
    /// A concrete address to compute with
    Address(u64),
    /// An 8-byte slot the loader fills; the addend is stored as-is
    External(String),
    /// Nothing to patch (resolver already reported, or NONE kind)
    Skip,
}

/// Apply every relocation of every object to the merged section payloads
pub fn process(
    objects: &[Object],
    merged: &mut [MergedSection],
    context: &RelocationContext,
) -> (Vec<ExternalRelocation>, Vec<Error>) {
    let mut externals = Vec::new();
    let mut errors = Vec::new();

    for (object_index, object) in objects.iter().enumerate() {
        for relocation in &object.relocations {
            if relocation.kind == RelocationKind::None {
                continue;
            }
            let Some(source) = object.sections.get(relocation.section) else {
                errors.push(Error::InvalidSection {
                    object: object_index,
                    section: relocation.section,
                });
                continue;
            };
            // Debug and metadata sections are never placed or relocated.
            if source.kind == SectionKind::Unknown {
                continue;
            }
            let Some(source_base) = object.base_of(relocation.section) else {
                errors.push(Error::InvalidSection {
                    object: object_index,
                    section: relocation.section,
                });
                continue;
            };
            let place = source_base + relocation.offset;

            let symbol_name = symbol_name_of(object, relocation);
            let target = match resolve_target(objects, object, object_index, relocation, context) {
                Ok(target) => target,
                Err(error) => {
                    errors.push(error);
                    continue;
                }
            };

            let kind_rank = source.kind.canonical_rank();
            let Some(section) = merged
                .iter_mut()
                .find(|candidate| candidate.kind.canonical_rank() == kind_rank)
            else {
                errors.push(Error::InvalidSection {
                    object: object_index,
                    section: relocation.section,
                });
                continue;
            };

            match target {
                Target::Skip => continue,
                Target::External(symbol) => {
                    // The loader adds the runtime symbol's address to the
                    // stored addend; record the slot for LC_DYSYMTAB.
                    if let Err(problem) = patch_site(
                        section,
                        place,
                        RelocationKind::Arm64Abs64,
                        relocation.addend,
                        place,
                    ) {
                        errors.push(lift_patch_error(
                            problem, relocation, object_index, &symbol_name,
                        ));
                        continue;
                    }
                    externals.push(ExternalRelocation {
                        address: place,
                        symbol,
                    });
                }
                Target::Address(target_address) => {
                    let value = compute_value(relocation, target_address, place);
                    trace_site(context, relocation, &symbol_name, target_address, place, value);
                    if let Err(problem) =
                        patch_site(section, place, relocation.kind, value, place)
                    {
                        errors.push(lift_patch_error(
                            problem, relocation, object_index, &symbol_name,
                        ));
                    }
                }
            }
        }
    }

    (externals, errors)
}

/// The symbol name a relocation resolves against, for diagnostics
fn symbol_name_of(object: &Object, relocation: &Relocation) -> Option<String> {
    match relocation.target {
        RelocationTarget::Symbol(index) => {
            object.symbols.get(index).map(|symbol| symbol.name.clone())
        }
        RelocationTarget::Section(_) => None,
    }
}

/// Resolve the address a relocation targets
fn resolve_target(
    objects: &[Object],
    object: &Object,
    object_index: usize,
    relocation: &Relocation,
    context: &RelocationContext,
) -> Result<Target, Error> {
    match relocation.target {
        RelocationTarget::Section(section) => match object.base_of(section) {
            Some(base) => Ok(Target::Address(base)),
            None => {
                if object.sections.get(section).map(|s| s.kind) == Some(SectionKind::Unknown) {
                    Ok(Target::Skip)
                } else {
                    Err(Error::InvalidSection {
                        object: object_index,
                        section,
                    })
                }
            }
        },
        RelocationTarget::Symbol(index) => {
            let Some(symbol) = object.symbols.get(index) else {
                return Err(Error::PatchFailed {
                    kind: relocation.kind,
                    object: object_index,
                    section: relocation.section,
                    offset: relocation.offset,
                });
            };
            if symbol.is_defined {
                return match symbol.final_address {
                    Some(address) => Ok(Target::Address(address)),
                    None => Err(Error::PatchFailed {
                        kind: relocation.kind,
                        object: object_index,
                        section: relocation.section,
                        offset: relocation.offset,
                    }),
                };
            }
            match symbol.resolution {
                Resolution::Defined(_) => {
                    let Some(definition) = context.directory.get(&symbol.name) else {
                        return Err(Error::UndefinedSymbol {
                            name: symbol.name.clone(),
                            object: object_index,
                        });
                    };
                    match objects[definition.object].symbols[definition.symbol].final_address {
                        Some(address) => Ok(Target::Address(address)),
                        None => Err(Error::PatchFailed {
                            kind: relocation.kind,
                            object: object_index,
                            section: relocation.section,
                            offset: relocation.offset,
                        }),
                    }
                }
                Resolution::Runtime => runtime_target(symbol.name.clone(), relocation, context)
                    .ok_or(Error::UndefinedSymbol {
                        name: symbol.name.clone(),
                        object: object_index,
                    }),
                // The resolver already reported this reference.
                Resolution::Unresolved => Ok(Target::Skip),
            }
        }
    }
}

/// The address (stub, GOT slot) or slot role of a runtime-bound reference
fn runtime_target(
    name: String,
    relocation: &Relocation,
    context: &RelocationContext,
) -> Option<Target> {
    if context.format != Format::MachO {
        return None;
    }
    if relocation.kind.wants_stub() {
        let index = context.plan.stub_index(&name)?;
        let base = context.stubs_vaddr?;
        return Some(Target::Address(base + index as u64 * aarch64::STUB_SIZE));
    }
    if relocation.kind.wants_got() {
        let index = context.plan.got_index(&name)?;
        let base = context.got_vaddr?;
        return Some(Target::Address(base + index as u64 * 8));
    }
    if relocation.kind == RelocationKind::Arm64Abs64 {
        return Some(Target::External(name));
    }
    None
}

/// Compute the numeric patch value for one relocation
fn compute_value(relocation: &Relocation, target: u64, place: u64) -> i64 {
    let s = target as i64;
    let a = relocation.addend;
    match relocation.kind {
        RelocationKind::X64Abs64
        | RelocationKind::Arm64Abs64
        | RelocationKind::Arm64AdrPrelPgHi21
        | RelocationKind::Arm64AddAbsLo12Nc
        | RelocationKind::Arm64Ldst64AbsLo12Nc
        | RelocationKind::Arm64GotLoadPage21
        | RelocationKind::Arm64GotLoadPageOff12
        | RelocationKind::Arm64TlvpLoadPage21
        | RelocationKind::Arm64TlvpLoadPageOff12 => s.wrapping_add(a),
        RelocationKind::X64Pc32
        | RelocationKind::X64Plt32
        | RelocationKind::X64GotPcRel
        | RelocationKind::Arm64Call26
        | RelocationKind::Arm64Jump26 => s.wrapping_add(a).wrapping_sub(place as i64),
        RelocationKind::None => 0,
    }
}

/// Patch `value` into the merged payload at the finalized address `place`
fn patch_site(
    section: &mut MergedSection,
    place: u64,
    kind: RelocationKind,
    value: i64,
    pc: u64,
) -> Result<(), PatchError> {
    if !section.contains(place) {
        return Err(PatchError::OutOfBounds);
    }
    if section.kind.is_zero_fill() {
        return Err(PatchError::OutOfBounds);
    }
    let offset = (place - section.vaddr) as usize;
    let data = section.data.as_mut_slice();
    match kind {
        RelocationKind::X64Abs64 => x86_64::patch_imm64(data, offset, value),
        RelocationKind::Arm64Abs64 => aarch64::patch_abs64(data, offset, value),
        RelocationKind::X64Pc32 | RelocationKind::X64Plt32 | RelocationKind::X64GotPcRel => {
            x86_64::patch_rel32(data, offset, value)
        }
        RelocationKind::Arm64Call26 | RelocationKind::Arm64Jump26 => {
            aarch64::patch_branch26(data, offset, value)
        }
        RelocationKind::Arm64AdrPrelPgHi21
        | RelocationKind::Arm64GotLoadPage21
        | RelocationKind::Arm64TlvpLoadPage21 => {
            aarch64::patch_adrp(data, offset, value as u64, pc)
        }
        RelocationKind::Arm64AddAbsLo12Nc => aarch64::patch_add_imm12(data, offset, value as u64),
        RelocationKind::Arm64GotLoadPageOff12 | RelocationKind::Arm64Ldst64AbsLo12Nc => {
            aarch64::patch_ldr_imm12_scaled(data, offset, value as u64)
        }
        RelocationKind::Arm64TlvpLoadPageOff12 => {
            // The thread-local sequence ends in either an ADD or a load.
            if aarch64::is_ldst64_imm(data, offset) {
                aarch64::patch_ldr_imm12_scaled(data, offset, value as u64)
            } else {
                aarch64::patch_add_imm12(data, offset, value as u64)
            }
        }
        RelocationKind::None => Ok(()),
    }
}

/// Lift an encoder rejection into a linker error with site context
fn lift_patch_error(
    problem: PatchError,
    relocation: &Relocation,
    object_index: usize,
    symbol_name: &Option<String>,
) -> Error {
    match problem {
        PatchError::Overflow { value } => Error::RangeOverflow {
            value,
            kind: relocation.kind,
            symbol: symbol_name.clone(),
            object: object_index,
            section: relocation.section,
            offset: relocation.offset,
        },
        PatchError::Misaligned { value, required } => Error::Alignment { value, required },
        PatchError::OutOfBounds => Error::PatchFailed {
            kind: relocation.kind,
            object: object_index,
            section: relocation.section,
            offset: relocation.offset,
        },
    }
}

/// Per-site trace output under the GOT and TLV debug toggles
fn trace_site(
    context: &RelocationContext,
    relocation: &Relocation,
    symbol_name: &Option<String>,
    target: u64,
    place: u64,
    value: i64,
) {
    let traced = match relocation.kind {
        RelocationKind::Arm64GotLoadPage21
        | RelocationKind::Arm64GotLoadPageOff12
        | RelocationKind::Arm64Call26
        | RelocationKind::Arm64Jump26 => context.got_debug,
        RelocationKind::Arm64TlvpLoadPage21 | RelocationKind::Arm64TlvpLoadPageOff12 => {
            context.tlv_debug
        }
        _ => false,
    };
    if traced {
        debug!(
            "{:?} {} S={target:#x} P={place:#x} value={value:#x}",
            relocation.kind,
            symbol_name.as_deref().unwrap_or("<section>"),
        );
    }
}

#[allow(clippy::unwrap_used, clippy::panic)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{
        Machine, Section, SectionFlags, Symbol, SymbolBinding, SymbolKind,
    };
    use crate::layout::{assign_addresses, finalize_symbols, merge, ELF_BASE, ELF_PAGE_SIZE, MACHO_BASE};
    use crate::resolve::resolve;

    fn empty_context<'a>(
        format: Format,
        directory: &'a SymbolDirectory,
        plan: &'a DynLinkPlan,
    ) -> RelocationContext<'a> {
        RelocationContext {
            format,
            directory,
            plan,
            stubs_vaddr: None,
            got_vaddr: None,
            got_debug: false,
            tlv_debug: false,
        }
    }

    fn text_object(name: &str, machine: Machine, content: Vec<u8>) -> Object {
        let format = match machine {
            Machine::X86_64 => Format::Elf,
            Machine::Arm64 => Format::MachO,
        };
        Object::builder()
            .name(name)
            .format(format)
            .machine(machine)
            .sections(vec![Section::builder()
                .name(".text")
                .kind(SectionKind::Text)
                .size(content.len() as u64)
                .align(4)
                .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
                .content(content)
                .build()])
            .build()
    }

    fn func(name: &str, value: u64) -> Symbol {
        Symbol::builder()
            .name(name)
            .kind(SymbolKind::Func)
            .binding(SymbolBinding::Global)
            .section(0)
            .value(value)
            .is_defined(true)
            .build()
    }

    #[test]
    fn test_call_between_objects() {
        // a.o: bl _helper at offset 0; b.o: _helper at offset 0
        let mut caller = text_object("a.o", Machine::Arm64, 0x9400_0000u32.to_le_bytes().to_vec());
        caller.symbols = vec![func("_main", 0), Symbol::builder().name("_helper").build()];
        caller.relocations = vec![Relocation::builder()
            .offset(0)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::Arm64Call26)
            .build()];
        let mut callee = text_object("b.o", Machine::Arm64, 0xD65F_03C0u32.to_le_bytes().to_vec());
        callee.symbols = vec![func("_helper", 0)];

        let mut objects = vec![caller, callee];
        let (directory, errors) = resolve(&mut objects);
        assert!(errors.is_empty());
        let mut merged = merge(&mut objects, Format::MachO, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x1000);
        assert!(finalize_symbols(&mut objects).is_empty());

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::MachO, &directory, &plan);
        let (externals, errors) = process(&objects, &mut merged, &context);
        assert!(externals.is_empty());
        assert!(errors.is_empty());

        let helper = objects[1].symbols[0].final_address.unwrap();
        let place = objects[0].base_of(0).unwrap();
        let word = u32::from_le_bytes(merged[0].data[0..4].try_into().unwrap());
        let displacement = ((helper as i64 - place as i64) >> 2) as u32 & 0x03FF_FFFF;
        assert_eq!(word, 0x9400_0000 | displacement);
    }

    #[test]
    fn test_x64_pc32_value() {
        // call at offset 2, displacement at offset 3, addend -4
        let mut code = vec![0x31, 0xED, 0xE8, 0, 0, 0, 0];
        code.extend_from_slice(&[0x0F, 0x05]);
        let mut caller = text_object("a.o", Machine::X86_64, code);
        caller.symbols = vec![func("main", 0), Symbol::builder().name("_helper").build()];
        caller.relocations = vec![Relocation::builder()
            .offset(3)
            .addend(-4)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::X64Pc32)
            .build()];
        let mut callee = text_object("b.o", Machine::X86_64, vec![0xC3]);
        callee.symbols = vec![func("_helper", 0)];

        let mut objects = vec![caller, callee];
        let (directory, _) = resolve(&mut objects);
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_BASE + ELF_PAGE_SIZE);
        finalize_symbols(&mut objects);

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::Elf, &directory, &plan);
        let (_, errors) = process(&objects, &mut merged, &context);
        assert!(errors.is_empty());

        let helper = objects[1].symbols[0].final_address.unwrap();
        let place = objects[0].base_of(0).unwrap() + 3;
        let stored = i32::from_le_bytes(merged[0].data[3..7].try_into().unwrap());
        // S + A - P with A = -4 is the displacement from the end of the
        // 4-byte field.
        assert_eq!(i64::from(stored), helper as i64 - (place as i64 + 4));
    }

    #[test]
    fn test_adrp_add_pair_against_rodata() {
        // adrp x0, _msg@PAGE; add x0, x0, _msg@PAGEOFF
        let mut code = 0x9000_0000u32.to_le_bytes().to_vec();
        code.extend_from_slice(&0x9100_0000u32.to_le_bytes());
        let mut object = text_object("a.o", Machine::Arm64, code);
        object.sections.push(
            Section::builder()
                .name("__cstring")
                .kind(SectionKind::ReadOnlyData)
                .size(16)
                .align(8)
                .flags(SectionFlags::ALLOCATABLE)
                .content(vec![0x41; 16])
                .build(),
        );
        object.symbols = vec![func("_main", 0), {
            let mut message = func("_msg", 5);
            message.section = Some(1);
            message.kind = SymbolKind::Object;
            message
        }];
        object.relocations = vec![
            Relocation::builder()
                .offset(0)
                .target(RelocationTarget::Symbol(1))
                .section(0)
                .kind(RelocationKind::Arm64AdrPrelPgHi21)
                .build(),
            Relocation::builder()
                .offset(4)
                .target(RelocationTarget::Symbol(1))
                .section(0)
                .kind(RelocationKind::Arm64AddAbsLo12Nc)
                .build(),
        ];

        let mut objects = vec![object];
        let (directory, _) = resolve(&mut objects);
        let mut merged = merge(&mut objects, Format::MachO, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x1000);
        finalize_symbols(&mut objects);

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::MachO, &directory, &plan);
        let (_, errors) = process(&objects, &mut merged, &context);
        assert!(errors.is_empty());

        let message = objects[0].symbols[1].final_address.unwrap();
        let place = objects[0].base_of(0).unwrap();
        let adrp = u32::from_le_bytes(merged[0].data[0..4].try_into().unwrap());
        let add = u32::from_le_bytes(merged[0].data[4..8].try_into().unwrap());
        let delta = ((message >> 12) as i64 - (place >> 12) as i64) as u32;
        assert_eq!((adrp >> 29) & 0x3, delta & 0x3);
        assert_eq!((adrp >> 5) & 0x7_FFFF, (delta >> 2) & 0x7_FFFF);
        assert_eq!((add >> 10) & 0xFFF, (message & 0xFFF) as u32);
    }

    #[test]
    fn test_call26_overflow_is_fatal() {
        let mut caller = text_object("a.o", Machine::Arm64, 0x9400_0000u32.to_le_bytes().to_vec());
        caller.symbols = vec![func("_main", 0), Symbol::builder().name("_far").build()];
        caller.relocations = vec![Relocation::builder()
            .offset(0)
            // Push the displacement past +-128 MiB.
            .addend(1 << 30)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::Arm64Call26)
            .build()];
        let mut callee = text_object("b.o", Machine::Arm64, vec![0; 4]);
        callee.symbols = vec![func("_far", 0)];

        let mut objects = vec![caller, callee];
        let (directory, _) = resolve(&mut objects);
        let mut merged = merge(&mut objects, Format::MachO, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x1000);
        finalize_symbols(&mut objects);

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::MachO, &directory, &plan);
        let (_, errors) = process(&objects, &mut merged, &context);
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            Error::RangeOverflow {
                kind,
                symbol,
                object,
                offset,
                ..
            } => {
                assert_eq!(*kind, RelocationKind::Arm64Call26);
                assert_eq!(symbol.as_deref(), Some("_far"));
                assert_eq!(*object, 0);
                assert_eq!(*offset, 0);
            }
            other => panic!("expected RangeOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_external_call_goes_through_stub() {
        let mut caller = text_object("a.o", Machine::Arm64, 0x9400_0000u32.to_le_bytes().to_vec());
        caller.symbols = vec![func("_main", 0), Symbol::builder().name("_printf").build()];
        caller.relocations = vec![Relocation::builder()
            .offset(0)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::Arm64Call26)
            .build()];

        let mut objects = vec![caller];
        let (directory, errors) = resolve(&mut objects);
        assert!(errors.is_empty());
        let plan = crate::dynlink::plan(&objects);
        assert_eq!(plan.stub_count(), 1);

        let mut merged = merge(&mut objects, Format::MachO, plan.stub_count(), plan.got_count())
            .unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x1000);
        finalize_symbols(&mut objects);
        let stubs_vaddr = merged
            .iter()
            .find(|m| m.kind == SectionKind::Stubs)
            .unwrap()
            .vaddr;
        let got_vaddr = merged
            .iter()
            .find(|m| m.kind == SectionKind::Got)
            .unwrap()
            .vaddr;

        let context = RelocationContext {
            format: Format::MachO,
            directory: &directory,
            plan: &plan,
            stubs_vaddr: Some(stubs_vaddr),
            got_vaddr: Some(got_vaddr),
            got_debug: false,
            tlv_debug: false,
        };
        let (_, errors) = process(&objects, &mut merged, &context);
        assert!(errors.is_empty());

        let place = objects[0].base_of(0).unwrap();
        let word = u32::from_le_bytes(merged[0].data[0..4].try_into().unwrap());
        let displacement = ((stubs_vaddr as i64 - place as i64) >> 2) as u32 & 0x03FF_FFFF;
        assert_eq!(word, 0x9400_0000 | displacement);
    }

    #[test]
    fn test_abs64_against_runtime_symbol_is_external() {
        let mut object = text_object("a.o", Machine::Arm64, vec![0; 4]);
        object.sections.push(
            Section::builder()
                .name("__data")
                .kind(SectionKind::Data)
                .size(8)
                .align(8)
                .flags(SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE)
                .content(vec![0; 8])
                .build(),
        );
        object.symbols = vec![func("_main", 0), Symbol::builder().name("_malloc").build()];
        object.relocations = vec![Relocation::builder()
            .offset(0)
            .addend(16)
            .target(RelocationTarget::Symbol(1))
            .section(1)
            .kind(RelocationKind::Arm64Abs64)
            .build()];

        let mut objects = vec![object];
        let (directory, _) = resolve(&mut objects);
        let mut merged = merge(&mut objects, Format::MachO, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::MachO, MACHO_BASE + 0x1000);
        finalize_symbols(&mut objects);

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::MachO, &directory, &plan);
        let (externals, errors) = process(&objects, &mut merged, &context);
        assert!(errors.is_empty());
        let data = merged
            .iter()
            .find(|m| m.kind == SectionKind::Data)
            .unwrap();
        assert_eq!(
            externals,
            vec![ExternalRelocation {
                address: data.vaddr,
                symbol: "_malloc".into()
            }]
        );
        // The addend stays in the slot for the loader to add to.
        assert_eq!(&data.data[0..8], &16u64.to_le_bytes());
    }

    #[test]
    fn test_section_relative_target() {
        let mut object = text_object("a.o", Machine::X86_64, vec![0u8; 8]);
        object.sections.push(
            Section::builder()
                .name(".rodata")
                .kind(SectionKind::ReadOnlyData)
                .size(4)
                .align(4)
                .flags(SectionFlags::ALLOCATABLE)
                .content(vec![9; 4])
                .build(),
        );
        object.relocations = vec![Relocation::builder()
            .offset(0)
            .addend(2)
            .target(RelocationTarget::Section(1))
            .section(0)
            .kind(RelocationKind::X64Abs64)
            .build()];

        let mut objects = vec![object];
        let (directory, _) = resolve(&mut objects);
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_BASE + ELF_PAGE_SIZE);
        finalize_symbols(&mut objects);

        let plan = DynLinkPlan::default();
        let context = empty_context(Format::Elf, &directory, &plan);
        let (_, errors) = process(&objects, &mut merged, &context);
        assert!(errors.is_empty());

        let rodata_base = objects[0].base_of(1).unwrap();
        let stored = u64::from_le_bytes(merged[0].data[0..8].try_into().unwrap());
        assert_eq!(stored, rodata_base + 2);
    }
}
