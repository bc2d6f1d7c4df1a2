//! Base types for the linker's normalized intermediate representation
//!
//! Readers lower every input format into these structures; all later phases
//! (resolution, layout, relocation, image writing) operate on them
//! exclusively. Objects are inserted once and never structurally mutated
//! afterwards: only `section_bases`, symbol resolutions and final addresses
//! are populated as the pipeline advances.

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// The container format of an input object or output image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Executable and Linkable Format
    Elf,
    /// Mach object format
    MachO,
}

/// The instruction-set architecture of an object or image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    /// AMD64 / Intel 64
    X86_64,
    /// AArch64
    Arm64,
}

/// The normalized type of an input or merged section
///
/// `Stubs` and `Got` never occur in input objects; they name the synthetic
/// Mach-O sections materialized by dynamic-link planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Executable code
    Text,
    /// Read-only data
    ReadOnlyData,
    /// Synthetic external-call trampolines (Mach-O only)
    Stubs,
    /// Synthetic global offset table (Mach-O only)
    Got,
    /// Initialized writable data
    Data,
    /// Thread-local variable descriptors (Mach-O `__thread_vars`)
    ThreadVars,
    /// Initialized thread-local data
    ThreadData,
    /// Zero-initialized thread-local data
    ThreadBss,
    /// Zero-initialized writable data
    Bss,
    /// Debug or metadata content, never placed or relocated
    Unknown,
}

impl SectionKind {
    /// The position of this kind in the canonical merged-section order, or
    /// `None` for kinds that are never placed
    pub fn canonical_rank(&self) -> Option<usize> {
        match self {
            SectionKind::Text => Some(0),
            SectionKind::ReadOnlyData => Some(1),
            SectionKind::Stubs => Some(2),
            SectionKind::Got => Some(3),
            SectionKind::Data => Some(4),
            SectionKind::ThreadVars => Some(5),
            SectionKind::ThreadData => Some(6),
            SectionKind::ThreadBss => Some(7),
            SectionKind::Bss => Some(8),
            SectionKind::Unknown => None,
        }
    }

    /// Whether sections of this kind occupy no bytes in the output file
    pub fn is_zero_fill(&self) -> bool {
        matches!(self, SectionKind::Bss | SectionKind::ThreadBss)
    }

    /// Whether this kind is placed in the executable code segment
    pub fn is_code_segment(&self) -> bool {
        matches!(
            self,
            SectionKind::Text | SectionKind::ReadOnlyData | SectionKind::Stubs
        )
    }
}

bitflags::bitflags! {
    /// Permission and placement flags of a section
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        /// The section is writable at runtime
        const WRITABLE = 1 << 0;
        /// The section occupies memory in the process image
        const ALLOCATABLE = 1 << 1;
        /// The section contains executable instructions
        const EXECUTABLE = 1 << 2;
    }
}

/// A section of an input object
#[derive(Debug, Clone, TypedBuilder)]
pub struct Section {
    /// The section name as spelled in the input
    #[builder(setter(into))]
    pub name: String,
    /// The normalized section type
    pub kind: SectionKind,
    /// The section size in bytes
    #[builder(default)]
    pub size: u64,
    /// The required alignment, a power of two
    #[builder(default = 1)]
    pub align: u64,
    /// Permission and placement flags
    #[builder(default)]
    pub flags: SectionFlags,
    /// The section payload; `None` iff the kind is zero-fill
    #[builder(default, setter(strip_option))]
    pub content: Option<Vec<u8>>,
    /// Index of the owning object
    #[builder(default)]
    pub object: usize,
}

/// The declared type of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// No declared type
    NoType,
    /// A function entry point
    Func,
    /// A data object
    Object,
}

/// The linkage binding of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolBinding {
    /// Visible only within the defining object
    Local,
    /// Participates in global resolution; at most one definition
    Global,
    /// Participates in global resolution; superseded by GLOBAL
    Weak,
}

/// Where an undefined symbol reference was bound during resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    /// Not yet resolved (pre-resolution state)
    #[default]
    Unresolved,
    /// Defined by the object at this index
    Defined(usize),
    /// Provided by the target runtime at load time
    Runtime,
}

/// A symbol of an input object
#[derive(Debug, Clone, TypedBuilder)]
pub struct Symbol {
    /// The symbol name
    #[builder(setter(into))]
    pub name: String,
    /// The declared symbol type
    #[builder(default = SymbolKind::NoType)]
    pub kind: SymbolKind,
    /// The linkage binding
    #[builder(default = SymbolBinding::Local)]
    pub binding: SymbolBinding,
    /// Index of the defining section within the owning object, or `None`
    /// for undefined, absolute and common symbols
    #[builder(default, setter(strip_option))]
    pub section: Option<usize>,
    /// The pre-relocation value: a section-relative offset, or an absolute
    /// value for symbols without a section
    #[builder(default)]
    pub value: u64,
    /// The declared symbol size
    #[builder(default)]
    pub size: u64,
    /// Whether the owning object defines this symbol
    #[builder(default)]
    pub is_defined: bool,
    /// Populated by the resolver for undefined references
    #[builder(default)]
    pub resolution: Resolution,
    /// Populated by address finalization for defined symbols
    #[builder(default)]
    pub final_address: Option<u64>,
}

/// The target a relocation resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationTarget {
    /// The symbol at this index in the owning object's symbol list
    Symbol(usize),
    /// The base address of this section in the owning object
    Section(usize),
}

/// A unified relocation kind, independent of the source format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// x86-64 absolute 64-bit
    X64Abs64,
    /// x86-64 PC-relative 32-bit
    X64Pc32,
    /// x86-64 PC-relative 32-bit via procedure linkage
    X64Plt32,
    /// x86-64 PC-relative 32-bit via the global offset table
    X64GotPcRel,
    /// ARM64 absolute 64-bit
    Arm64Abs64,
    /// ARM64 26-bit branch-and-link displacement
    Arm64Call26,
    /// ARM64 26-bit branch displacement
    Arm64Jump26,
    /// ARM64 ADRP 21-bit signed page delta
    Arm64AdrPrelPgHi21,
    /// ARM64 ADD low 12 bits of the target address
    Arm64AddAbsLo12Nc,
    /// ARM64 64-bit LDR/STR scaled low 12 bits of the target address
    Arm64Ldst64AbsLo12Nc,
    /// ARM64 ADRP page delta to a GOT slot
    Arm64GotLoadPage21,
    /// ARM64 LDR low 12 bits of a GOT slot address
    Arm64GotLoadPageOff12,
    /// ARM64 ADRP page delta to a thread-local descriptor
    Arm64TlvpLoadPage21,
    /// ARM64 low 12 bits of a thread-local descriptor address
    Arm64TlvpLoadPageOff12,
    /// No operation; produced for unknown input types and skipped
    None,
}

impl RelocationKind {
    /// Whether this kind routes an external Mach-O reference through a stub
    pub fn wants_stub(&self) -> bool {
        matches!(self, RelocationKind::Arm64Call26 | RelocationKind::Arm64Jump26)
    }

    /// Whether this kind routes an external Mach-O reference through a GOT
    /// slot
    pub fn wants_got(&self) -> bool {
        matches!(
            self,
            RelocationKind::Arm64GotLoadPage21 | RelocationKind::Arm64GotLoadPageOff12
        )
    }

    /// Whether the computed value is a displacement from the patch site
    pub fn is_pc_relative(&self) -> bool {
        matches!(
            self,
            RelocationKind::X64Pc32
                | RelocationKind::X64Plt32
                | RelocationKind::X64GotPcRel
                | RelocationKind::Arm64Call26
                | RelocationKind::Arm64Jump26
        )
    }
}

/// A pending edit to a section's bytes
#[derive(Debug, Clone, TypedBuilder)]
pub struct Relocation {
    /// The offset of the patch site within the source section
    pub offset: u64,
    /// The constant added to the target address
    #[builder(default)]
    pub addend: i64,
    /// What the relocation resolves against
    pub target: RelocationTarget,
    /// Index of the source section being patched
    pub section: usize,
    /// The unified relocation kind
    pub kind: RelocationKind,
    /// Index of the owning object
    #[builder(default)]
    pub object: usize,
}

/// A parsed input object
#[derive(Debug, Clone, TypedBuilder)]
pub struct Object {
    /// The source file name, for diagnostics
    #[builder(setter(into))]
    pub name: String,
    /// The container format the object was read from
    pub format: Format,
    /// The object's instruction-set architecture
    pub machine: Machine,
    /// The object's sections, in declared order
    #[builder(default)]
    pub sections: Vec<Section>,
    /// The object's symbols, in declared order
    #[builder(default)]
    pub symbols: Vec<Symbol>,
    /// The object's relocations, in declared order
    #[builder(default)]
    pub relocations: Vec<Relocation>,
    /// Per-section virtual base addresses, populated by layout
    #[builder(default)]
    pub section_bases: Vec<Option<u64>>,
}

impl Object {
    /// The finalized virtual base address of a section, if it was placed
    pub fn base_of(&self, section: usize) -> Option<u64> {
        self.section_bases.get(section).copied().flatten()
    }

    /// Turn `(section, offset)` into a finalized virtual address
    pub fn address_of(&self, section: usize, offset: u64) -> Result<u64> {
        self.base_of(section)
            .map(|base| base + offset)
            .ok_or(Error::InvalidSection {
                object: self.sections.get(section).map(|s| s.object).unwrap_or(0),
                section,
            })
    }
}

/// A slice of an input section placed into a merged section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    /// Index of the contributing object
    pub object: usize,
    /// Index of the contributed section within that object
    pub section: usize,
    /// The byte offset of the contribution within the merged section
    pub offset: u64,
    /// The contribution size in bytes
    pub size: u64,
}

/// The concatenation of all same-kinded sections after layout
///
/// Merged sections own their payload buffer and are the canonical target of
/// all subsequent patching.
#[derive(Debug, Clone)]
pub struct MergedSection {
    /// The shared section kind of the contributors
    pub kind: SectionKind,
    /// The output section name
    pub name: String,
    /// The total merged size in bytes
    pub size: u64,
    /// The maximum alignment over all contributors
    pub align: u64,
    /// The OR of all contributor flags
    pub flags: SectionFlags,
    /// The assigned virtual address
    pub vaddr: u64,
    /// The concatenated payload; empty for zero-fill kinds
    pub data: Vec<u8>,
    /// The placed contributions, in object-insertion order
    pub contributions: Vec<Contribution>,
}

impl MergedSection {
    /// Create an empty merged section of `kind` named `name`
    pub fn new(kind: SectionKind, name: impl Into<String>) -> Self {
        MergedSection {
            kind,
            name: name.into(),
            size: 0,
            align: 1,
            flags: SectionFlags::empty(),
            vaddr: 0,
            data: Vec::new(),
            contributions: Vec::new(),
        }
    }

    /// Whether `vaddr` falls within this section's placed range
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr < self.vaddr + self.size
    }
}

/// Round `value` up to the next multiple of `align` (a power of two)
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonical_order() {
        let order = [
            SectionKind::Text,
            SectionKind::ReadOnlyData,
            SectionKind::Stubs,
            SectionKind::Got,
            SectionKind::Data,
            SectionKind::ThreadVars,
            SectionKind::ThreadData,
            SectionKind::ThreadBss,
            SectionKind::Bss,
        ];
        for (expected, kind) in order.iter().enumerate() {
            assert_eq!(kind.canonical_rank(), Some(expected));
        }
        assert_eq!(SectionKind::Unknown.canonical_rank(), None);
    }

    #[test]
    fn test_zero_fill_kinds() {
        assert!(SectionKind::Bss.is_zero_fill());
        assert!(SectionKind::ThreadBss.is_zero_fill());
        assert!(!SectionKind::Data.is_zero_fill());
        assert!(!SectionKind::ThreadData.is_zero_fill());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(0x3fff, 0x4000), 0x4000);
        assert_eq!(align_up(0x4001, 0x4000), 0x8000);
    }

    #[test]
    fn test_section_flags_or() {
        let a = SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE;
        let b = SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE;
        assert_eq!(
            a | b,
            SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE | SectionFlags::WRITABLE
        );
    }

    #[test]
    fn test_address_of_unplaced_section() {
        let object = Object::builder()
            .name("a.o")
            .format(Format::Elf)
            .machine(Machine::X86_64)
            .sections(vec![Section::builder()
                .name(".debug_info")
                .kind(SectionKind::Unknown)
                .build()])
            .section_bases(vec![None])
            .build();
        assert!(object.address_of(0, 0).is_err());
    }

    #[test]
    fn test_merged_section_contains() {
        let mut merged = MergedSection::new(SectionKind::Text, "__text");
        merged.vaddr = 0x1000;
        merged.size = 0x100;
        assert!(merged.contains(0x1000));
        assert!(merged.contains(0x10ff));
        assert!(!merged.contains(0x1100));
        assert!(!merged.contains(0xfff));
    }
}
