//! ELF64 output structures and the ELF image writer
//!
//! The structure definitions (and the relocation-type constants the ELF
//! reader maps from) follow the System V gABI; everything the writer emits
//! is little-endian class 64.

use std::io::Write;

use num_derive::FromPrimitive;

use crate::base::{
    align_up, Machine, MergedSection, Object, SectionFlags, SectionKind, SymbolBinding, SymbolKind,
};
use crate::error::{Error, Result};
use crate::image::{pad_to, StringTable};
use crate::layout::ELF_PAGE_SIZE;
use crate::resolve::SymbolDirectory;
use crate::{HasWrittenSize, ToWriter};

/// The ELF file type
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[non_exhaustive]
pub enum ElfObjectType {
    /// A relocatable object file
    Relocatable = 1,
    /// An executable image
    Executable = 2,
    /// A shared object (also position-independent executables)
    SharedObject = 3,
}

/// The ELF machine tag
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[non_exhaustive]
pub enum ElfMachineType {
    /// AMD64 / Intel 64
    X86_64 = 62,
    /// AArch64
    Aarch64 = 183,
}

impl From<Machine> for ElfMachineType {
    fn from(value: Machine) -> Self {
        match value {
            Machine::X86_64 => ElfMachineType::X86_64,
            Machine::Arm64 => ElfMachineType::Aarch64,
        }
    }
}

/// The type of an ELF section header
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[non_exhaustive]
pub enum ElfSectionType {
    /// Inactive header
    Null = 0,
    /// Program-defined content
    ProgBits = 1,
    /// A symbol table
    SymTab = 2,
    /// A string table
    StrTab = 3,
    /// Relocations with explicit addends
    RelA = 4,
    /// A symbol hash table
    Hash = 5,
    /// Dynamic-linking information
    Dynamic = 6,
    /// A note section
    Note = 7,
    /// Zero-fill content occupying no file space
    NoBits = 8,
    /// Relocations without explicit addends
    Rel = 9,
}

/// `SHF_WRITE`
pub const SHF_WRITE: u64 = 1 << 0;
/// `SHF_ALLOC`
pub const SHF_ALLOC: u64 = 1 << 1;
/// `SHF_EXECINSTR`
pub const SHF_EXECINSTR: u64 = 1 << 2;
/// `SHF_TLS`
pub const SHF_TLS: u64 = 1 << 10;

/// `PT_LOAD`
pub const PT_LOAD: u32 = 1;
/// `PT_PHDR`
pub const PT_PHDR: u32 = 6;
/// `PF_X`
pub const PF_X: u32 = 1 << 0;
/// `PF_W`
pub const PF_W: u32 = 1 << 1;
/// `PF_R`
pub const PF_R: u32 = 1 << 2;

/// `STB_LOCAL`
pub const STB_LOCAL: u8 = 0;
/// `STB_GLOBAL`
pub const STB_GLOBAL: u8 = 1;
/// `STB_WEAK`
pub const STB_WEAK: u8 = 2;
/// `STT_NOTYPE`
pub const STT_NOTYPE: u8 = 0;
/// `STT_OBJECT`
pub const STT_OBJECT: u8 = 1;
/// `STT_FUNC`
pub const STT_FUNC: u8 = 2;
/// `STT_SECTION`
pub const STT_SECTION: u8 = 3;
/// `SHN_UNDEF`
pub const SHN_UNDEF: u16 = 0;
/// `SHN_ABS`
pub const SHN_ABS: u16 = 0xFFF1;

/// `R_X86_64_64`
pub const R_X86_64_64: u32 = 1;
/// `R_X86_64_PC32`
pub const R_X86_64_PC32: u32 = 2;
/// `R_X86_64_PLT32`
pub const R_X86_64_PLT32: u32 = 4;
/// `R_X86_64_GOTPCREL`
pub const R_X86_64_GOTPCREL: u32 = 9;
/// `R_X86_64_GOTPCRELX`
pub const R_X86_64_GOTPCRELX: u32 = 41;
/// `R_X86_64_REX_GOTPCRELX`
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

/// `R_AARCH64_ABS64`
pub const R_AARCH64_ABS64: u32 = 257;
/// `R_AARCH64_ADR_PREL_PG_HI21`
pub const R_AARCH64_ADR_PREL_PG_HI21: u32 = 275;
/// `R_AARCH64_ADD_ABS_LO12_NC`
pub const R_AARCH64_ADD_ABS_LO12_NC: u32 = 277;
/// `R_AARCH64_JUMP26`
pub const R_AARCH64_JUMP26: u32 = 282;
/// `R_AARCH64_CALL26`
pub const R_AARCH64_CALL26: u32 = 283;
/// `R_AARCH64_LDST64_ABS_LO12_NC`
pub const R_AARCH64_LDST64_ABS_LO12_NC: u32 = 286;
/// `R_AARCH64_ADR_GOT_PAGE`
pub const R_AARCH64_ADR_GOT_PAGE: u32 = 311;
/// `R_AARCH64_LD64_GOT_LO12_NC`
pub const R_AARCH64_LD64_GOT_LO12_NC: u32 = 312;

/// The ELF64 file header
#[derive(Debug, Clone)]
pub struct ElfFileHeader {
    /// The object file type
    pub r#type: ElfObjectType,
    /// The machine tag
    pub machine: ElfMachineType,
    /// The entry-point virtual address
    pub entry: u64,
    /// The program-header table file offset
    pub phoff: u64,
    /// The section-header table file offset
    pub shoff: u64,
    /// The number of program headers
    pub phnum: u16,
    /// The number of section headers
    pub shnum: u16,
    /// The section-name string table index
    pub shstrndx: u16,
}

impl<W> ToWriter<W> for ElfFileHeader
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        // e_ident: magic, ELFCLASS64, ELFDATA2LSB, EV_CURRENT, SysV ABI
        writer.write_all(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0])?;
        writer.write_all(&(self.r#type as u16).to_le_bytes())?;
        writer.write_all(&(self.machine as u16).to_le_bytes())?;
        writer.write_all(&1u32.to_le_bytes())?;
        writer.write_all(&self.entry.to_le_bytes())?;
        writer.write_all(&self.phoff.to_le_bytes())?;
        writer.write_all(&self.shoff.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u16).to_le_bytes())?;
        writer.write_all(&(ElfProgramHeader::SIZE as u16).to_le_bytes())?;
        writer.write_all(&self.phnum.to_le_bytes())?;
        writer.write_all(&(ElfSectionHeader::SIZE as u16).to_le_bytes())?;
        writer.write_all(&self.shnum.to_le_bytes())?;
        writer.write_all(&self.shstrndx.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for ElfFileHeader {
    const SIZE: usize = 64;
}

/// An ELF64 program header
#[derive(Debug, Clone, Copy)]
pub struct ElfProgramHeader {
    /// The segment type
    pub r#type: u32,
    /// The segment permission flags
    pub flags: u32,
    /// The segment file offset
    pub offset: u64,
    /// The segment virtual address
    pub vaddr: u64,
    /// The segment physical address (mirrors `vaddr`)
    pub paddr: u64,
    /// The number of file bytes
    pub filesz: u64,
    /// The number of memory bytes (`>= filesz`)
    pub memsz: u64,
    /// The segment alignment
    pub align: u64,
}

impl<W> ToWriter<W> for ElfProgramHeader
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.r#type.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.vaddr.to_le_bytes())?;
        writer.write_all(&self.paddr.to_le_bytes())?;
        writer.write_all(&self.filesz.to_le_bytes())?;
        writer.write_all(&self.memsz.to_le_bytes())?;
        writer.write_all(&self.align.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for ElfProgramHeader {
    const SIZE: usize = 56;
}

/// An ELF64 section header
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfSectionHeader {
    /// Offset of the section name in the section-name string table
    pub name: u32,
    /// The section type
    pub r#type: u32,
    /// The section flags
    pub flags: u64,
    /// The section virtual address
    pub addr: u64,
    /// The section file offset
    pub offset: u64,
    /// The section size
    pub size: u64,
    /// Type-specific linked section index
    pub link: u32,
    /// Type-specific information
    pub info: u32,
    /// The section alignment
    pub addralign: u64,
    /// The per-entry size for table sections
    pub entsize: u64,
}

impl<W> ToWriter<W> for ElfSectionHeader
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.name.to_le_bytes())?;
        writer.write_all(&self.r#type.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.addr.to_le_bytes())?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.link.to_le_bytes())?;
        writer.write_all(&self.info.to_le_bytes())?;
        writer.write_all(&self.addralign.to_le_bytes())?;
        writer.write_all(&self.entsize.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for ElfSectionHeader {
    const SIZE: usize = 64;
}

/// An ELF64 symbol table record
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfSymbolRecord {
    /// Offset of the symbol name in the string table
    pub name: u32,
    /// Binding and type, packed
    pub info: u8,
    /// Visibility (always default here)
    pub other: u8,
    /// The defining section header index
    pub shndx: u16,
    /// The symbol value
    pub value: u64,
    /// The symbol size
    pub size: u64,
}

impl<W> ToWriter<W> for ElfSymbolRecord
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.name.to_le_bytes())?;
        writer.write_all(&[self.info, self.other])?;
        writer.write_all(&self.shndx.to_le_bytes())?;
        writer.write_all(&self.value.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for ElfSymbolRecord {
    const SIZE: usize = 24;
}

/// Parameters the ELF writer needs beyond the merged state
#[derive(Debug, Clone, Copy)]
pub struct ElfWriteParams {
    /// The target machine
    pub machine: Machine,
    /// Whether the output is a position-independent executable
    pub pie: bool,
    /// The image base virtual address
    pub base: u64,
    /// The entry-point virtual address (`_start`)
    pub entry: u64,
}

/// The section header flags for a merged section
fn section_flags(section: &MergedSection) -> u64 {
    let mut flags = 0;
    if section.flags.contains(SectionFlags::ALLOCATABLE) {
        flags |= SHF_ALLOC;
    }
    if section.flags.contains(SectionFlags::WRITABLE) {
        flags |= SHF_WRITE;
    }
    if section.flags.contains(SectionFlags::EXECUTABLE) {
        flags |= SHF_EXECINSTR;
    }
    if matches!(
        section.kind,
        SectionKind::ThreadData | SectionKind::ThreadBss
    ) {
        flags |= SHF_TLS;
    }
    flags
}

/// One planned symbol table entry
struct PlannedSymbol {
    name: String,
    binding: SymbolBinding,
    kind: SymbolKind,
    address: u64,
    size: u64,
    shndx: u16,
}

/// Collect the output symbol table: locals first, then the directory
/// winners among global and weak definitions, in object-insertion order
fn plan_symbols(
    objects: &[Object],
    merged: &[MergedSection],
    directory: &SymbolDirectory,
) -> Vec<PlannedSymbol> {
    let section_index_of = |address: u64| -> u16 {
        merged
            .iter()
            .position(|section| section.contains(address))
            .map(|index| (index + 1) as u16)
            .unwrap_or(SHN_ABS)
    };

    let mut locals = Vec::new();
    let mut globals = Vec::new();
    for (object_index, object) in objects.iter().enumerate() {
        for (symbol_index, symbol) in object.symbols.iter().enumerate() {
            if !symbol.is_defined || symbol.name.is_empty() {
                continue;
            }
            let Some(address) = symbol.final_address else {
                continue;
            };
            let planned = PlannedSymbol {
                name: symbol.name.clone(),
                binding: symbol.binding,
                kind: symbol.kind,
                address,
                size: symbol.size,
                shndx: if symbol.section.is_some() {
                    section_index_of(address)
                } else {
                    SHN_ABS
                },
            };
            match symbol.binding {
                SymbolBinding::Local => locals.push(planned),
                SymbolBinding::Global | SymbolBinding::Weak => {
                    let winner = directory
                        .get(&symbol.name)
                        .map(|definition| {
                            definition.object == object_index && definition.symbol == symbol_index
                        })
                        .unwrap_or(false);
                    if winner {
                        globals.push(planned);
                    }
                }
            }
        }
    }
    locals.extend(globals);
    locals
}

/// Serialize the linked ELF image
pub fn write(
    objects: &[Object],
    merged: &[MergedSection],
    directory: &SymbolDirectory,
    params: &ElfWriteParams,
) -> Result<Vec<u8>> {
    let placed: Vec<&MergedSection> = merged.iter().collect();
    let file_backed: Vec<&MergedSection> = placed
        .iter()
        .copied()
        .filter(|section| !section.kind.is_zero_fill())
        .collect();

    // Program header census: optional PT_PHDR, one R|X load, one R|W load
    // for initialized data, one R|W load for the zero-fill range.
    let rw_file: Vec<&MergedSection> = file_backed
        .iter()
        .copied()
        .filter(|section| !section.kind.is_code_segment() && section.kind != SectionKind::Got)
        .collect();
    let zero_fill: Vec<&MergedSection> = placed
        .iter()
        .copied()
        .filter(|section| section.kind.is_zero_fill())
        .collect();
    let phnum = 1 + u16::from(params.pie) + u16::from(!rw_file.is_empty())
        + u16::from(!zero_fill.is_empty());

    let file_offset_of = |section: &MergedSection| section.vaddr - params.base;
    let content_end = file_backed
        .iter()
        .map(|section| file_offset_of(section) + section.size)
        .max()
        .unwrap_or((ElfFileHeader::SIZE + usize::from(phnum) * ElfProgramHeader::SIZE) as u64);

    // Symbol table plan
    let planned = plan_symbols(objects, merged, directory);
    let local_count = planned
        .iter()
        .filter(|symbol| symbol.binding == SymbolBinding::Local)
        .count();
    let mut strings = StringTable::new();
    let records: Vec<ElfSymbolRecord> = std::iter::once(ElfSymbolRecord::default())
        .chain(planned.iter().map(|symbol| {
            let info_type = match symbol.kind {
                SymbolKind::NoType => STT_NOTYPE,
                SymbolKind::Func => STT_FUNC,
                SymbolKind::Object => STT_OBJECT,
            };
            let info_bind = match symbol.binding {
                SymbolBinding::Local => STB_LOCAL,
                SymbolBinding::Global => STB_GLOBAL,
                SymbolBinding::Weak => STB_WEAK,
            };
            ElfSymbolRecord {
                name: strings.add(&symbol.name),
                info: (info_bind << 4) | info_type,
                other: 0,
                shndx: symbol.shndx,
                value: symbol.address,
                size: symbol.size,
            }
        }))
        .collect();

    // Linker metadata tail: .symtab, .strtab, .shstrtab, section headers
    let symtab_offset = align_up(content_end, 8);
    let symtab_size = (records.len() * ElfSymbolRecord::SIZE) as u64;
    let strtab_offset = symtab_offset + symtab_size;
    let strtab_size = strings.len() as u64;

    let mut section_names = StringTable::new();
    let mut headers = vec![ElfSectionHeader::default()];
    for section in &placed {
        headers.push(ElfSectionHeader {
            name: section_names.add(&section.name),
            r#type: if section.kind.is_zero_fill() {
                ElfSectionType::NoBits as u32
            } else {
                ElfSectionType::ProgBits as u32
            },
            flags: section_flags(section),
            addr: section.vaddr,
            offset: file_offset_of(section),
            size: section.size,
            link: 0,
            info: 0,
            addralign: section.align,
            entsize: 0,
        });
    }
    let strtab_index = (headers.len() + 1) as u32;
    headers.push(ElfSectionHeader {
        name: section_names.add(".symtab"),
        r#type: ElfSectionType::SymTab as u32,
        flags: 0,
        addr: 0,
        offset: symtab_offset,
        size: symtab_size,
        link: strtab_index,
        info: (local_count + 1) as u32,
        addralign: 8,
        entsize: ElfSymbolRecord::SIZE as u64,
    });
    headers.push(ElfSectionHeader {
        name: section_names.add(".strtab"),
        r#type: ElfSectionType::StrTab as u32,
        flags: 0,
        addr: 0,
        offset: strtab_offset,
        size: strtab_size,
        link: 0,
        info: 0,
        addralign: 1,
        entsize: 0,
    });
    let shstrtab_name = section_names.add(".shstrtab");
    let shstrtab_offset = strtab_offset + strtab_size;
    let shstrtab_size = section_names.len() as u64;
    headers.push(ElfSectionHeader {
        name: shstrtab_name,
        r#type: ElfSectionType::StrTab as u32,
        flags: 0,
        addr: 0,
        offset: shstrtab_offset,
        size: shstrtab_size,
        link: 0,
        info: 0,
        addralign: 1,
        entsize: 0,
    });
    let shoff = align_up(shstrtab_offset + shstrtab_size, 8);
    let shnum = headers.len() as u16;
    let shstrndx = shnum - 1;

    // Serialize
    let mut buf = Vec::new();
    ElfFileHeader {
        r#type: if params.pie {
            ElfObjectType::SharedObject
        } else {
            ElfObjectType::Executable
        },
        machine: params.machine.into(),
        entry: params.entry,
        phoff: ElfFileHeader::SIZE as u64,
        shoff,
        phnum,
        shnum,
        shstrndx,
    }
    .to_writer(&mut buf)?;

    if params.pie {
        ElfProgramHeader {
            r#type: PT_PHDR,
            flags: PF_R,
            offset: ElfFileHeader::SIZE as u64,
            vaddr: params.base + ElfFileHeader::SIZE as u64,
            paddr: params.base + ElfFileHeader::SIZE as u64,
            filesz: u64::from(phnum) * ElfProgramHeader::SIZE as u64,
            memsz: u64::from(phnum) * ElfProgramHeader::SIZE as u64,
            align: 8,
        }
        .to_writer(&mut buf)?;
    }

    let code_end = file_backed
        .iter()
        .filter(|section| section.kind.is_code_segment())
        .map(|section| file_offset_of(section) + section.size)
        .max()
        .unwrap_or(0);
    ElfProgramHeader {
        r#type: PT_LOAD,
        flags: PF_R | PF_X,
        offset: 0,
        vaddr: params.base,
        paddr: params.base,
        filesz: code_end,
        memsz: code_end,
        align: ELF_PAGE_SIZE,
    }
    .to_writer(&mut buf)?;

    if let (Some(first), Some(last)) = (rw_file.first(), rw_file.last()) {
        let start = file_offset_of(first);
        let end = file_offset_of(last) + last.size;
        ElfProgramHeader {
            r#type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: start,
            vaddr: first.vaddr,
            paddr: first.vaddr,
            filesz: end - start,
            memsz: end - start,
            align: ELF_PAGE_SIZE,
        }
        .to_writer(&mut buf)?;
    }

    if let (Some(first), Some(last)) = (zero_fill.first(), zero_fill.last()) {
        let span = last.vaddr + last.size - first.vaddr;
        ElfProgramHeader {
            r#type: PT_LOAD,
            flags: PF_R | PF_W,
            offset: first.vaddr - params.base,
            vaddr: first.vaddr,
            paddr: first.vaddr,
            filesz: 0,
            memsz: span,
            align: ELF_PAGE_SIZE,
        }
        .to_writer(&mut buf)?;
    }

    for section in &file_backed {
        pad_to(&mut buf, file_offset_of(section) as usize);
        buf.extend_from_slice(&section.data);
    }

    pad_to(&mut buf, symtab_offset as usize);
    for record in &records {
        record.to_writer(&mut buf)?;
    }
    buf.extend_from_slice(strings.bytes());
    buf.extend_from_slice(section_names.bytes());
    pad_to(&mut buf, shoff as usize);
    for header in &headers {
        header.to_writer(&mut buf)?;
    }

    Ok(buf)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{Format, Section, Symbol};
    use crate::layout::{assign_addresses, finalize_symbols, merge, ELF_BASE};
    use crate::resolve::resolve;

    fn linked_state() -> (Vec<Object>, Vec<MergedSection>, SymbolDirectory) {
        let mut object = Object::builder()
            .name("a.o")
            .format(Format::Elf)
            .machine(Machine::X86_64)
            .sections(vec![
                Section::builder()
                    .name(".text")
                    .kind(SectionKind::Text)
                    .size(4)
                    .align(16)
                    .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
                    .content(vec![0xC3, 0x90, 0x90, 0x90])
                    .build(),
                Section::builder()
                    .name(".bss")
                    .kind(SectionKind::Bss)
                    .size(64)
                    .align(8)
                    .flags(SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE)
                    .build(),
            ])
            .build();
        object.symbols.push(
            Symbol::builder()
                .name("_start")
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .section(0)
                .is_defined(true)
                .build(),
        );
        let mut objects = vec![object];
        let (directory, errors) = resolve(&mut objects);
        assert!(errors.is_empty());
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_BASE + ELF_PAGE_SIZE);
        assert!(finalize_symbols(&mut objects).is_empty());
        (objects, merged, directory)
    }

    #[test]
    fn test_header_bytes() {
        let (objects, merged, directory) = linked_state();
        let entry = objects[0].symbols[0].final_address.unwrap();
        let image = write(
            &objects,
            &merged,
            &directory,
            &ElfWriteParams {
                machine: Machine::X86_64,
                pie: false,
                base: ELF_BASE,
                entry,
            },
        )
        .unwrap();

        assert_eq!(&image[0..4], &[0x7F, b'E', b'L', b'F']);
        // ELFCLASS64, little-endian, current version
        assert_eq!(&image[4..7], &[2, 1, 1]);
        assert_eq!(
            u16::from_le_bytes(image[16..18].try_into().unwrap()),
            ElfObjectType::Executable as u16
        );
        assert_eq!(
            u16::from_le_bytes(image[18..20].try_into().unwrap()),
            ElfMachineType::X86_64 as u16
        );
        assert_eq!(u64::from_le_bytes(image[24..32].try_into().unwrap()), entry);
        // e_phoff immediately after the header
        assert_eq!(u64::from_le_bytes(image[32..40].try_into().unwrap()), 64);
    }

    #[test]
    fn test_load_segments() {
        let (objects, merged, directory) = linked_state();
        let entry = objects[0].symbols[0].final_address.unwrap();
        let image = write(
            &objects,
            &merged,
            &directory,
            &ElfWriteParams {
                machine: Machine::X86_64,
                pie: false,
                base: ELF_BASE,
                entry,
            },
        )
        .unwrap();

        let phnum = u16::from_le_bytes(image[56..58].try_into().unwrap());
        assert_eq!(phnum, 2);

        // First load: R|X covering headers and text from offset 0.
        let phdr = &image[64..64 + 56];
        assert_eq!(u32::from_le_bytes(phdr[0..4].try_into().unwrap()), PT_LOAD);
        assert_eq!(
            u32::from_le_bytes(phdr[4..8].try_into().unwrap()),
            PF_R | PF_X
        );
        assert_eq!(u64::from_le_bytes(phdr[8..16].try_into().unwrap()), 0);
        assert_eq!(
            u64::from_le_bytes(phdr[16..24].try_into().unwrap()),
            ELF_BASE
        );
        let filesz = u64::from_le_bytes(phdr[32..40].try_into().unwrap());
        assert_eq!(filesz, ELF_PAGE_SIZE + 4);

        // Second load: the zero-fill range with memsz > filesz.
        let phdr = &image[64 + 56..64 + 112];
        assert_eq!(u32::from_le_bytes(phdr[0..4].try_into().unwrap()), PT_LOAD);
        assert_eq!(
            u32::from_le_bytes(phdr[4..8].try_into().unwrap()),
            PF_R | PF_W
        );
        assert_eq!(u64::from_le_bytes(phdr[32..40].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(phdr[40..48].try_into().unwrap()), 64);

        // The text payload lands at its page-aligned file offset.
        assert_eq!(&image[ELF_PAGE_SIZE as usize..ELF_PAGE_SIZE as usize + 4], &[0xC3, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_pie_gets_phdr_segment() {
        let (mut objects, _, _) = linked_state();
        // Re-run layout at base 0 for the PIE image.
        let mut merged = merge(&mut objects, Format::Elf, 0, 0).unwrap();
        assign_addresses(&mut merged, &mut objects, Format::Elf, ELF_PAGE_SIZE);
        assert!(finalize_symbols(&mut objects).is_empty());
        let (directory, _) = resolve(&mut objects);
        let entry = objects[0].symbols[0].final_address.unwrap();
        let image = write(
            &objects,
            &merged,
            &directory,
            &ElfWriteParams {
                machine: Machine::X86_64,
                pie: true,
                base: 0,
                entry,
            },
        )
        .unwrap();

        assert_eq!(
            u16::from_le_bytes(image[16..18].try_into().unwrap()),
            ElfObjectType::SharedObject as u16
        );
        let phnum = u16::from_le_bytes(image[56..58].try_into().unwrap());
        assert_eq!(phnum, 3);
        let phdr = &image[64..64 + 56];
        assert_eq!(u32::from_le_bytes(phdr[0..4].try_into().unwrap()), PT_PHDR);
    }

    #[test]
    fn test_symtab_tail() {
        let (objects, merged, directory) = linked_state();
        let entry = objects[0].symbols[0].final_address.unwrap();
        let image = write(
            &objects,
            &merged,
            &directory,
            &ElfWriteParams {
                machine: Machine::X86_64,
                pie: false,
                base: ELF_BASE,
                entry,
            },
        )
        .unwrap();

        let shoff = u64::from_le_bytes(image[40..48].try_into().unwrap()) as usize;
        let shnum = u16::from_le_bytes(image[60..62].try_into().unwrap());
        // NULL + .text + .bss + .symtab + .strtab + .shstrtab
        assert_eq!(shnum, 6);
        let symtab = &image[shoff + 3 * ElfSectionHeader::SIZE..shoff + 4 * ElfSectionHeader::SIZE];
        assert_eq!(
            u32::from_le_bytes(symtab[4..8].try_into().unwrap()),
            ElfSectionType::SymTab as u32
        );
        let symoff = u64::from_le_bytes(symtab[24..32].try_into().unwrap()) as usize;
        let symsize = u64::from_le_bytes(symtab[32..40].try_into().unwrap()) as usize;
        // Null record plus _start
        assert_eq!(symsize / ElfSymbolRecord::SIZE, 2);
        let record = &image[symoff + ElfSymbolRecord::SIZE..symoff + 2 * ElfSymbolRecord::SIZE];
        assert_eq!(record[4], (STB_GLOBAL << 4) | STT_FUNC);
        assert_eq!(
            u64::from_le_bytes(record[8..16].try_into().unwrap()),
            entry
        );
    }
}
