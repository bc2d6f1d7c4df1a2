//! Mach-O output structures and the Mach-O image writer
//!
//! Emits a position-independent `MH_EXECUTE` image for ARM64: the full
//! load-command set, the segment payloads, and the `__LINKEDIT` blobs
//! (bind info, export info, external relocations, symbol table, indirect
//! symbol table, string table). The constants here also serve the Mach-O
//! object reader.

use std::io::Write;

use log::debug;

use crate::base::{
    align_up, MergedSection, Object, SectionKind, SymbolBinding,
};
use crate::dynlink::{build_bind_info, DynLinkPlan, TlvBind, TLV_BOOTSTRAP_SYMBOL, TLV_DESCRIPTOR_SIZE};
use crate::error::{Error, Result};
use crate::image::{pad_to, StringTable};
use crate::layout::{MACHO_BASE, MACHO_PAGE_SIZE};
use crate::reloc::ExternalRelocation;
use crate::resolve::SymbolDirectory;
use crate::{HasWrittenSize, ToWriter};

/// `MH_MAGIC_64`
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
/// `CPU_TYPE_ARM64`
pub const CPU_TYPE_ARM64: u32 = 0x0100_000C;
/// `CPU_SUBTYPE_ARM64_ALL`
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// `MH_OBJECT`
pub const MH_OBJECT: u32 = 1;
/// `MH_EXECUTE`
pub const MH_EXECUTE: u32 = 2;

bitflags::bitflags! {
    /// Mach-O header flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachHeaderFlags: u32 {
        /// The image has no undefined symbols
        const NOUNDEFS = 0x1;
        /// The image is input to the dynamic linker
        const DYLDLINK = 0x4;
        /// The image uses two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// The image is position independent
        const PIE = 0x20_0000;
        /// The image contains thread-local variable descriptors
        const HAS_TLV_DESCRIPTORS = 0x80_0000;
    }
}

/// `LC_SYMTAB`
pub const LC_SYMTAB: u32 = 0x2;
/// `LC_DYSYMTAB`
pub const LC_DYSYMTAB: u32 = 0xB;
/// `LC_LOAD_DYLIB`
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// `LC_LOAD_DYLINKER`
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// `LC_SEGMENT_64`
pub const LC_SEGMENT_64: u32 = 0x19;
/// `LC_UUID`
pub const LC_UUID: u32 = 0x1B;
/// `LC_BUILD_VERSION`
pub const LC_BUILD_VERSION: u32 = 0x32;
/// `LC_MAIN`
pub const LC_MAIN: u32 = 0x8000_0028;
/// `LC_DYLD_INFO_ONLY`
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

/// `VM_PROT_READ`
pub const VM_PROT_READ: u32 = 1;
/// `VM_PROT_WRITE`
pub const VM_PROT_WRITE: u32 = 2;
/// `VM_PROT_EXECUTE`
pub const VM_PROT_EXECUTE: u32 = 4;
/// `SG_READ_ONLY`: the segment becomes read-only after fixups
pub const SG_READ_ONLY: u32 = 0x10;

/// `S_REGULAR`
pub const S_REGULAR: u32 = 0x0;
/// `S_ZEROFILL`
pub const S_ZEROFILL: u32 = 0x1;
/// `S_CSTRING_LITERALS`
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// `S_NON_LAZY_SYMBOL_POINTERS`
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// `S_SYMBOL_STUBS`
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// `S_THREAD_LOCAL_REGULAR`
pub const S_THREAD_LOCAL_REGULAR: u32 = 0x11;
/// `S_THREAD_LOCAL_ZEROFILL`
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
/// `S_THREAD_LOCAL_VARIABLES`
pub const S_THREAD_LOCAL_VARIABLES: u32 = 0x13;
/// `SECTION_TYPE` mask over section flags
pub const SECTION_TYPE_MASK: u32 = 0xFF;
/// `S_ATTR_PURE_INSTRUCTIONS`
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// `S_ATTR_SOME_INSTRUCTIONS`
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

/// `N_UNDF`
pub const N_UNDF: u8 = 0x0;
/// `N_ABS`
pub const N_ABS: u8 = 0x2;
/// `N_SECT`
pub const N_SECT: u8 = 0xE;
/// `N_EXT`
pub const N_EXT: u8 = 0x01;
/// `N_TYPE` mask over `n_type`
pub const N_TYPE_MASK: u8 = 0x0E;

/// `ARM64_RELOC_UNSIGNED`
pub const ARM64_RELOC_UNSIGNED: u32 = 0;
/// `ARM64_RELOC_SUBTRACTOR`
pub const ARM64_RELOC_SUBTRACTOR: u32 = 1;
/// `ARM64_RELOC_BRANCH26`
pub const ARM64_RELOC_BRANCH26: u32 = 2;
/// `ARM64_RELOC_PAGE21`
pub const ARM64_RELOC_PAGE21: u32 = 3;
/// `ARM64_RELOC_PAGEOFF12`
pub const ARM64_RELOC_PAGEOFF12: u32 = 4;
/// `ARM64_RELOC_GOT_LOAD_PAGE21`
pub const ARM64_RELOC_GOT_LOAD_PAGE21: u32 = 5;
/// `ARM64_RELOC_GOT_LOAD_PAGEOFF12`
pub const ARM64_RELOC_GOT_LOAD_PAGEOFF12: u32 = 6;
/// `ARM64_RELOC_POINTER_TO_GOT`
pub const ARM64_RELOC_POINTER_TO_GOT: u32 = 7;
/// `ARM64_RELOC_TLVP_LOAD_PAGE21`
pub const ARM64_RELOC_TLVP_LOAD_PAGE21: u32 = 8;
/// `ARM64_RELOC_TLVP_LOAD_PAGEOFF12`
pub const ARM64_RELOC_TLVP_LOAD_PAGEOFF12: u32 = 9;
/// `ARM64_RELOC_ADDEND`
pub const ARM64_RELOC_ADDEND: u32 = 10;

/// The dynamic linker path
pub const DYLINKER_PATH: &str = "/usr/lib/dyld";
/// The libSystem install name
pub const LIBSYSTEM_PATH: &str = "/usr/lib/libSystem.B.dylib";

/// Pack a segment or section name into its fixed 16-byte field
pub fn pack_name(name: &str) -> [u8; 16] {
    let mut packed = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    packed[..len].copy_from_slice(&bytes[..len]);
    packed
}

/// The Mach-O 64-bit header
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    /// The file type (`MH_EXECUTE` for linked output)
    pub filetype: u32,
    /// The number of load commands
    pub ncmds: u32,
    /// The total byte size of all load commands
    pub sizeofcmds: u32,
    /// The header flag bits
    pub flags: MachHeaderFlags,
}

impl<W> ToWriter<W> for MachHeader
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&MH_MAGIC_64.to_le_bytes())?;
        writer.write_all(&CPU_TYPE_ARM64.to_le_bytes())?;
        writer.write_all(&CPU_SUBTYPE_ARM64_ALL.to_le_bytes())?;
        writer.write_all(&self.filetype.to_le_bytes())?;
        writer.write_all(&self.ncmds.to_le_bytes())?;
        writer.write_all(&self.sizeofcmds.to_le_bytes())?;
        writer.write_all(&self.flags.bits().to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for MachHeader {
    const SIZE: usize = 32;
}

/// An `LC_SEGMENT_64` load command (section records follow separately)
#[derive(Debug, Clone, Copy)]
pub struct SegmentCommand64 {
    /// The segment name
    pub segname: [u8; 16],
    /// The segment virtual address
    pub vmaddr: u64,
    /// The segment virtual size
    pub vmsize: u64,
    /// The segment file offset
    pub fileoff: u64,
    /// The number of file bytes
    pub filesize: u64,
    /// The maximum protection
    pub maxprot: u32,
    /// The initial protection
    pub initprot: u32,
    /// The number of section records following this command
    pub nsects: u32,
    /// Segment flag bits
    pub flags: u32,
}

impl SegmentCommand64 {
    /// The command size including this segment's section records
    pub fn cmdsize(&self) -> u32 {
        (Self::SIZE + self.nsects as usize * MachSection64::SIZE) as u32
    }
}

impl<W> ToWriter<W> for SegmentCommand64
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_SEGMENT_64.to_le_bytes())?;
        writer.write_all(&self.cmdsize().to_le_bytes())?;
        writer.write_all(&self.segname)?;
        writer.write_all(&self.vmaddr.to_le_bytes())?;
        writer.write_all(&self.vmsize.to_le_bytes())?;
        writer.write_all(&self.fileoff.to_le_bytes())?;
        writer.write_all(&self.filesize.to_le_bytes())?;
        writer.write_all(&self.maxprot.to_le_bytes())?;
        writer.write_all(&self.initprot.to_le_bytes())?;
        writer.write_all(&self.nsects.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for SegmentCommand64 {
    const SIZE: usize = 72;
}

/// A 64-bit section record inside an `LC_SEGMENT_64`
#[derive(Debug, Clone, Copy)]
pub struct MachSection64 {
    /// The section name
    pub sectname: [u8; 16],
    /// The owning segment name
    pub segname: [u8; 16],
    /// The section virtual address
    pub addr: u64,
    /// The section size in bytes
    pub size: u64,
    /// The section file offset (0 for zero-fill)
    pub offset: u32,
    /// The section alignment as a power-of-two exponent
    pub align: u32,
    /// The relocation-table file offset (unused in linked output)
    pub reloff: u32,
    /// The relocation count
    pub nreloc: u32,
    /// The section type and attribute bits
    pub flags: u32,
    /// Type-specific (indirect-symbol-table start index)
    pub reserved1: u32,
    /// Type-specific (stub entry size)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl<W> ToWriter<W> for MachSection64
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.sectname)?;
        writer.write_all(&self.segname)?;
        writer.write_all(&self.addr.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.align.to_le_bytes())?;
        writer.write_all(&self.reloff.to_le_bytes())?;
        writer.write_all(&self.nreloc.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.reserved1.to_le_bytes())?;
        writer.write_all(&self.reserved2.to_le_bytes())?;
        writer.write_all(&self.reserved3.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for MachSection64 {
    const SIZE: usize = 80;
}

/// An `LC_SYMTAB` load command
#[derive(Debug, Clone, Copy, Default)]
pub struct SymtabCommand {
    /// The symbol-table file offset
    pub symoff: u32,
    /// The number of symbol-table entries
    pub nsyms: u32,
    /// The string-table file offset
    pub stroff: u32,
    /// The string-table byte size
    pub strsize: u32,
}

impl<W> ToWriter<W> for SymtabCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_SYMTAB.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        writer.write_all(&self.symoff.to_le_bytes())?;
        writer.write_all(&self.nsyms.to_le_bytes())?;
        writer.write_all(&self.stroff.to_le_bytes())?;
        writer.write_all(&self.strsize.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for SymtabCommand {
    const SIZE: usize = 24;
}

/// An `LC_DYSYMTAB` load command
#[derive(Debug, Clone, Copy, Default)]
pub struct DysymtabCommand {
    /// The index of the first local symbol
    pub ilocalsym: u32,
    /// The number of local symbols
    pub nlocalsym: u32,
    /// The index of the first externally defined symbol
    pub iextdefsym: u32,
    /// The number of externally defined symbols
    pub nextdefsym: u32,
    /// The index of the first undefined symbol
    pub iundefsym: u32,
    /// The number of undefined symbols
    pub nundefsym: u32,
    /// The indirect-symbol-table file offset
    pub indirectsymoff: u32,
    /// The number of indirect-symbol-table entries
    pub nindirectsyms: u32,
    /// The external-relocation file offset
    pub extreloff: u32,
    /// The number of external relocations
    pub nextrel: u32,
}

impl<W> ToWriter<W> for DysymtabCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_DYSYMTAB.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        writer.write_all(&self.ilocalsym.to_le_bytes())?;
        writer.write_all(&self.nlocalsym.to_le_bytes())?;
        writer.write_all(&self.iextdefsym.to_le_bytes())?;
        writer.write_all(&self.nextdefsym.to_le_bytes())?;
        writer.write_all(&self.iundefsym.to_le_bytes())?;
        writer.write_all(&self.nundefsym.to_le_bytes())?;
        // toc, modtab and external reference table are unused
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&self.indirectsymoff.to_le_bytes())?;
        writer.write_all(&self.nindirectsyms.to_le_bytes())?;
        writer.write_all(&self.extreloff.to_le_bytes())?;
        writer.write_all(&self.nextrel.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for DysymtabCommand {
    const SIZE: usize = 80;
}

/// An `LC_MAIN` load command
#[derive(Debug, Clone, Copy)]
pub struct EntryPointCommand {
    /// The entry point as an offset from the `__TEXT` segment address
    pub entryoff: u64,
    /// The initial stack size (0 keeps the default)
    pub stacksize: u64,
}

impl<W> ToWriter<W> for EntryPointCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_MAIN.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        writer.write_all(&self.entryoff.to_le_bytes())?;
        writer.write_all(&self.stacksize.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for EntryPointCommand {
    const SIZE: usize = 24;
}

/// An `LC_LOAD_DYLINKER` load command
#[derive(Debug, Clone)]
pub struct DylinkerCommand {
    /// The dynamic linker path
    pub path: String,
}

impl DylinkerCommand {
    /// The command size with the path padded to an 8-byte boundary
    pub fn cmdsize(&self) -> u32 {
        align_up(12 + self.path.len() as u64 + 1, 8) as u32
    }
}

impl<W> ToWriter<W> for DylinkerCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        let cmdsize = self.cmdsize();
        writer.write_all(&LC_LOAD_DYLINKER.to_le_bytes())?;
        writer.write_all(&cmdsize.to_le_bytes())?;
        writer.write_all(&12u32.to_le_bytes())?;
        writer.write_all(self.path.as_bytes())?;
        let padding = cmdsize as usize - 12 - self.path.len();
        writer.write_all(&vec![0; padding])?;
        Ok(())
    }
}

/// An `LC_LOAD_DYLIB` load command
#[derive(Debug, Clone)]
pub struct DylibCommand {
    /// The dylib install name
    pub path: String,
}

impl DylibCommand {
    /// The command size with the install name padded to an 8-byte boundary
    pub fn cmdsize(&self) -> u32 {
        align_up(24 + self.path.len() as u64 + 1, 8) as u32
    }
}

impl<W> ToWriter<W> for DylibCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        let cmdsize = self.cmdsize();
        writer.write_all(&LC_LOAD_DYLIB.to_le_bytes())?;
        writer.write_all(&cmdsize.to_le_bytes())?;
        writer.write_all(&24u32.to_le_bytes())?;
        // timestamp, current version and compatibility version are zero
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(self.path.as_bytes())?;
        let padding = cmdsize as usize - 24 - self.path.len();
        writer.write_all(&vec![0; padding])?;
        Ok(())
    }
}

/// An `LC_DYLD_INFO_ONLY` load command
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfoCommand {
    /// The bind-opcode stream file offset
    pub bind_off: u32,
    /// The bind-opcode stream byte size
    pub bind_size: u32,
    /// The export-trie file offset
    pub export_off: u32,
    /// The export-trie byte size
    pub export_size: u32,
}

impl<W> ToWriter<W> for DyldInfoCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_DYLD_INFO_ONLY.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        // rebase is unused; only non-lazy binds are emitted
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&self.bind_off.to_le_bytes())?;
        writer.write_all(&self.bind_size.to_le_bytes())?;
        // weak and lazy bind ranges are zero
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&self.export_off.to_le_bytes())?;
        writer.write_all(&self.export_size.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for DyldInfoCommand {
    const SIZE: usize = 48;
}

/// An `LC_UUID` load command
#[derive(Debug, Clone, Copy)]
pub struct UuidCommand {
    /// The image UUID
    pub uuid: [u8; 16],
}

impl<W> ToWriter<W> for UuidCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_UUID.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        writer.write_all(&self.uuid)?;
        Ok(())
    }
}

impl HasWrittenSize for UuidCommand {
    const SIZE: usize = 24;
}

/// An `LC_BUILD_VERSION` load command
#[derive(Debug, Clone, Copy)]
pub struct BuildVersionCommand {
    /// The target platform (1 = macOS)
    pub platform: u32,
    /// The minimum OS version, encoded `xxxx.yy.zz`
    pub minos: u32,
    /// The SDK version, encoded `xxxx.yy.zz`
    pub sdk: u32,
}

impl<W> ToWriter<W> for BuildVersionCommand
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&LC_BUILD_VERSION.to_le_bytes())?;
        writer.write_all(&(Self::SIZE as u32).to_le_bytes())?;
        writer.write_all(&self.platform.to_le_bytes())?;
        writer.write_all(&self.minos.to_le_bytes())?;
        writer.write_all(&self.sdk.to_le_bytes())?;
        // ntools
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for BuildVersionCommand {
    const SIZE: usize = 24;
}

/// A 64-bit symbol table entry
#[derive(Debug, Clone, Copy, Default)]
pub struct Nlist64 {
    /// The string-table offset of the symbol name
    pub n_strx: u32,
    /// The symbol type bits
    pub n_type: u8,
    /// The defining section ordinal (1-based), or 0
    pub n_sect: u8,
    /// Type-specific description (library ordinal for undefined symbols)
    pub n_desc: u16,
    /// The symbol value
    pub n_value: u64,
}

impl<W> ToWriter<W> for Nlist64
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.n_strx.to_le_bytes())?;
        writer.write_all(&[self.n_type, self.n_sect])?;
        writer.write_all(&self.n_desc.to_le_bytes())?;
        writer.write_all(&self.n_value.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for Nlist64 {
    const SIZE: usize = 16;
}

/// A relocation entry as stored in the file
#[derive(Debug, Clone, Copy)]
pub struct MachRelocationInfo {
    /// The patch address relative to the relocation base
    pub r_address: i32,
    /// The symbol index of an external relocation
    pub r_symbolnum: u32,
    /// Whether the relocation is PC-relative
    pub r_pcrel: bool,
    /// The log2 of the patch width
    pub r_length: u8,
    /// Whether `r_symbolnum` indexes the symbol table
    pub r_extern: bool,
    /// The machine-specific relocation type
    pub r_type: u32,
}

impl<W> ToWriter<W> for MachRelocationInfo
where
    W: Write,
{
    type Error = Error;

    fn to_writer(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.r_address.to_le_bytes())?;
        let packed = (self.r_symbolnum & 0x00FF_FFFF)
            | (u32::from(self.r_pcrel) << 24)
            | (u32::from(self.r_length) << 25)
            | (u32::from(self.r_extern) << 27)
            | (self.r_type << 28);
        writer.write_all(&packed.to_le_bytes())?;
        Ok(())
    }
}

impl HasWrittenSize for MachRelocationInfo {
    const SIZE: usize = 8;
}

/// The merged sections partitioned into their output segments
struct SegmentPlan<'a> {
    text: Vec<&'a MergedSection>,
    data_const: Vec<&'a MergedSection>,
    data: Vec<&'a MergedSection>,
}

impl<'a> SegmentPlan<'a> {
    fn new(merged: &'a [MergedSection]) -> Self {
        let mut plan = SegmentPlan {
            text: Vec::new(),
            data_const: Vec::new(),
            data: Vec::new(),
        };
        for section in merged {
            match section.kind {
                SectionKind::Text | SectionKind::ReadOnlyData | SectionKind::Stubs => {
                    plan.text.push(section);
                }
                SectionKind::Got => plan.data_const.push(section),
                SectionKind::Data
                | SectionKind::ThreadVars
                | SectionKind::ThreadData
                | SectionKind::ThreadBss
                | SectionKind::Bss => plan.data.push(section),
                SectionKind::Unknown => {}
            }
        }
        plan
    }

    /// The load-command index of the segment holding the data sections
    ///
    /// `__PAGEZERO` is 0 and `__TEXT` is 1; `__DATA_CONST` shifts `__DATA`
    /// by one when present.
    fn data_segment_index(&self) -> u8 {
        if self.data_const.is_empty() {
            2
        } else {
            3
        }
    }

    /// The load-command index of the segment holding the GOT
    fn data_const_segment_index(&self) -> u8 {
        2
    }

    fn has_thread_vars(&self) -> bool {
        self.data
            .iter()
            .any(|section| section.kind == SectionKind::ThreadVars)
    }
}

/// The exact total size of all load commands for the merged state
///
/// Section layout consumes this to place the first text byte; the writer
/// consumes it again for `sizeofcmds`. Both must agree bit for bit.
pub fn load_commands_size(merged: &[MergedSection], has_dyld_info: bool) -> u32 {
    let plan = SegmentPlan::new(merged);
    let mut size = 0u32;
    // __PAGEZERO
    size += SegmentCommand64::SIZE as u32;
    // __TEXT
    size += SegmentCommand64::SIZE as u32 + plan.text.len() as u32 * MachSection64::SIZE as u32;
    if !plan.data_const.is_empty() {
        size += SegmentCommand64::SIZE as u32
            + plan.data_const.len() as u32 * MachSection64::SIZE as u32;
    }
    if !plan.data.is_empty() {
        size += SegmentCommand64::SIZE as u32 + plan.data.len() as u32 * MachSection64::SIZE as u32;
    }
    // __LINKEDIT
    size += SegmentCommand64::SIZE as u32;
    if has_dyld_info {
        size += DyldInfoCommand::SIZE as u32;
    }
    size += EntryPointCommand::SIZE as u32;
    size += DylinkerCommand {
        path: DYLINKER_PATH.into(),
    }
    .cmdsize();
    size += DylibCommand {
        path: LIBSYSTEM_PATH.into(),
    }
    .cmdsize();
    size += SymtabCommand::SIZE as u32;
    size += DysymtabCommand::SIZE as u32;
    size += UuidCommand::SIZE as u32;
    size += BuildVersionCommand::SIZE as u32;
    size
}

/// Whether the image carries an `LC_DYLD_INFO_ONLY` command
pub fn wants_dyld_info(merged: &[MergedSection], plan: &DynLinkPlan) -> bool {
    plan.got_count() > 0
        || merged
            .iter()
            .any(|section| section.kind == SectionKind::ThreadVars)
}

/// One planned symbol table entry
struct PlannedSymbol {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

/// Prefix `name` with `_` if not already prefixed
fn mangle(name: &str) -> String {
    if name.starts_with('_') {
        name.to_string()
    } else {
        format!("_{name}")
    }
}

/// Deterministic UUID from the entry point and text size
fn derive_uuid(entry: u64, text_size: u64) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&entry.to_le_bytes());
    uuid[8..].copy_from_slice(&text_size.to_le_bytes());
    // Stamp the version and variant fields so the value reads as UUIDv4.
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

/// The section record for one merged section
fn section_record(section: &MergedSection, segname: &str, base: u64, stub_count: usize) -> MachSection64 {
    let (flags, reserved1, reserved2) = match section.kind {
        SectionKind::Text => (
            S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            0,
            0,
        ),
        SectionKind::Stubs => (
            S_SYMBOL_STUBS | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            0,
            crate::arch::aarch64::STUB_SIZE as u32,
        ),
        SectionKind::Got => (S_NON_LAZY_SYMBOL_POINTERS, stub_count as u32, 0),
        SectionKind::ThreadVars => (S_THREAD_LOCAL_VARIABLES, 0, 0),
        SectionKind::ThreadData => (S_THREAD_LOCAL_REGULAR, 0, 0),
        SectionKind::ThreadBss => (S_THREAD_LOCAL_ZEROFILL, 0, 0),
        SectionKind::Bss => (S_ZEROFILL, 0, 0),
        SectionKind::ReadOnlyData | SectionKind::Data | SectionKind::Unknown => (S_REGULAR, 0, 0),
    };
    MachSection64 {
        sectname: pack_name(&section.name),
        segname: pack_name(segname),
        addr: section.vaddr,
        size: section.size,
        offset: if section.kind.is_zero_fill() {
            0
        } else {
            (section.vaddr - base) as u32
        },
        align: section.align.max(1).trailing_zeros(),
        reloff: 0,
        nreloc: 0,
        flags,
        reserved1,
        reserved2,
        reserved3: 0,
    }
}

/// Serialize the linked Mach-O image
#[allow(clippy::too_many_lines)]
pub fn write(
    objects: &[Object],
    merged: &[MergedSection],
    directory: &SymbolDirectory,
    plan: &DynLinkPlan,
    externals: &[ExternalRelocation],
    entry: u64,
) -> Result<Vec<u8>> {
    let base = MACHO_BASE;
    let segments = SegmentPlan::new(merged);
    let has_dyld_info = wants_dyld_info(merged, plan);
    let sizeofcmds = load_commands_size(merged, has_dyld_info);

    // Segment extents
    let text_end = segments
        .text
        .iter()
        .map(|section| section.vaddr + section.size)
        .max()
        .unwrap_or(base + MachHeader::SIZE as u64 + u64::from(sizeofcmds));
    let text_vmsize = align_up(text_end - base, MACHO_PAGE_SIZE);
    let text_size_total: u64 = segments
        .text
        .iter()
        .filter(|section| section.kind == SectionKind::Text)
        .map(|section| section.size)
        .sum();

    let data_const_range = segments.data_const.first().map(|first| {
        let end = segments
            .data_const
            .iter()
            .map(|section| section.vaddr + section.size)
            .max()
            .unwrap_or(first.vaddr);
        (first.vaddr, align_up(end - first.vaddr, MACHO_PAGE_SIZE))
    });

    let data_file_backed_end = segments
        .data
        .iter()
        .filter(|section| !section.kind.is_zero_fill())
        .map(|section| section.vaddr + section.size)
        .max();
    let data_range = segments.data.first().map(|first| {
        let start = first.vaddr;
        let vm_end = segments
            .data
            .iter()
            .map(|section| section.vaddr + section.size)
            .max()
            .unwrap_or(start);
        (
            start,
            align_up(vm_end - start, MACHO_PAGE_SIZE),
            data_file_backed_end.map(|end| end - start).unwrap_or(0),
        )
    });

    let file_content_end = segments
        .text
        .iter()
        .chain(segments.data_const.iter())
        .chain(segments.data.iter())
        .filter(|section| !section.kind.is_zero_fill())
        .map(|section| section.vaddr - base + section.size)
        .max()
        .unwrap_or(MachHeader::SIZE as u64 + u64::from(sizeofcmds));
    let linkedit_fileoff = align_up(file_content_end, MACHO_PAGE_SIZE);
    let linkedit_vmaddr = {
        let vm_end = data_range
            .map(|(start, vmsize, _)| start + vmsize)
            .or(data_const_range.map(|(start, vmsize)| start + vmsize))
            .unwrap_or(base + text_vmsize);
        align_up(vm_end, MACHO_PAGE_SIZE)
    };

    // __LINKEDIT blobs; every offset is 8-aligned
    let thread_vars = segments
        .data
        .iter()
        .find(|section| section.kind == SectionKind::ThreadVars);
    let tlv_binds: Vec<TlvBind> = thread_vars
        .map(|section| {
            let data_vmaddr = data_range.map(|(start, _, _)| start).unwrap_or(section.vaddr);
            (0..section.size / TLV_DESCRIPTOR_SIZE)
                .map(|index| TlvBind {
                    segment: segments.data_segment_index(),
                    offset: section.vaddr - data_vmaddr + index * TLV_DESCRIPTOR_SIZE,
                })
                .collect()
        })
        .unwrap_or_default();

    let got_offset_in_segment = segments
        .data_const
        .first()
        .and_then(|got| data_const_range.map(|(start, _)| got.vaddr - start))
        .unwrap_or(0);
    let bind_info = build_bind_info(
        plan,
        segments.data_const_segment_index(),
        got_offset_in_segment,
        &tlv_binds,
    );
    // A terminal-only trie: no exported address, no children.
    let export_info: Vec<u8> = if has_dyld_info { vec![0, 0] } else { Vec::new() };

    // Symbol table: locals, externally defined, undefined
    let mut planned: Vec<PlannedSymbol> = Vec::new();
    let section_ordinal_of = |address: u64| -> u8 {
        merged
            .iter()
            .position(|section| section.contains(address))
            .map(|index| (index + 1) as u8)
            .unwrap_or(0)
    };
    for object in objects {
        for symbol in &object.symbols {
            if !symbol.is_defined || symbol.name.is_empty() || symbol.binding != SymbolBinding::Local
            {
                continue;
            }
            let Some(address) = symbol.final_address else {
                continue;
            };
            planned.push(PlannedSymbol {
                name: mangle(&symbol.name),
                n_type: if symbol.section.is_some() { N_SECT } else { N_ABS },
                n_sect: section_ordinal_of(address),
                n_desc: 0,
                n_value: address,
            });
        }
    }
    let nlocalsym = planned.len() as u32;
    for (object_index, object) in objects.iter().enumerate() {
        for (symbol_index, symbol) in object.symbols.iter().enumerate() {
            if !symbol.is_defined
                || symbol.name.is_empty()
                || symbol.binding == SymbolBinding::Local
            {
                continue;
            }
            let winner = directory
                .get(&symbol.name)
                .map(|definition| {
                    definition.object == object_index && definition.symbol == symbol_index
                })
                .unwrap_or(false);
            if !winner {
                continue;
            }
            let Some(address) = symbol.final_address else {
                continue;
            };
            planned.push(PlannedSymbol {
                name: mangle(&symbol.name),
                n_type: (if symbol.section.is_some() { N_SECT } else { N_ABS }) | N_EXT,
                n_sect: section_ordinal_of(address),
                n_desc: 0,
                n_value: address,
            });
        }
    }
    let nextdefsym = planned.len() as u32 - nlocalsym;
    let iundefsym = planned.len() as u32;

    let mut undefined: Vec<String> = Vec::new();
    for name in plan.got_symbols() {
        let mangled = mangle(name);
        if !undefined.contains(&mangled) {
            undefined.push(mangled);
        }
    }
    for external in externals {
        let mangled = mangle(&external.symbol);
        if !undefined.contains(&mangled) {
            undefined.push(mangled);
        }
    }
    if !tlv_binds.is_empty() {
        let bootstrap = TLV_BOOTSTRAP_SYMBOL.to_string();
        if !undefined.contains(&bootstrap) {
            undefined.push(bootstrap);
        }
    }
    let undefined_index_of = |name: &str| -> u32 {
        iundefsym
            + undefined
                .iter()
                .position(|candidate| candidate == &mangle(name))
                .unwrap_or(0) as u32
    };
    for name in &undefined {
        planned.push(PlannedSymbol {
            name: name.clone(),
            n_type: N_UNDF | N_EXT,
            n_sect: 0,
            // Two-level namespace: bound to the first loaded dylib.
            n_desc: 1 << 8,
            n_value: 0,
        });
    }
    let nundefsym = undefined.len() as u32;

    let mut strings = StringTable::new();
    let nlist: Vec<Nlist64> = planned
        .iter()
        .map(|symbol| Nlist64 {
            n_strx: strings.add(&symbol.name),
            n_type: symbol.n_type,
            n_sect: symbol.n_sect,
            n_desc: symbol.n_desc,
            n_value: symbol.n_value,
        })
        .collect();

    // Indirect symbol table: one entry per stub, then one per GOT slot.
    let mut indirect: Vec<u32> = Vec::new();
    for name in &plan.stubs {
        indirect.push(undefined_index_of(name));
    }
    for name in plan.got_symbols() {
        indirect.push(undefined_index_of(name));
    }

    let relocation_base = data_range
        .map(|(start, _, _)| start)
        .or(data_const_range.map(|(start, _)| start))
        .unwrap_or(base);
    let extrel: Vec<MachRelocationInfo> = externals
        .iter()
        .map(|external| MachRelocationInfo {
            r_address: external.address.wrapping_sub(relocation_base) as i32,
            r_symbolnum: undefined_index_of(&external.symbol),
            r_pcrel: false,
            r_length: 3,
            r_extern: true,
            r_type: ARM64_RELOC_UNSIGNED,
        })
        .collect();

    // Linkedit offsets
    let bind_off = linkedit_fileoff;
    let export_off = align_up(bind_off + bind_info.len() as u64, 8);
    let extrel_off = align_up(export_off + export_info.len() as u64, 8);
    let symoff = align_up(
        extrel_off + (extrel.len() * MachRelocationInfo::SIZE) as u64,
        8,
    );
    let indirectsymoff = align_up(symoff + (nlist.len() * Nlist64::SIZE) as u64, 8);
    let stroff = align_up(indirectsymoff + indirect.len() as u64 * 4, 8);
    let linkedit_size = stroff + strings.len() as u64 - linkedit_fileoff;

    // Header flags
    let mut flags = MachHeaderFlags::DYLDLINK | MachHeaderFlags::TWOLEVEL | MachHeaderFlags::PIE;
    if segments.has_thread_vars() {
        flags |= MachHeaderFlags::HAS_TLV_DESCRIPTORS;
    }

    let mut ncmds = 2; // __PAGEZERO + __TEXT
    if !segments.data_const.is_empty() {
        ncmds += 1;
    }
    if !segments.data.is_empty() {
        ncmds += 1;
    }
    ncmds += 1; // __LINKEDIT
    if has_dyld_info {
        ncmds += 1;
    }
    ncmds += 6; // LC_MAIN, dylinker, dylib, symtab, dysymtab, uuid
    ncmds += 1; // build version

    // Serialize the header and load commands
    let mut buf = Vec::new();
    MachHeader {
        filetype: MH_EXECUTE,
        ncmds,
        sizeofcmds,
        flags,
    }
    .to_writer(&mut buf)?;

    SegmentCommand64 {
        segname: pack_name("__PAGEZERO"),
        vmaddr: 0,
        vmsize: base,
        fileoff: 0,
        filesize: 0,
        maxprot: 0,
        initprot: 0,
        nsects: 0,
        flags: 0,
    }
    .to_writer(&mut buf)?;

    SegmentCommand64 {
        segname: pack_name("__TEXT"),
        vmaddr: base,
        vmsize: text_vmsize,
        fileoff: 0,
        filesize: text_vmsize,
        maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
        initprot: VM_PROT_READ | VM_PROT_EXECUTE,
        nsects: segments.text.len() as u32,
        flags: 0,
    }
    .to_writer(&mut buf)?;
    for section in &segments.text {
        section_record(section, "__TEXT", base, plan.stub_count()).to_writer(&mut buf)?;
    }

    if let Some((start, vmsize)) = data_const_range {
        SegmentCommand64 {
            segname: pack_name("__DATA_CONST"),
            vmaddr: start,
            vmsize,
            fileoff: start - base,
            filesize: vmsize,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            nsects: segments.data_const.len() as u32,
            flags: SG_READ_ONLY,
        }
        .to_writer(&mut buf)?;
        for section in &segments.data_const {
            section_record(section, "__DATA_CONST", base, plan.stub_count()).to_writer(&mut buf)?;
        }
    }

    if let Some((start, vmsize, filesize)) = data_range {
        SegmentCommand64 {
            segname: pack_name("__DATA"),
            vmaddr: start,
            vmsize,
            fileoff: start - base,
            filesize,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            nsects: segments.data.len() as u32,
            flags: 0,
        }
        .to_writer(&mut buf)?;
        for section in &segments.data {
            section_record(section, "__DATA", base, plan.stub_count()).to_writer(&mut buf)?;
        }
    }

    SegmentCommand64 {
        segname: pack_name("__LINKEDIT"),
        vmaddr: linkedit_vmaddr,
        vmsize: align_up(linkedit_size, MACHO_PAGE_SIZE),
        fileoff: linkedit_fileoff,
        filesize: linkedit_size,
        maxprot: VM_PROT_READ,
        initprot: VM_PROT_READ,
        nsects: 0,
        flags: 0,
    }
    .to_writer(&mut buf)?;

    if has_dyld_info {
        DyldInfoCommand {
            bind_off: bind_off as u32,
            bind_size: bind_info.len() as u32,
            export_off: export_off as u32,
            export_size: export_info.len() as u32,
        }
        .to_writer(&mut buf)?;
    }

    EntryPointCommand {
        entryoff: entry - base,
        stacksize: 0,
    }
    .to_writer(&mut buf)?;

    DylinkerCommand {
        path: DYLINKER_PATH.into(),
    }
    .to_writer(&mut buf)?;

    DylibCommand {
        path: LIBSYSTEM_PATH.into(),
    }
    .to_writer(&mut buf)?;

    SymtabCommand {
        symoff: symoff as u32,
        nsyms: nlist.len() as u32,
        stroff: stroff as u32,
        strsize: strings.len() as u32,
    }
    .to_writer(&mut buf)?;

    DysymtabCommand {
        ilocalsym: 0,
        nlocalsym,
        iextdefsym: nlocalsym,
        nextdefsym,
        iundefsym,
        nundefsym,
        indirectsymoff: indirectsymoff as u32,
        nindirectsyms: indirect.len() as u32,
        extreloff: if extrel.is_empty() { 0 } else { extrel_off as u32 },
        nextrel: extrel.len() as u32,
    }
    .to_writer(&mut buf)?;

    UuidCommand {
        uuid: derive_uuid(entry, text_size_total),
    }
    .to_writer(&mut buf)?;

    BuildVersionCommand {
        platform: 1,
        minos: 0x000D_0000,
        sdk: 0x000D_0000,
    }
    .to_writer(&mut buf)?;

    debug_assert_eq!(buf.len(), MachHeader::SIZE + sizeofcmds as usize);
    debug!("{} load commands, {sizeofcmds} command bytes", ncmds);

    // Segment payloads at their vm-congruent file offsets
    for section in segments
        .text
        .iter()
        .chain(segments.data_const.iter())
        .chain(segments.data.iter())
    {
        if section.kind.is_zero_fill() {
            continue;
        }
        pad_to(&mut buf, (section.vaddr - base) as usize);
        buf.extend_from_slice(&section.data);
    }

    // __LINKEDIT payload
    pad_to(&mut buf, bind_off as usize);
    buf.extend_from_slice(&bind_info);
    pad_to(&mut buf, export_off as usize);
    buf.extend_from_slice(&export_info);
    pad_to(&mut buf, extrel_off as usize);
    for entry in &extrel {
        entry.to_writer(&mut buf)?;
    }
    pad_to(&mut buf, symoff as usize);
    for entry in &nlist {
        entry.to_writer(&mut buf)?;
    }
    pad_to(&mut buf, indirectsymoff as usize);
    for index in &indirect {
        buf.extend_from_slice(&index.to_le_bytes());
    }
    pad_to(&mut buf, stroff as usize);
    buf.extend_from_slice(strings.bytes());

    Ok(buf)
}
