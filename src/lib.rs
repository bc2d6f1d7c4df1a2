//! A static linker for ELF and Mach-O executables
//!
//! Consumes relocatable object files, resolves symbols, merges and places
//! sections, patches relocations, and synthesizes a runnable image:
//! Mach-O/ARM64 with full dynamic-link info (stubs, GOT, bind opcodes,
//! indirect symbol table), or ELF for x86-64 and ARM64.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use std::io::Write;

use log::info;
use typed_builder::TypedBuilder;

use base::{Format, Machine, MergedSection, Object, SectionKind};
use dynlink::DynLinkPlan;
use error::Error;
use reloc::ExternalRelocation;
use resolve::SymbolDirectory;

pub mod arch;
pub mod base;
pub mod dynlink;
pub mod error;
pub mod image;
pub mod layout;
pub mod reader;
pub mod reloc;
pub mod resolve;

/// Encode an instance of a type to a writer
pub trait ToWriter<W>
where
    W: Write,
    Self: Sized,
{
    /// The error type for this operation
    type Error;

    /// Encode an instance of this type to a writer
    fn to_writer(&self, writer: &mut W) -> Result<(), Self::Error>;
}

/// A type which always has a known size when written to a writer
pub trait HasWrittenSize {
    /// The size when written
    const SIZE: usize;
}

#[derive(Debug, Clone, TypedBuilder)]
/// A configuration for one link. Debug toggles are explicit fields set
/// during construction; the core never reads the environment.
pub struct Config {
    /// The output container format
    pub format: Format,
    /// The output machine
    pub machine: Machine,
    #[builder(default)]
    /// Produce a position-independent executable
    pub pie: bool,
    #[builder(default, setter(strip_option))]
    /// Override the image base address (ELF output)
    pub base_addr: Option<u64>,
    #[builder(default)]
    /// Trace thread-local relocation patching
    pub macho_tlv_debug: bool,
    #[builder(default)]
    /// Trace GOT and stub relocation patching
    pub macho_got_debug: bool,
}

impl Config {
    /// The effective image base address
    pub fn base(&self) -> u64 {
        match self.format {
            Format::Elf => self
                .base_addr
                .unwrap_or(if self.pie { 0 } else { layout::ELF_BASE }),
            Format::MachO => layout::MACHO_BASE,
        }
    }

    /// The entry-point symbol name for the output format
    pub fn entry_symbol(&self) -> &'static str {
        match self.format {
            Format::Elf => "_start",
            Format::MachO => "_main",
        }
    }
}

/// The linker context: owns the objects and every intermediate structure
/// of the pipeline. Each phase reads and mutates it exclusively in its own
/// stage; all structures are freed together at pipeline end.
#[derive(Debug)]
pub struct Linker {
    config: Config,
    objects: Vec<Object>,
    merged: Vec<MergedSection>,
    directory: SymbolDirectory,
    plan: DynLinkPlan,
    externals: Vec<ExternalRelocation>,
}

impl Linker {
    /// Create an empty context for `config`
    pub fn new(config: Config) -> Self {
        Linker {
            config,
            objects: Vec::new(),
            merged: Vec::new(),
            directory: SymbolDirectory::new(),
            plan: DynLinkPlan::default(),
            externals: Vec::new(),
        }
    }

    /// Insert a parsed object; its owning-object indices are rewritten to
    /// its position in the context
    pub fn add_object(&mut self, mut object: Object) {
        let index = self.objects.len();
        for section in &mut object.sections {
            section.object = index;
        }
        for relocation in &mut object.relocations {
            relocation.object = index;
        }
        self.objects.push(object);
    }

    /// The finalized address of the merged section of `kind`, if placed
    fn section_vaddr(&self, kind: SectionKind) -> Option<u64> {
        self.merged
            .iter()
            .find(|section| section.kind == kind)
            .map(|section| section.vaddr)
    }

    /// Run the pipeline to completion and return the image bytes
    ///
    /// Each phase collects its complete error vector; the first phase with
    /// a non-empty vector fails the link and its whole diagnostic set is
    /// returned.
    pub fn link(mut self) -> Result<Vec<u8>, Vec<Error>> {
        // A synthesized startup object supplies _start for ELF output when
        // no input defines it.
        if self.config.format == Format::Elf
            && !self
                .objects
                .iter()
                .flat_map(|object| object.symbols.iter())
                .any(|symbol| symbol.is_defined && symbol.name == "_start")
        {
            info!("synthesizing startup code for {:?}", self.config.machine);
            let index = self.objects.len();
            self.objects
                .push(arch::startup_object(self.config.machine, index));
        }

        let (directory, errors) = resolve::resolve(&mut self.objects);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.directory = directory;

        if self.config.format == Format::MachO {
            self.plan = dynlink::plan(&self.objects);
        }

        self.merged = layout::merge(
            &mut self.objects,
            self.config.format,
            self.plan.stub_count(),
            self.plan.got_count(),
        )?;

        let base = self.config.base();
        let text_start = match self.config.format {
            Format::Elf => base + layout::ELF_PAGE_SIZE,
            Format::MachO => {
                let has_dyld_info = image::macho::wants_dyld_info(&self.merged, &self.plan);
                base + image::macho::MachHeader::SIZE as u64
                    + u64::from(image::macho::load_commands_size(&self.merged, has_dyld_info))
            }
        };
        layout::assign_addresses(
            &mut self.merged,
            &mut self.objects,
            self.config.format,
            text_start,
        );

        let errors = layout::finalize_symbols(&mut self.objects);
        if !errors.is_empty() {
            return Err(errors);
        }

        if self.plan.stub_count() > 0 {
            let (Some(stubs_vaddr), Some(got_vaddr)) = (
                self.section_vaddr(SectionKind::Stubs),
                self.section_vaddr(SectionKind::Got),
            ) else {
                return Err(vec![Error::InvalidSection {
                    object: 0,
                    section: 0,
                }]);
            };
            let stubs = self
                .merged
                .iter_mut()
                .filter(|section| section.kind == SectionKind::Stubs)
                .map(|section| &mut section.data);
            for data in stubs {
                let errors =
                    dynlink::materialize_stubs(&self.plan, stubs_vaddr, got_vaddr, data);
                if !errors.is_empty() {
                    return Err(errors);
                }
            }
        }

        let context = reloc::RelocationContext {
            format: self.config.format,
            directory: &self.directory,
            plan: &self.plan,
            stubs_vaddr: self.section_vaddr(SectionKind::Stubs),
            got_vaddr: self.section_vaddr(SectionKind::Got),
            got_debug: self.config.macho_got_debug,
            tlv_debug: self.config.macho_tlv_debug,
        };
        let (externals, errors) = reloc::process(&self.objects, &mut self.merged, &context);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.externals = externals;

        let entry_name = self.config.entry_symbol();
        let entry = self
            .directory
            .get(entry_name)
            .or_else(|| self.directory.get(entry_name.trim_start_matches('_')))
            .and_then(|definition| {
                self.objects[definition.object].symbols[definition.symbol].final_address
            })
            .ok_or(vec![Error::MissingEntryPoint {
                name: entry_name.to_string(),
            }])?;
        info!("entry point {entry_name} at {entry:#x}");

        let image = match self.config.format {
            Format::Elf => image::elf::write(
                &self.objects,
                &self.merged,
                &self.directory,
                &image::elf::ElfWriteParams {
                    machine: self.config.machine,
                    pie: self.config.pie,
                    base,
                    entry,
                },
            ),
            Format::MachO => image::macho::write(
                &self.objects,
                &self.merged,
                &self.directory,
                &self.plan,
                &self.externals,
                entry,
            ),
        }
        .map_err(|error| vec![error])?;
        Ok(image)
    }
}

/// Link `objects` under `config` and return the image bytes
pub fn link(objects: Vec<Object>, config: Config) -> Result<Vec<u8>, Vec<Error>> {
    let mut linker = Linker::new(config);
    for object in objects {
        linker.add_object(object);
    }
    linker.link()
}

/// Link `objects` under `config` and write the image to `path`, mode 0755
///
/// The file is only written when every phase succeeded.
pub fn link_to_file<P: AsRef<std::path::Path>>(
    objects: Vec<Object>,
    config: Config,
    path: P,
) -> Result<(), Vec<Error>> {
    let image = link(objects, config)?;
    image::write_output_file(path, &image).map_err(|error| vec![error])
}
