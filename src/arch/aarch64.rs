//! Architecture specific instruction encoders for AArch64
//!
//! Every encoder rewrites only the immediate field of the 32-bit
//! instruction word at the patch site; all other bits are preserved.

use crate::arch::{read_word, write_word, PatchError};
use crate::base::{
    Format, Machine, Object, Relocation, RelocationKind, RelocationTarget, Section, SectionFlags,
    SectionKind, Symbol, SymbolBinding, SymbolKind,
};

/// The size of one external-call stub in bytes (three instructions)
pub const STUB_SIZE: u64 = 12;

/// Store a 64-bit value at `offset`
pub fn patch_abs64(buf: &mut [u8], offset: usize, value: i64) -> Result<(), PatchError> {
    let bytes = buf
        .get_mut(offset..offset + 8)
        .ok_or(PatchError::OutOfBounds)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Patch the 26-bit displacement of a B or BL instruction
///
/// `value` is the byte displacement from the instruction to the target; it
/// must be 4-byte aligned and fit the signed 28-bit byte range.
pub fn patch_branch26(buf: &mut [u8], offset: usize, value: i64) -> Result<(), PatchError> {
    if value & 3 != 0 {
        return Err(PatchError::Misaligned {
            value: value as u64,
            required: 4,
        });
    }
    if !(-(1 << 27)..(1 << 27)).contains(&value) {
        return Err(PatchError::Overflow { value });
    }
    let imm26 = ((value >> 2) as u32) & 0x03FF_FFFF;
    let word = read_word(buf, offset)?;
    write_word(buf, offset, (word & 0xFC00_0000) | imm26)
}

/// Patch the 21-bit signed page delta of an ADRP instruction
///
/// The delta is `(target >> 12) - (pc >> 12)` in 4 KiB pages, split into
/// immlo at bits [30:29] and immhi at bits [23:5].
pub fn patch_adrp(buf: &mut [u8], offset: usize, target: u64, pc: u64) -> Result<(), PatchError> {
    let delta_pages = ((target >> 12) as i64) - ((pc >> 12) as i64);
    if !(-(1 << 20)..(1 << 20)).contains(&delta_pages) {
        return Err(PatchError::Overflow { value: delta_pages });
    }
    let imm = delta_pages as u32;
    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;
    let word = read_word(buf, offset)?;
    write_word(buf, offset, (word & !(0x6000_0000 | 0x00FF_FFE0)) | immlo | immhi)
}

/// Patch the unshifted 12-bit immediate of an ADD instruction
///
/// The low 12 bits of `value` land in bits [21:10]; the shift bit at [22]
/// is preserved.
pub fn patch_add_imm12(buf: &mut [u8], offset: usize, value: u64) -> Result<(), PatchError> {
    let imm12 = (value & 0xFFF) as u32;
    let word = read_word(buf, offset)?;
    write_word(buf, offset, (word & !(0xFFF << 10)) | (imm12 << 10))
}

/// Patch the scaled 12-bit immediate of a 64-bit LDR/STR instruction
///
/// The low 12 bits of `value` must be 8-byte aligned; the scaled immediate
/// `low12 >> 3` lands in bits [21:10].
pub fn patch_ldr_imm12_scaled(buf: &mut [u8], offset: usize, value: u64) -> Result<(), PatchError> {
    let low12 = value & 0xFFF;
    if low12 & 7 != 0 {
        return Err(PatchError::Misaligned {
            value: low12,
            required: 8,
        });
    }
    let imm12 = (low12 >> 3) as u32;
    let word = read_word(buf, offset)?;
    write_word(buf, offset, (word & !(0xFFF << 10)) | (imm12 << 10))
}

/// Whether the instruction word at `offset` is a 64-bit LDR/STR with an
/// unsigned scaled immediate (as opposed to an ADD immediate)
pub fn is_ldst64_imm(buf: &[u8], offset: usize) -> bool {
    match read_word(buf, offset) {
        Ok(word) => word & 0xFFC0_0000 == 0xF940_0000 || word & 0xFFC0_0000 == 0xF900_0000,
        Err(_) => false,
    }
}

/// Emit the three-instruction stub for one external call target
///
/// `ADRP x16, <page of GOT slot>; LDR x16, [x16, #<slot offset>]; BR x16`
pub fn stub_code(stub_addr: u64, got_addr: u64) -> Result<[u8; STUB_SIZE as usize], PatchError> {
    let mut code = [0u8; STUB_SIZE as usize];
    // ADRP x16, page(got_addr)
    write_word(&mut code, 0, 0x9000_0010)?;
    patch_adrp(&mut code, 0, got_addr, stub_addr)?;
    // LDR x16, [x16, #(got_addr & 0xFFF)]
    write_word(&mut code, 4, 0xF940_0210)?;
    patch_ldr_imm12_scaled(&mut code, 4, got_addr)?;
    // BR x16
    write_word(&mut code, 8, 0xD61F_0000 | (16 << 5))?;
    Ok(code)
}

/// Startup code: `mov x29,#0; bl main; mov x8,#93; svc #0`
const STARTUP_CODE: [u32; 4] = [
    0xD280_001D, // mov x29, #0
    0x9400_0000, // bl main
    0xD280_0BA8, // mov x8, #93
    0xD400_0001, // svc #0
];

/// Build the synthesized `_start` object for ARM64 ELF output
pub fn startup_object(object_index: usize) -> Object {
    let content: Vec<u8> = STARTUP_CODE
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    Object::builder()
        .name("<startup:aarch64>")
        .format(Format::Elf)
        .machine(Machine::Arm64)
        .sections(vec![Section::builder()
            .name(".text")
            .kind(SectionKind::Text)
            .size(content.len() as u64)
            .align(4)
            .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
            .content(content)
            .object(object_index)
            .build()])
        .symbols(vec![
            Symbol::builder()
                .name("_start")
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .section(0)
                .size(16)
                .is_defined(true)
                .build(),
            Symbol::builder().name("main").kind(SymbolKind::Func).build(),
        ])
        .relocations(vec![Relocation::builder()
            .offset(4)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::Arm64Call26)
            .object(object_index)
            .build()])
        .build()
}
