//! Architecture specific instruction encoders for x86-64

use crate::arch::PatchError;
use crate::base::{
    Format, Machine, Object, Relocation, RelocationKind, RelocationTarget, Section, SectionFlags,
    SectionKind, Symbol, SymbolBinding, SymbolKind,
};

/// Store a signed 32-bit immediate at `offset`
pub fn patch_imm32(buf: &mut [u8], offset: usize, value: i64) -> Result<(), PatchError> {
    let narrowed = i32::try_from(value).map_err(|_| PatchError::Overflow { value })?;
    let bytes = buf
        .get_mut(offset..offset + 4)
        .ok_or(PatchError::OutOfBounds)?;
    bytes.copy_from_slice(&narrowed.to_le_bytes());
    Ok(())
}

/// Store a 64-bit immediate at `offset`
pub fn patch_imm64(buf: &mut [u8], offset: usize, value: i64) -> Result<(), PatchError> {
    let bytes = buf
        .get_mut(offset..offset + 8)
        .ok_or(PatchError::OutOfBounds)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Store a 32-bit PC-relative displacement at `offset`
///
/// The caller passes the final displacement; no implicit adjustment is
/// applied here.
pub fn patch_rel32(buf: &mut [u8], offset: usize, value: i64) -> Result<(), PatchError> {
    patch_imm32(buf, offset, value)
}

/// Startup code: `xor ebp,ebp; call main; mov rdi,rax; mov rax,60; syscall`
const STARTUP_CODE: [u8; 19] = [
    0x31, 0xED, // xor ebp, ebp
    0xE8, 0x00, 0x00, 0x00, 0x00, // call main
    0x48, 0x89, 0xC7, // mov rdi, rax
    0x48, 0xC7, 0xC0, 0x3C, 0x00, 0x00, 0x00, // mov rax, 60
    0x0F, 0x05, // syscall
];

/// Build the synthesized `_start` object for x86-64 ELF output
pub fn startup_object(object_index: usize) -> Object {
    Object::builder()
        .name("<startup:x86_64>")
        .format(Format::Elf)
        .machine(Machine::X86_64)
        .sections(vec![Section::builder()
            .name(".text")
            .kind(SectionKind::Text)
            .size(STARTUP_CODE.len() as u64)
            .align(16)
            .flags(SectionFlags::ALLOCATABLE | SectionFlags::EXECUTABLE)
            .content(STARTUP_CODE.to_vec())
            .object(object_index)
            .build()])
        .symbols(vec![
            Symbol::builder()
                .name("_start")
                .kind(SymbolKind::Func)
                .binding(SymbolBinding::Global)
                .section(0)
                .size(STARTUP_CODE.len() as u64)
                .is_defined(true)
                .build(),
            Symbol::builder().name("main").kind(SymbolKind::Func).build(),
        ])
        .relocations(vec![Relocation::builder()
            .offset(3)
            .addend(-4)
            .target(RelocationTarget::Symbol(1))
            .section(0)
            .kind(RelocationKind::X64Plt32)
            .object(object_index)
            .build()])
        .build()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_imm32_in_range() {
        let mut buf = vec![0xAAu8; 8];
        patch_imm32(&mut buf, 2, -2).unwrap();
        assert_eq!(&buf, &[0xAA, 0xAA, 0xFE, 0xFF, 0xFF, 0xFF, 0xAA, 0xAA]);
    }

    #[test]
    fn test_imm32_overflow() {
        let mut buf = vec![0u8; 8];
        assert_eq!(
            patch_imm32(&mut buf, 0, i64::from(i32::MAX) + 1),
            Err(PatchError::Overflow {
                value: i64::from(i32::MAX) + 1
            })
        );
        assert_eq!(
            patch_imm32(&mut buf, 0, i64::from(i32::MIN) - 1),
            Err(PatchError::Overflow {
                value: i64::from(i32::MIN) - 1
            })
        );
    }

    #[test]
    fn test_imm64() {
        let mut buf = vec![0u8; 8];
        patch_imm64(&mut buf, 0, 0x0102030405060708).unwrap();
        assert_eq!(&buf, &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_imm64_out_of_bounds() {
        let mut buf = vec![0u8; 7];
        assert_eq!(
            patch_imm64(&mut buf, 0, 0),
            Err(PatchError::OutOfBounds)
        );
    }

    #[test]
    fn test_startup_object_shape() {
        let object = startup_object(3);
        assert_eq!(object.sections.len(), 1);
        assert_eq!(object.sections[0].kind, SectionKind::Text);
        assert_eq!(object.symbols[0].name, "_start");
        assert!(object.symbols[0].is_defined);
        assert_eq!(object.symbols[1].name, "main");
        assert!(!object.symbols[1].is_defined);
        // The call displacement sits directly after the E8 opcode.
        assert_eq!(object.sections[0].content.as_ref().unwrap()[2], 0xE8);
        assert_eq!(object.relocations[0].offset, 3);
        assert_eq!(object.relocations[0].addend, -4);
    }
}
