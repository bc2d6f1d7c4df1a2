//! Architecture specific instruction encoders and startup code

use crate::base::Machine;

pub mod aarch64;
pub mod x86_64;

/// A rejected patch, reported without site context
///
/// The relocation processor attaches the owning object, section and offset
/// when it lifts one of these into a linker error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The value does not fit the target field width
    #[error("value {value:#x} does not fit the target field")]
    Overflow {
        /// The rejected value
        value: i64,
    },
    /// The value violates the encoding's alignment requirement
    #[error("value {value:#x} violates the required alignment {required}")]
    Misaligned {
        /// The rejected value
        value: u64,
        /// The alignment the encoding requires
        required: u64,
    },
    /// The patch site does not lie within the section payload
    #[error("patch site out of bounds")]
    OutOfBounds,
}

/// Read a little-endian 32-bit instruction word at `offset`
pub(crate) fn read_word(buf: &[u8], offset: usize) -> Result<u32, PatchError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(PatchError::OutOfBounds)?;
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(word))
}

/// Store a little-endian 32-bit instruction word at `offset`
pub(crate) fn write_word(buf: &mut [u8], offset: usize, word: u32) -> Result<(), PatchError> {
    let bytes = buf
        .get_mut(offset..offset + 4)
        .ok_or(PatchError::OutOfBounds)?;
    bytes.copy_from_slice(&word.to_le_bytes());
    Ok(())
}

/// The entry-point symbol name for a machine's synthesized startup code
pub fn startup_entry_symbol() -> &'static str {
    "_start"
}

/// Build the synthesized startup object for `machine`
///
/// The object defines `_start`, calls `main`, and exits with `main`'s
/// return value through the platform syscall convention.
pub fn startup_object(machine: Machine, object_index: usize) -> crate::base::Object {
    match machine {
        Machine::X86_64 => x86_64::startup_object(object_index),
        Machine::Arm64 => aarch64::startup_object(object_index),
    }
}
