//! Error types for linking failures

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Hash)]
/// Error type for errors during linking
pub enum Error {
    #[error("An I/O error occurred: {kind}")]
    /// An I/O error at the image-writer boundary
    Io {
        /// The kind of I/O error
        kind: std::io::ErrorKind,
    },
    #[error("Duplicate definition of symbol {name} (objects {first_object} and {second_object})")]
    /// Two objects both provide a GLOBAL definition for the same name
    DuplicateDefinition {
        /// The multiply-defined symbol name
        name: String,
        /// Index of the object holding the first definition
        first_object: usize,
        /// Index of the object holding the second definition
        second_object: usize,
    },
    #[error("Undefined symbol {name} (referenced by object {object})")]
    /// A referenced symbol has no definition and is not a runtime symbol
    UndefinedSymbol {
        /// The unresolved symbol name
        name: String,
        /// Index of the referencing object
        object: usize,
    },
    #[error("Conflicting weak definitions of symbol {name}")]
    /// Reserved for weak-definition policies beyond first-wins
    WeakSymbolConflict {
        /// The conflicting symbol name
        name: String,
    },
    #[error("Mismatched types for symbol {name}")]
    /// Reserved for definition/reference type disagreement
    TypeMismatch {
        /// The mismatched symbol name
        name: String,
    },
    #[error("Allocation of {size} bytes failed")]
    /// A heap reservation could not be satisfied
    AllocationFailed {
        /// The size of the failed reservation
        size: usize,
    },
    #[error("Relocation value {value:#x} for {kind:?} overflows its field at object {object} section {section} offset {offset:#x} (symbol {symbol:?})")]
    /// A computed relocation value does not fit the target field width
    RangeOverflow {
        /// The computed value
        value: i64,
        /// The relocation kind whose field overflowed
        kind: crate::base::RelocationKind,
        /// The target symbol name, when the relocation names one
        symbol: Option<String>,
        /// Index of the owning object
        object: usize,
        /// Index of the source section
        section: usize,
        /// Offset of the patch site within the source section
        offset: u64,
    },
    #[error("Invalid value {value} for {what}")]
    /// A field held a value outside its defined set
    InvalidType {
        /// The invalid raw value
        value: u64,
        /// The field the value was read for
        what: &'static str,
    },
    #[error("Misaligned value {value:#x} (required alignment {required})")]
    /// A value violated a required alignment
    Alignment {
        /// The misaligned value
        value: u64,
        /// The alignment the value must satisfy
        required: u64,
    },
    #[error("Invalid section {section} in object {object}")]
    /// A section index does not resolve within its owning object
    InvalidSection {
        /// Index of the owning object
        object: usize,
        /// The out-of-range section index
        section: usize,
    },
    #[error("Failed to patch {kind:?} at object {object} section {section} offset {offset:#x}")]
    /// An instruction encoder rejected a patch site
    PatchFailed {
        /// The relocation kind being patched
        kind: crate::base::RelocationKind,
        /// Index of the owning object
        object: usize,
        /// Index of the source section
        section: usize,
        /// Offset of the patch site within the source section
        offset: u64,
    },
    #[error("Invalid object file {name}: {reason}")]
    /// An input could not be parsed into the intermediate representation
    InvalidObject {
        /// The source file name
        name: String,
        /// Why parsing failed
        reason: String,
    },
    #[error("No entry point symbol {name} in any input")]
    /// The entry symbol was not defined by any object
    MissingEntryPoint {
        /// The entry symbol name
        name: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io { kind: value.kind() }
    }
}

/// Result type alias for linking operations
pub type Result<T> = std::result::Result<T, Error>;
