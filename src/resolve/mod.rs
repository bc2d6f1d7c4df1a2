//! Global symbol resolution
//!
//! Two passes over the object set: a define pass that builds the global
//! symbol directory under GLOBAL/WEAK precedence, and a bind pass that
//! attaches every undefined reference to its defining object or marks it as
//! runtime-provided. Both passes collect their complete error vector
//! instead of short-circuiting, so a single run yields a maximal
//! diagnostic set.

use std::collections::HashMap;

use log::debug;

use crate::base::{Object, Resolution, SymbolBinding};
use crate::error::Error;

/// The winning definition for a global name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDefinition {
    /// Index of the defining object
    pub object: usize,
    /// Index of the defining symbol within that object
    pub symbol: usize,
    /// The binding the definition was inserted with
    pub binding: SymbolBinding,
}

/// Name-to-definition directory with O(1) average lookup
pub type SymbolDirectory = HashMap<String, GlobalDefinition>;

/// Symbols the target runtime provides at load time
///
/// Undefined references that miss the directory but match this predicate
/// are bound to the runtime instead of failing the link.
const RUNTIME_SYMBOLS: &[&str] = &[
    "abort",
    "atexit",
    "calloc",
    "close",
    "dyld_stub_binder",
    "exit",
    "fflush",
    "fopen",
    "fprintf",
    "fread",
    "free",
    "fwrite",
    "getenv",
    "malloc",
    "memcmp",
    "memcpy",
    "memmove",
    "memset",
    "open",
    "printf",
    "putchar",
    "puts",
    "read",
    "realloc",
    "scanf",
    "snprintf",
    "sprintf",
    "strcat",
    "strcmp",
    "strcpy",
    "strlen",
    "strncmp",
    "strncpy",
    "write",
];

/// Name prefixes the target runtime provides wholesale
const RUNTIME_PREFIXES: &[&str] = &["_tlv_", "dispatch_", "objc_", "pthread_"];

/// Whether `name` is provided by the target runtime at load time
pub fn is_runtime_symbol(name: &str) -> bool {
    let bare = name.strip_prefix('_').unwrap_or(name);
    RUNTIME_SYMBOLS.binary_search(&bare).is_ok()
        || RUNTIME_PREFIXES.iter().any(|prefix| bare.starts_with(prefix))
}

/// Build the global symbol directory and bind every undefined reference
///
/// Returns the directory together with the complete error vector; a
/// non-empty vector fails the overall link.
pub fn resolve(objects: &mut [Object]) -> (SymbolDirectory, Vec<Error>) {
    let mut directory = SymbolDirectory::new();
    let mut errors = Vec::new();

    // Define pass: GLOBAL beats WEAK, first WEAK wins, GLOBAL x GLOBAL is
    // a duplicate definition.
    for (object_index, object) in objects.iter().enumerate() {
        for (symbol_index, symbol) in object.symbols.iter().enumerate() {
            if !symbol.is_defined
                || !matches!(symbol.binding, SymbolBinding::Global | SymbolBinding::Weak)
            {
                continue;
            }
            match directory.get(&symbol.name) {
                None => {
                    directory.insert(
                        symbol.name.clone(),
                        GlobalDefinition {
                            object: object_index,
                            symbol: symbol_index,
                            binding: symbol.binding,
                        },
                    );
                }
                Some(existing) => match (existing.binding, symbol.binding) {
                    (SymbolBinding::Global, SymbolBinding::Global) => {
                        errors.push(Error::DuplicateDefinition {
                            name: symbol.name.clone(),
                            first_object: existing.object,
                            second_object: object_index,
                        });
                    }
                    (SymbolBinding::Weak, SymbolBinding::Global) => {
                        directory.insert(
                            symbol.name.clone(),
                            GlobalDefinition {
                                object: object_index,
                                symbol: symbol_index,
                                binding: SymbolBinding::Global,
                            },
                        );
                    }
                    // GLOBAL over new WEAK, and first WEAK over later WEAK
                    (SymbolBinding::Global, SymbolBinding::Weak)
                    | (SymbolBinding::Weak, SymbolBinding::Weak) => {}
                    (SymbolBinding::Local, _) | (_, SymbolBinding::Local) => {}
                },
            }
        }
    }

    // Bind pass: attach each undefined reference to its defining object,
    // or to the runtime when the name matches the runtime predicate.
    for (object_index, object) in objects.iter_mut().enumerate() {
        for symbol in object.symbols.iter_mut() {
            if symbol.is_defined {
                continue;
            }
            if let Some(definition) = directory.get(&symbol.name) {
                symbol.resolution = Resolution::Defined(definition.object);
            } else if is_runtime_symbol(&symbol.name) {
                debug!("binding {} to the runtime", symbol.name);
                symbol.resolution = Resolution::Runtime;
            } else {
                errors.push(Error::UndefinedSymbol {
                    name: symbol.name.clone(),
                    object: object_index,
                });
            }
        }
    }

    (directory, errors)
}
