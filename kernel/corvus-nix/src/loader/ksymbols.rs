// SPDX-License-Identifier: MPL-2.0

//! The global kernel symbol table.
//!
//! Symbols resolve by name to an address, with an optional back-pointer
//! to the module that exports them (the kernel's own symbols carry
//! none). Relocation records a dependency edge for every symbol resolved
//! into another module.

use corvus_util::HashTable;

use super::module::Module;
use crate::prelude::*;

struct KernelSymbol {
    value: u32,
    owner: Option<Weak<Module>>,
}

lazy_static! {
    static ref SYMBOLS: SpinLock<HashTable<KernelSymbol>> = SpinLock::new(HashTable::new());
}

/// Adds a symbol. Duplicate names are rejected.
pub fn add_symbol(name: &str, value: u32, owner: Option<&Arc<Module>>) -> Result<()> {
    let symbol = KernelSymbol {
        value,
        owner: owner.map(Arc::downgrade),
    };
    if !SYMBOLS.lock().insert(name.as_bytes(), symbol) {
        return_errno_with_message!(Errno::EEXIST, "symbol is already defined");
    }
    Ok(())
}

/// Resolves a symbol to its value and owning module.
pub fn lookup(name: &str) -> Option<(u32, Option<Arc<Module>>)> {
    let symbols = SYMBOLS.lock();
    let symbol = symbols.find(name.as_bytes())?;
    Some((
        symbol.value,
        symbol.owner.as_ref().and_then(|owner| owner.upgrade()),
    ))
}

pub fn remove_symbol(name: &str) -> bool {
    SYMBOLS.lock().remove(name.as_bytes()).is_some()
}

/// Drops every symbol exported by `module`.
pub(crate) fn remove_symbols_of(module: &Arc<Module>) {
    SYMBOLS.lock().drain_filter(|_, symbol| {
        symbol
            .owner
            .as_ref()
            .and_then(|owner| owner.upgrade())
            .map(|owner| Arc::ptr_eq(&owner, module))
            .unwrap_or(false)
    });
}
