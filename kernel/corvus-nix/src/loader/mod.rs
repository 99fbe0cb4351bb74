// SPDX-License-Identifier: MPL-2.0

//! The kernel module loader and the kernel symbol table.

pub mod ksymbols;
pub mod module;
