// SPDX-License-Identifier: MPL-2.0

//! Generic containers shared by the kernel crates.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod hash_table;

pub use hash_table::HashTable;
