// SPDX-License-Identifier: MPL-2.0

//! The prelude of the frame crate.

pub type Result<T> = core::result::Result<T, crate::error::Error>;

pub(crate) use alloc::boxed::Box;
pub(crate) use alloc::sync::Arc;
pub(crate) use alloc::vec;
pub(crate) use alloc::vec::Vec;

pub use crate::mm::{FrameNumber, Paddr, Vaddr};
pub use crate::{print, println};
