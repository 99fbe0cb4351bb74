// SPDX-License-Identifier: MPL-2.0

//! Access to user and kernel virtual memory.
//!
//! User pointers are validated with commit checks that drive the real
//! page-fault path, so demand allocation and copy-on-write breaks happen
//! exactly as they would on hardware. Faults on kernel pointers are
//! fatal; faults on user pointers surface as `Error::PageFault`.

use super::context::MemContext;
use super::page_fault::{handle_page_fault, PageFaultCode, PageFaultInfo};
use super::page_table::{self, PteFlags};
use super::physical;
use super::Vaddr;
use crate::config::{KERNEL_BASE, PAGE_SIZE};
use crate::error::Error;
use crate::prelude::Result;

/// Ensures that `[addr, addr + len)` of the current context can be read,
/// faulting pages in on demand.
pub fn commit_for_read(addr: Vaddr, len: usize) -> Result<()> {
    commit(addr, len, false)
}

/// Ensures that `[addr, addr + len)` of the current context can be
/// written, faulting pages in and breaking copy-on-write shares.
pub fn commit_for_write(addr: Vaddr, len: usize) -> Result<()> {
    commit(addr, len, true)
}

fn commit(addr: Vaddr, len: usize, for_write: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(Error::PageFault)?;
    if end > KERNEL_BASE {
        return Err(Error::PageFault);
    }

    let ctx = MemContext::current();
    let dir = ctx.dir();
    let mut page = addr & !(PAGE_SIZE - 1);
    while page < end {
        // Retry the access like the hardware would: a demand-paged
        // mapping may still need a write-protection fault to follow.
        let mut retries = 0;
        loop {
            match page_table::translate(dir, page) {
                Some(pte) if !for_write || pte.flags().contains(PteFlags::WRITABLE) => break,
                Some(_) => {
                    handle_page_fault(&PageFaultInfo {
                        addr: page,
                        code: PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT,
                    })?;
                }
                None => {
                    let mut code = PageFaultCode::USER;
                    if for_write {
                        code |= PageFaultCode::WRITE;
                    }
                    handle_page_fault(&PageFaultInfo { addr: page, code })?;
                }
            }
            retries += 1;
            if retries > 2 {
                return Err(Error::PageFault);
            }
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Copies bytes out of the current context's user memory.
pub fn read_bytes(addr: Vaddr, buf: &mut [u8]) -> Result<()> {
    commit_for_read(addr, buf.len())?;
    let dir = MemContext::current().dir();
    let mut done = 0;
    while done < buf.len() {
        let vaddr = addr + done;
        let page_off = vaddr % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
        let frame = page_table::translate(dir, vaddr)
            .ok_or(Error::PageFault)?
            .frame();
        physical::copy_from_frame(frame, page_off, &mut buf[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copies bytes into the current context's user memory.
pub fn write_bytes(addr: Vaddr, buf: &[u8]) -> Result<()> {
    commit_for_write(addr, buf.len())?;
    let dir = MemContext::current().dir();
    let mut done = 0;
    while done < buf.len() {
        let vaddr = addr + done;
        let page_off = vaddr % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
        let frame = page_table::translate(dir, vaddr)
            .ok_or(Error::PageFault)?
            .frame();
        physical::copy_into_frame(frame, page_off, &buf[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copies bytes out of kernel virtual memory. An unmapped kernel address
/// is fatal.
pub fn read_kernel_bytes(addr: Vaddr, buf: &mut [u8]) {
    let mut done = 0;
    while done < buf.len() {
        let vaddr = addr + done;
        let page_off = vaddr % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
        let frame = page_table::translate_kernel(vaddr)
            .unwrap_or_else(|| panic!("kernel read fault at {:#x}", vaddr))
            .frame();
        physical::copy_from_frame(frame, page_off, &mut buf[done..done + chunk]);
        done += chunk;
    }
}

/// Copies bytes into kernel virtual memory. An unmapped kernel address
/// is fatal.
pub fn write_kernel_bytes(addr: Vaddr, buf: &[u8]) {
    let mut done = 0;
    while done < buf.len() {
        let vaddr = addr + done;
        let page_off = vaddr % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
        let frame = page_table::translate_kernel(vaddr)
            .unwrap_or_else(|| panic!("kernel write fault at {:#x}", vaddr))
            .frame();
        physical::copy_into_frame(frame, page_off, &buf[done..done + chunk]);
        done += chunk;
    }
}

/// A source of bytes living either in a kernel buffer or in the current
/// context's user memory.
pub enum VmReader<'a> {
    Kernel { buf: &'a [u8], pos: usize },
    User { addr: Vaddr, len: usize, pos: usize },
}

impl<'a> VmReader<'a> {
    pub fn from_kernel(buf: &'a [u8]) -> Self {
        VmReader::Kernel { buf, pos: 0 }
    }

    pub fn from_user(addr: Vaddr, len: usize) -> Self {
        VmReader::User { addr, len, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        match self {
            VmReader::Kernel { buf, pos } => buf.len() - pos,
            VmReader::User { len, pos, .. } => len - pos,
        }
    }

    /// Validates that the next `len` bytes can be read.
    pub fn commit(&self, len: usize) -> Result<()> {
        match self {
            VmReader::Kernel { .. } => Ok(()),
            VmReader::User { addr, pos, .. } => commit_for_read(addr + pos, len),
        }
    }

    /// Reads exactly `dst.len()` bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.remaining() {
            return Err(Error::InvalidArgs);
        }
        match self {
            VmReader::Kernel { buf, pos } => {
                dst.copy_from_slice(&buf[*pos..*pos + dst.len()]);
                *pos += dst.len();
            }
            VmReader::User { addr, pos, .. } => {
                read_bytes(*addr + *pos, dst)?;
                *pos += dst.len();
            }
        }
        Ok(())
    }
}

/// A sink of bytes living either in a kernel buffer or in the current
/// context's user memory.
pub enum VmWriter<'a> {
    Kernel { buf: &'a mut [u8], pos: usize },
    User { addr: Vaddr, len: usize, pos: usize },
}

impl<'a> VmWriter<'a> {
    pub fn from_kernel(buf: &'a mut [u8]) -> Self {
        VmWriter::Kernel { buf, pos: 0 }
    }

    pub fn from_user(addr: Vaddr, len: usize) -> Self {
        VmWriter::User { addr, len, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        match self {
            VmWriter::Kernel { buf, pos } => buf.len() - pos,
            VmWriter::User { len, pos, .. } => len - pos,
        }
    }

    pub fn written(&self) -> usize {
        match self {
            VmWriter::Kernel { pos, .. } | VmWriter::User { pos, .. } => *pos,
        }
    }

    /// Validates that the next `len` bytes can be written.
    pub fn commit(&self, len: usize) -> Result<()> {
        match self {
            VmWriter::Kernel { .. } => Ok(()),
            VmWriter::User { addr, pos, .. } => commit_for_write(addr + pos, len),
        }
    }

    /// Writes all of `src`.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.remaining() {
            return Err(Error::InvalidArgs);
        }
        match self {
            VmWriter::Kernel { buf, pos } => {
                buf[*pos..*pos + src.len()].copy_from_slice(src);
                *pos += src.len();
            }
            VmWriter::User { addr, pos, .. } => {
                write_bytes(*addr + *pos, src)?;
                *pos += src.len();
            }
        }
        Ok(())
    }
}
