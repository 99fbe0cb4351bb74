// SPDX-License-Identifier: MPL-2.0

//! Loading of relocatable kernel modules.
//!
//! A module is a position-independent ELF32 relocatable object. The
//! loader lays the loadable sections out in one kernel-virtual buffer
//! (respecting per-section alignment up to a page), resolves undefined
//! symbols against the kernel symbol table, applies `R_386_32` and
//! `R_386_PC32` relocations in place, and records a dependency edge for
//! every symbol resolved into another module.
//!
//! Every module must export `ModuleName` (a NUL-terminated string),
//! `ModuleInit` and `ModuleCleanup`. The init and cleanup entry points
//! are recorded on the descriptor; invoking relocated code is an
//! execution concern outside the software machine model.

use core::sync::atomic::{AtomicUsize, Ordering};

use align_ext::AlignExt;
use corvus_frame::mm::{io, kva};
use xmas_elf::header;
use xmas_elf::sections::{SectionData, ShType};
use xmas_elf::symbol_table::{Binding, Entry};
use xmas_elf::ElfFile;

use super::ksymbols;
use crate::prelude::*;

/// Modules larger than this are rejected outright.
pub const MODULE_MAX_SIZE: usize = 16 * 1024 * 1024;

const SHF_ALLOC: u64 = 0x2;

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xFFF1;
const SHN_COMMON: u16 = 0xFFF2;

const R_386_32: u8 = 1;
const R_386_PC32: u8 = 2;

/// A loaded kernel module.
pub struct Module {
    name: String,
    base: Vaddr,
    size: usize,
    init_addr: u32,
    cleanup_addr: u32,
    args: String,
    deps: SpinLock<Vec<Arc<Module>>>,
    /// Number of other modules whose symbols resolve into this one.
    dep_refs: AtomicUsize,
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Vaddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn init_addr(&self) -> u32 {
        self.init_addr
    }

    pub fn cleanup_addr(&self) -> u32 {
        self.cleanup_addr
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn dep_ref_count(&self) -> usize {
        self.dep_refs.load(Ordering::Relaxed)
    }
}

lazy_static! {
    static ref MODULES: SpinLock<Vec<Arc<Module>>> = SpinLock::new(Vec::new());
}

pub fn module_with_name(name: &str) -> Option<Arc<Module>> {
    MODULES.lock().iter().find(|m| m.name() == name).cloned()
}

/// Loads a module image with a NUL-free argument string.
pub fn load(image: &[u8], args: &str) -> Result<Arc<Module>> {
    if image.len() > MODULE_MAX_SIZE {
        return_errno_with_message!(Errno::EFBIG, "module image exceeds the size cap");
    }

    let elf = ElfFile::new(image)
        .map_err(|_| Error::with_message(Errno::ENOEXEC, "not an ELF image"))?;
    check_header(&elf)?;

    // Lay out the loadable sections.
    let section_count = elf.header.pt2.sh_count() as usize;
    let mut layout: Vec<Option<usize>> = vec![None; section_count];
    let mut total = 0usize;
    for (index, section) in elf.section_iter().enumerate() {
        if section.flags() & SHF_ALLOC == 0 || section.size() == 0 {
            continue;
        }
        let align = (section.align().max(1)) as usize;
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return_errno_with_message!(Errno::ENOEXEC, "unsupported section alignment");
        }
        total = total.align_up(align);
        layout[index] = Some(total);
        total += section.size() as usize;
    }
    if total == 0 {
        return_errno_with_message!(Errno::ENOEXEC, "module has no loadable sections");
    }
    if total > MODULE_MAX_SIZE {
        return_errno_with_message!(Errno::EFBIG, "module sections exceed the size cap");
    }

    let base = kva::alloc(total).map_err(Error::from)?;
    let result = load_into(&elf, base, total, &layout, args);
    if result.is_err() {
        kva::free(base);
    }
    result
}

fn load_into(
    elf: &ElfFile,
    base: Vaddr,
    total: usize,
    layout: &[Option<usize>],
    args: &str,
) -> Result<Arc<Module>> {
    // Copy section contents; NOBITS sections stay zero-initialized.
    for (index, section) in elf.section_iter().enumerate() {
        let Some(offset) = layout[index] else {
            continue;
        };
        if !matches!(section.get_type(), Ok(ShType::NoBits)) {
            io::write_kernel_bytes(base + offset, section.raw_data(elf));
        }
    }

    // Resolve the symbol table.
    let symbols = symbol_entries(elf)?;
    let mut values = vec![0u32; symbols.len()];
    let mut dep_modules: Vec<Arc<Module>> = Vec::new();

    for (index, symbol) in symbols.iter().enumerate() {
        match symbol.shndx() {
            SHN_UNDEF => {
                let name = symbol
                    .get_name(elf)
                    .map_err(|_| Error::new(Errno::ENOEXEC))?;
                if name.is_empty() {
                    continue;
                }
                let Some((value, owner)) = ksymbols::lookup(name) else {
                    error!("module loader: unresolved symbol {}", name);
                    return_errno_with_message!(Errno::ENOENT, "unresolved symbol");
                };
                values[index] = value;
                if let Some(owner) = owner {
                    if !dep_modules.iter().any(|dep| Arc::ptr_eq(dep, &owner)) {
                        dep_modules.push(owner);
                    }
                }
            }
            SHN_COMMON => {
                error!("module loader: COMMON symbols are not supported (hint: pass -d to ld)");
                return_errno!(Errno::ENOEXEC);
            }
            SHN_ABS => values[index] = symbol.value() as u32,
            section_index => {
                let offset = layout
                    .get(section_index as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| Error::new(Errno::ENOEXEC))?;
                values[index] = (base + offset) as u32 + symbol.value() as u32;
            }
        }
    }

    // Apply the relocation tables.
    for section in elf.section_iter() {
        if !matches!(section.get_type(), Ok(ShType::Rel)) {
            continue;
        }
        let Some(target_base) = layout
            .get(section.info() as usize)
            .copied()
            .flatten()
        else {
            // Relocations against non-loaded sections (debug info).
            continue;
        };
        let SectionData::Rel32(entries) = section
            .get_data(elf)
            .map_err(|_| Error::new(Errno::ENOEXEC))?
        else {
            return_errno!(Errno::ENOEXEC);
        };

        for rel in entries {
            let symbol_value = *values
                .get(rel.get_symbol_table_index() as usize)
                .ok_or_else(|| Error::new(Errno::ENOEXEC))?;
            let loc = base + target_base + rel.get_offset() as usize;

            let mut word = [0u8; 4];
            io::read_kernel_bytes(loc, &mut word);
            let mut value = u32::from_le_bytes(word);
            match rel.get_type() {
                R_386_32 => value = value.wrapping_add(symbol_value),
                R_386_PC32 => {
                    value = value.wrapping_add(symbol_value).wrapping_sub(loc as u32)
                }
                _ => {
                    error!("module loader: unsupported relocation type {}", rel.get_type());
                    return_errno!(Errno::ENOEXEC);
                }
            }
            io::write_kernel_bytes(loc, &value.to_le_bytes());
        }
    }

    // Locate the required exports.
    let mut module_name = None;
    let mut init_addr = None;
    let mut cleanup_addr = None;
    let mut exports: Vec<(String, u32)> = Vec::new();
    for (index, symbol) in symbols.iter().enumerate() {
        if !matches!(symbol.get_binding(), Ok(Binding::Global)) || symbol.shndx() == SHN_UNDEF {
            continue;
        }
        let name = symbol
            .get_name(elf)
            .map_err(|_| Error::new(Errno::ENOEXEC))?;
        match name {
            "ModuleName" => module_name = Some(read_kernel_string(values[index] as Vaddr)?),
            "ModuleInit" => init_addr = Some(values[index]),
            "ModuleCleanup" => cleanup_addr = Some(values[index]),
            _ => {}
        }
        exports.push((name.to_string(), values[index]));
    }

    let (Some(name), Some(init_addr), Some(cleanup_addr)) =
        (module_name, init_addr, cleanup_addr)
    else {
        error!("module loader: modules must define ModuleName, ModuleInit and ModuleCleanup");
        return_errno!(Errno::ENOEXEC);
    };

    if module_with_name(&name).is_some() {
        return_errno_with_message!(Errno::EEXIST, "module name is taken");
    }

    // Dependency edges keep providers loaded.
    for dep in dep_modules.iter() {
        dep.dep_refs.fetch_add(1, Ordering::Relaxed);
    }

    let module = Arc::new(Module {
        name,
        base,
        size: total,
        init_addr,
        cleanup_addr,
        args: args.to_string(),
        deps: SpinLock::new(dep_modules),
        dep_refs: AtomicUsize::new(0),
    });

    for (name, value) in exports {
        if ksymbols::add_symbol(&name, value, Some(&module)).is_err() {
            warn!("module loader: symbol {} shadows an existing export", name);
        }
    }

    MODULES.lock().push(module.clone());
    Ok(module)
}

/// Unloads a module. Fails with `EBUSY` while other modules depend on
/// its symbols.
pub fn unload(module: &Arc<Module>) -> Result<()> {
    if module.dep_ref_count() > 0 {
        return_errno_with_message!(Errno::EBUSY, "module has dependents");
    }

    {
        let mut modules = MODULES.lock();
        let Some(position) = modules.iter().position(|m| Arc::ptr_eq(m, module)) else {
            return_errno!(Errno::ENOENT);
        };
        modules.remove(position);
    }

    ksymbols::remove_symbols_of(module);
    for dep in module.deps.lock().drain(..) {
        dep.dep_refs.fetch_sub(1, Ordering::Relaxed);
    }
    kva::free(module.base);
    Ok(())
}

fn check_header(elf: &ElfFile) -> Result<()> {
    if elf.header.pt1.class() != header::Class::ThirtyTwo {
        return_errno_with_message!(Errno::ENOEXEC, "modules must be 32-bit objects");
    }
    if elf.header.pt2.type_().as_type() != header::Type::Relocatable {
        return_errno_with_message!(Errno::ENOEXEC, "modules must be relocatable objects");
    }
    if elf.header.pt2.machine().as_machine() != header::Machine::X86 {
        return_errno_with_message!(Errno::ENOEXEC, "modules must target the i386");
    }
    Ok(())
}

fn symbol_entries<'a>(elf: &'a ElfFile) -> Result<&'a [xmas_elf::symbol_table::Entry32]> {
    for section in elf.section_iter() {
        if matches!(section.get_type(), Ok(ShType::SymTab)) {
            match section.get_data(elf) {
                Ok(SectionData::SymbolTable32(entries)) => return Ok(entries),
                _ => return_errno!(Errno::ENOEXEC),
            }
        }
    }
    return_errno_with_message!(Errno::ENOEXEC, "module has no symbol table")
}

/// Reads a NUL-terminated string out of kernel memory.
fn read_kernel_string(addr: Vaddr) -> Result<String> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        let mut byte = [0u8; 1];
        io::read_kernel_bytes(cursor, &mut byte);
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        cursor += 1;
        if bytes.len() > 255 {
            return_errno_with_message!(Errno::ENOEXEC, "unterminated module name");
        }
    }
    String::from_utf8(bytes).map_err(|_| Error::new(Errno::ENOEXEC))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::kernel_lock;

    const SHT_PROGBITS: u32 = 1;
    const SHT_SYMTAB: u32 = 2;
    const SHT_STRTAB: u32 = 3;
    const SHT_REL: u32 = 9;

    const SHF_WRITE: u32 = 0x1;
    const SHF_ALLOC32: u32 = 0x2;

    fn u16le(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32le(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    struct Section {
        name: u32,
        sh_type: u32,
        flags: u32,
        offset: u32,
        size: u32,
        link: u32,
        info: u32,
        align: u32,
        entsize: u32,
    }

    fn sym(out: &mut Vec<u8>, name: u32, value: u32, info: u8, shndx: u16) {
        u32le(out, name);
        u32le(out, value);
        u32le(out, 0); // size
        out.push(info);
        out.push(0); // other
        u16le(out, shndx);
    }

    /// Assembles a minimal ELF32 relocatable module:
    ///
    /// - `.text` (8 bytes) with an `R_386_32` and an `R_386_PC32`
    ///   relocation against the undefined symbol `kernel_putc`
    /// - `.data` holding the `ModuleName` string
    /// - `ModuleInit`/`ModuleCleanup` defined in `.text`
    fn build_module_image(extra_undefined: Option<&str>) -> Vec<u8> {
        let text = [0u8; 8];
        let data = b"demo\0";

        // String table: \0 kernel_putc\0 ModuleName\0 ModuleInit\0
        // ModuleCleanup\0 [extra\0]
        let mut strtab = vec![0u8];
        let mut strpos = |s: &str, table: &mut Vec<u8>| -> u32 {
            let at = table.len() as u32;
            table.extend_from_slice(s.as_bytes());
            table.push(0);
            at
        };
        let putc_name = strpos("kernel_putc", &mut strtab);
        let modname_name = strpos("ModuleName", &mut strtab);
        let init_name = strpos("ModuleInit", &mut strtab);
        let cleanup_name = strpos("ModuleCleanup", &mut strtab);
        let extra_name = extra_undefined.map(|s| strpos(s, &mut strtab));

        // Symbols: null, then locals, then globals.
        let mut symtab = Vec::new();
        sym(&mut symtab, 0, 0, 0, 0);
        // 1: kernel_putc, undefined global
        sym(&mut symtab, putc_name, 0, 0x10, 0);
        // 2: ModuleName -> .data + 0 (section index 2)
        sym(&mut symtab, modname_name, 0, 0x11, 2);
        // 3: ModuleInit -> .text + 0 (section index 1)
        sym(&mut symtab, init_name, 0, 0x12, 1);
        // 4: ModuleCleanup -> .text + 4
        sym(&mut symtab, cleanup_name, 4, 0x12, 1);
        if let Some(name) = extra_name {
            sym(&mut symtab, name, 0, 0x10, 0);
        }

        // Relocations for .text against symbol 1.
        let mut rel = Vec::new();
        u32le(&mut rel, 0); // r_offset
        u32le(&mut rel, (1 << 8) | R_386_32 as u32);
        u32le(&mut rel, 4);
        u32le(&mut rel, (1 << 8) | R_386_PC32 as u32);

        let shstrtab = b"\0.text\0.data\0.rel.text\0.symtab\0.strtab\0.shstrtab\0";

        // File layout: ehdr, section bodies, section header table.
        let ehsize = 52u32;
        let mut offset = ehsize;
        let mut place = |len: usize, offset: &mut u32| -> u32 {
            let at = *offset;
            *offset += len as u32;
            at
        };
        let text_off = place(text.len(), &mut offset);
        let data_off = place(data.len(), &mut offset);
        let rel_off = place(rel.len(), &mut offset);
        let symtab_off = place(symtab.len(), &mut offset);
        let strtab_off = place(strtab.len(), &mut offset);
        let shstrtab_off = place(shstrtab.len(), &mut offset);
        // The section header table must be 4-byte aligned for xmas-elf's
        // zero-copy header reads.
        let shoff = (offset + 3) & !3;

        let sections = [
            Section {
                name: 0,
                sh_type: 0,
                flags: 0,
                offset: 0,
                size: 0,
                link: 0,
                info: 0,
                align: 0,
                entsize: 0,
            },
            Section {
                name: 1,
                sh_type: SHT_PROGBITS,
                flags: SHF_ALLOC32,
                offset: text_off,
                size: text.len() as u32,
                link: 0,
                info: 0,
                align: 4,
                entsize: 0,
            },
            Section {
                name: 7,
                sh_type: SHT_PROGBITS,
                flags: SHF_ALLOC32 | SHF_WRITE,
                offset: data_off,
                size: data.len() as u32,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            },
            Section {
                name: 13,
                sh_type: SHT_REL,
                flags: 0,
                offset: rel_off,
                size: rel.len() as u32,
                link: 4, // .symtab
                info: 1, // relocates .text
                align: 4,
                entsize: 8,
            },
            Section {
                name: 23,
                sh_type: SHT_SYMTAB,
                flags: 0,
                offset: symtab_off,
                size: symtab.len() as u32,
                link: 5, // .strtab
                info: 1, // first global
                align: 4,
                entsize: 16,
            },
            Section {
                name: 31,
                sh_type: SHT_STRTAB,
                flags: 0,
                offset: strtab_off,
                size: strtab.len() as u32,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            },
            Section {
                name: 39,
                sh_type: SHT_STRTAB,
                flags: 0,
                offset: shstrtab_off,
                size: shstrtab.len() as u32,
                link: 0,
                info: 0,
                align: 1,
                entsize: 0,
            },
        ];

        let mut image = Vec::new();
        // e_ident
        image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        image.extend_from_slice(&[0u8; 8]);
        u16le(&mut image, 1); // ET_REL
        u16le(&mut image, 3); // EM_386
        u32le(&mut image, 1); // e_version
        u32le(&mut image, 0); // e_entry
        u32le(&mut image, 0); // e_phoff
        u32le(&mut image, shoff);
        u32le(&mut image, 0); // e_flags
        u16le(&mut image, 52); // e_ehsize
        u16le(&mut image, 0); // e_phentsize
        u16le(&mut image, 0); // e_phnum
        u16le(&mut image, 40); // e_shentsize
        u16le(&mut image, sections.len() as u16);
        u16le(&mut image, 6); // e_shstrndx

        image.extend_from_slice(&text);
        image.extend_from_slice(data);
        image.extend_from_slice(&rel);
        image.extend_from_slice(&symtab);
        image.extend_from_slice(&strtab);
        image.extend_from_slice(shstrtab);
        image.resize(shoff as usize, 0);

        for section in &sections {
            u32le(&mut image, section.name);
            u32le(&mut image, section.sh_type);
            u32le(&mut image, section.flags);
            u32le(&mut image, 0); // sh_addr
            u32le(&mut image, section.offset);
            u32le(&mut image, section.size);
            u32le(&mut image, section.link);
            u32le(&mut image, section.info);
            u32le(&mut image, section.align);
            u32le(&mut image, section.entsize);
        }
        image
    }

    #[test]
    fn load_resolves_and_relocates() {
        let _guard = kernel_lock();
        let _ = ksymbols::add_symbol("kernel_putc", 0xC055_0000, None);

        let image = build_module_image(None);
        let module = load(&image, "speed=9600").unwrap();

        assert_eq!(module.name(), "demo");
        assert_eq!(module.args(), "speed=9600");

        let base = module.base() as u32;
        // .text is laid out first, .data right behind it.
        assert_eq!(module.init_addr(), base);
        assert_eq!(module.cleanup_addr(), base + 4);

        // R_386_32: *loc += S; R_386_PC32: *loc += S - P.
        let mut word = [0u8; 4];
        io::read_kernel_bytes(module.base(), &mut word);
        assert_eq!(u32::from_le_bytes(word), 0xC055_0000);
        io::read_kernel_bytes(module.base() + 4, &mut word);
        assert_eq!(u32::from_le_bytes(word), 0xC055_0000u32.wrapping_sub(base + 4));

        // The exports landed in the kernel symbol table.
        assert_eq!(
            ksymbols::lookup("ModuleInit").map(|(v, _)| v),
            Some(base)
        );

        unload(&module).unwrap();
        assert!(ksymbols::lookup("ModuleInit").is_none());
        assert!(module_with_name("demo").is_none());
    }

    #[test]
    fn unresolved_symbols_fail_the_load() {
        let _guard = kernel_lock();
        let _ = ksymbols::add_symbol("kernel_putc", 0xC055_0000, None);
        let image = build_module_image(Some("no_such_symbol"));
        assert_eq!(load(&image, "").unwrap_err().error(), Errno::ENOENT);
    }

    #[test]
    fn oversized_images_are_rejected() {
        let _guard = kernel_lock();
        let image = vec![0u8; MODULE_MAX_SIZE + 1];
        assert_eq!(load(&image, "").unwrap_err().error(), Errno::EFBIG);
    }

    #[test]
    fn garbage_is_not_a_module() {
        let _guard = kernel_lock();
        assert_eq!(
            load(b"not an elf at all", "").unwrap_err().error(),
            Errno::ENOEXEC
        );
    }

    #[test]
    fn dependencies_pin_the_provider() {
        let _guard = kernel_lock();
        let _ = ksymbols::add_symbol("kernel_putc", 0xC055_0000, None);

        let provider = load(&build_module_image(None), "").unwrap();
        // The provider exports ModuleInit etc.; a consumer resolving
        // against it records a dependency edge.
        let consumer_image = build_module_image(Some("ModuleInit"));
        // Rename the consumer by patching its ModuleName string.
        let mut consumer_image = consumer_image;
        let pos = consumer_image
            .windows(5)
            .position(|window| window == b"demo\0")
            .unwrap();
        consumer_image[pos..pos + 4].copy_from_slice(b"dep0");

        let consumer = load(&consumer_image, "").unwrap();
        assert_eq!(provider.dep_ref_count(), 1);

        // The provider cannot go while the consumer needs it.
        assert_eq!(unload(&provider).unwrap_err().error(), Errno::EBUSY);
        unload(&consumer).unwrap();
        assert_eq!(provider.dep_ref_count(), 0);
        unload(&provider).unwrap();
    }
}
