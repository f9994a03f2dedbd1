//! Dynamic-linker-free symbol resolution.
//!
//! Reads a mapped library's backing file from disk and walks `.dynsym` and
//! `.symtab` directly. This answers lookups the host's own lookup service
//! cannot: local/static symbols, and symbols whose exact names carry
//! build-specific suffixes (matched by prefix instead).

use core::ffi::c_void;

use crate::maps::{image_path, scan_maps};
use crate::types::{ElfError, MapInfo};

const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;
const PT_LOAD: u32 = 1;
const ET_DYN: u16 = 3;
const SHN_UNDEF: u16 = 0;

/// Pre-parsed offsets of one symbol table and its string table.
#[derive(Clone, Copy)]
struct SymTable {
    sym_off: usize,
    sym_size: usize,
    sym_entsize: usize,
    str_off: usize,
    str_size: usize,
}

/// A shared object opened from disk, with the in-process load bias of the
/// mapping it was resolved from.
pub struct ElfImg {
    data: *const u8,
    size: usize,
    /// Runtime address of the image's lowest PT_LOAD vaddr.
    bias: usize,
    /// Lowest PT_LOAD vaddr in the file (0 for most shared objects).
    file_base: u64,
    is_dyn: bool,
    dynsym: Option<SymTable>,
    symtab: Option<SymTable>,
    path: String,
}

// Safety: read-only private mapping, owned exclusively by this value.
unsafe impl Send for ElfImg {}
unsafe impl Sync for ElfImg {}

impl Drop for ElfImg {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                libc::munmap(self.data as *mut c_void, self.size);
            }
        }
    }
}

fn u16_at(b: &[u8], off: usize) -> Option<u16> {
    b.get(off..off + 2).map(|s| u16::from_le_bytes(s.try_into().unwrap()))
}

fn u32_at(b: &[u8], off: usize) -> Option<u32> {
    b.get(off..off + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

fn u64_at(b: &[u8], off: usize) -> Option<u64> {
    b.get(off..off + 8).map(|s| u64::from_le_bytes(s.try_into().unwrap()))
}

impl ElfImg {
    /// Open the library whose mapped path contains `needle`, using the
    /// supplied snapshot to learn its on-disk path and load bias.
    pub fn find(needle: &str, maps: &[MapInfo]) -> Result<Self, ElfError> {
        let mapping = maps
            .iter()
            .find(|m| m.inode != 0 && m.offset == 0 && m.path.contains(needle))
            .ok_or(ElfError::NotElf)?;
        let path = image_path(maps, mapping.dev, mapping.inode)
            .unwrap_or(&mapping.path)
            .to_string();
        Self::open_at(&path, mapping.start)
    }

    /// Convenience wrapper over [`ElfImg::find`] with a fresh snapshot.
    pub fn open_mapped(needle: &str) -> Result<Self, ElfError> {
        let maps = scan_maps();
        Self::find(needle, &maps)
    }

    /// Open an on-disk image mapped at `base` in this process.
    pub fn open_at(path: &str, base: usize) -> Result<Self, ElfError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < 64 {
            return Err(ElfError::NotElf);
        }

        use std::os::fd::AsRawFd;
        let data = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if data == libc::MAP_FAILED {
            return Err(ElfError::Io(std::io::Error::last_os_error()));
        }

        let mut img = ElfImg {
            data: data as *const u8,
            size,
            bias: base,
            file_base: 0,
            is_dyn: true,
            dynsym: None,
            symtab: None,
            path: path.to_string(),
        };
        img.parse()?;
        Ok(img)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.size) }
    }

    fn parse(&mut self) -> Result<(), ElfError> {
        // Detached from `self` so the parsed fields can be assigned while
        // the slice is in scope; the mapping outlives the call.
        let size = self.size;
        let b: &[u8] = unsafe { std::slice::from_raw_parts(self.data, size) };
        if &b[0..4] != b"\x7fELF" {
            return Err(ElfError::NotElf);
        }

        let e_type = u16_at(b, 16).ok_or(ElfError::Malformed)?;
        self.is_dyn = e_type == ET_DYN;

        // Lowest PT_LOAD vaddr; symbol values are relative to it.
        let e_phoff = u64_at(b, 32).ok_or(ElfError::Malformed)? as usize;
        let e_phentsize = u16_at(b, 54).ok_or(ElfError::Malformed)? as usize;
        let e_phnum = u16_at(b, 56).ok_or(ElfError::Malformed)? as usize;
        let mut min_vaddr: Option<u64> = None;
        for i in 0..e_phnum {
            let off = e_phoff + i * e_phentsize;
            let p_type = u32_at(b, off).ok_or(ElfError::Malformed)?;
            if p_type == PT_LOAD {
                let p_vaddr = u64_at(b, off + 16).ok_or(ElfError::Malformed)?;
                min_vaddr = Some(min_vaddr.map_or(p_vaddr, |m| m.min(p_vaddr)));
            }
        }
        self.file_base = min_vaddr.unwrap_or(0);

        let e_shoff = u64_at(b, 40).ok_or(ElfError::Malformed)? as usize;
        let e_shentsize = u16_at(b, 58).ok_or(ElfError::Malformed)? as usize;
        let e_shnum = u16_at(b, 60).ok_or(ElfError::Malformed)? as usize;
        if e_shoff == 0 || e_shnum == 0 || e_shentsize < 64 {
            // Sections stripped: both tables stay empty, lookups miss.
            return Ok(());
        }

        let shdr = |i: usize, field: usize| -> Option<u64> {
            let off = e_shoff + i * e_shentsize;
            if off + e_shentsize > size {
                return None;
            }
            u64_at(b, off + field)
        };

        for i in 0..e_shnum {
            let off = e_shoff + i * e_shentsize;
            let Some(sh_type) = u32_at(b, off + 4) else { break };
            if sh_type != SHT_SYMTAB && sh_type != SHT_DYNSYM {
                continue;
            }
            let sym_off = shdr(i, 24).ok_or(ElfError::Malformed)? as usize;
            let sym_size = shdr(i, 32).ok_or(ElfError::Malformed)? as usize;
            let link = u32_at(b, off + 40).ok_or(ElfError::Malformed)? as usize;
            let sym_entsize = shdr(i, 56).ok_or(ElfError::Malformed)? as usize;
            if sym_entsize < 24 || link >= e_shnum {
                continue;
            }
            let str_off = shdr(link, 24).ok_or(ElfError::Malformed)? as usize;
            let str_size = shdr(link, 32).ok_or(ElfError::Malformed)? as usize;
            if sym_off + sym_size > size || str_off + str_size > size {
                continue;
            }
            let table = SymTable {
                sym_off,
                sym_size,
                sym_entsize,
                str_off,
                str_size,
            };
            if sh_type == SHT_DYNSYM {
                self.dynsym = Some(table);
            } else {
                self.symtab = Some(table);
            }
        }
        Ok(())
    }

    fn sym_name<'a>(&'a self, table: &SymTable, st_name: usize) -> Option<&'a str> {
        if st_name == 0 || st_name >= table.str_size {
            return None;
        }
        let b = self.bytes();
        let start = table.str_off + st_name;
        let end = b[start..table.str_off + table.str_size]
            .iter()
            .position(|&c| c == 0)
            .map(|p| start + p)?;
        std::str::from_utf8(&b[start..end]).ok()
    }

    fn each_symbol<T>(
        &self,
        mut visit: impl FnMut(&str, u64, u16) -> Option<T>,
    ) -> Option<T> {
        // Deterministic order: dynamic table first, then the full symtab,
        // each in file order. Mangled/versioned duplicates resolve to the
        // first qualifying entry.
        for table in [self.dynsym.as_ref(), self.symtab.as_ref()].into_iter().flatten() {
            let b = self.bytes();
            let count = table.sym_size / table.sym_entsize;
            for i in 0..count {
                let off = table.sym_off + i * table.sym_entsize;
                let st_name = u32_at(b, off)? as usize;
                let st_shndx = u16_at(b, off + 6)?;
                let st_value = u64_at(b, off + 8)?;
                let Some(name) = self.sym_name(table, st_name) else {
                    continue;
                };
                if let Some(found) = visit(name, st_value, st_shndx) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn runtime_address(&self, st_value: u64) -> usize {
        if self.is_dyn {
            self.bias + (st_value - self.file_base) as usize
        } else {
            st_value as usize
        }
    }

    /// Exact-name lookup. `None` means "feature unavailable" at call sites,
    /// never a fault.
    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        self.each_symbol(|sym, value, shndx| {
            (sym == name && shndx != SHN_UNDEF && value != 0)
                .then(|| self.runtime_address(value))
        })
    }

    /// First symbol whose mangled name starts with `prefix`, in table
    /// order. Build tooling appends unstable suffixes to internal names;
    /// the stable prefix is the contract.
    pub fn symbol_name_by_prefix(&self, prefix: &str) -> Option<String> {
        self.each_symbol(|sym, value, shndx| {
            (sym.starts_with(prefix) && shndx != SHN_UNDEF && value != 0)
                .then(|| sym.to_string())
        })
    }

    /// Every symbol starting with `prefix`, in table order. Host images
    /// define several same-prefixed statics; callers validate candidates.
    pub fn symbols_by_prefix(&self, prefix: &str) -> Vec<(String, usize)> {
        let mut found = Vec::new();
        self.each_symbol(|sym, value, shndx| {
            if sym.starts_with(prefix) && shndx != SHN_UNDEF && value != 0 {
                found.push((sym.to_string(), self.runtime_address(value)));
            }
            None::<()>
        });
        found
    }

    /// Read a pointer-sized static out of the image.
    pub fn static_pointer(&self, name: &str) -> Option<usize> {
        let addr = self.symbol_address(name)?;
        let value = unsafe { core::ptr::read(addr as *const usize) };
        (value != 0).then_some(value)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bias(&self) -> usize {
        self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_libc() -> ElfImg {
        ElfImg::open_mapped("libc.so").expect("libc must be mapped")
    }

    #[test]
    fn resolves_exported_symbol_to_dlsym_address() {
        let img = open_libc();
        let resolved = img.symbol_address("malloc").expect("malloc");
        let via_dlsym = unsafe {
            libc::dlsym(libc::RTLD_DEFAULT, c"malloc".as_ptr())
        } as usize;
        assert_ne!(resolved, 0);
        assert_eq!(resolved, via_dlsym);
    }

    #[test]
    fn missing_symbol_is_none_not_a_fault() {
        let img = open_libc();
        assert_eq!(img.symbol_address("definitely_not_a_symbol_xq9"), None);
    }

    #[test]
    fn prefix_lookup_finds_a_qualifying_name() {
        let img = open_libc();
        let name = img.symbol_name_by_prefix("mallo").expect("prefix match");
        assert!(name.starts_with("mallo"));
        // The returned name must itself resolve.
        assert!(img.symbol_address(&name).is_some());
    }

    #[test]
    fn prefix_lookup_is_deterministic() {
        let img = open_libc();
        let a = img.symbol_name_by_prefix("re");
        let b = img.symbol_name_by_prefix("re");
        assert_eq!(a, b);
    }

    #[test]
    fn non_elf_file_is_rejected() {
        match ElfImg::open_at("/etc/hosts", 0) {
            Err(ElfError::NotElf) => {}
            other => panic!("expected NotElf, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            ElfImg::open_at("/does/not/exist", 0),
            Err(ElfError::Io(_))
        ));
    }

    #[test]
    fn own_executable_resolves_local_symbols() {
        let exe = std::fs::read_link("/proc/self/exe").expect("readlink");
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        let img = ElfImg::open_mapped(&name).expect("open own image");
        // Test binaries are unstripped; `main` is always present.
        assert!(img.symbol_address("main").is_some());
    }
}
