//! Batched PLT/GOT call-target patching.
//!
//! Registration records intent only; `commit` applies every pending
//! registration over one mapping snapshot. Patches target slots reached
//! through the dynamic relocation tables, so a single slot per symbol per
//! image is the entire patch surface and the original code bytes are never
//! touched.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use core::ffi::c_void;
use log::{debug, warn};

use crate::maps::image_base;
use crate::types::MapInfo;

const PT_DYNAMIC: u32 = 2;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_JMPREL: i64 = 23;

#[cfg(target_arch = "x86_64")]
const R_GLOB_DAT: u32 = 6; // R_X86_64_GLOB_DAT
#[cfg(target_arch = "x86_64")]
const R_JUMP_SLOT: u32 = 7; // R_X86_64_JUMP_SLOT
#[cfg(target_arch = "aarch64")]
const R_GLOB_DAT: u32 = 1025; // R_AARCH64_GLOB_DAT
#[cfg(target_arch = "aarch64")]
const R_JUMP_SLOT: u32 = 1026; // R_AARCH64_JUMP_SLOT

const RELA_ENTRY_SIZE: usize = 24;
const SYM_ENTRY_SIZE: usize = 24;

/// A registered-but-not-yet-applied patch.
struct PendingHook {
    dev: u64,
    inode: u64,
    symbol: String,
    replacement: usize,
    /// Raw `*mut *mut c_void`; written with the displaced pointer at commit
    /// time. Zero means the caller does not want the original back.
    backup: usize,
}

/// Process-global hook registry.
pub struct HookManager {
    pending: Mutex<Vec<PendingHook>>,
}

impl HookManager {
    pub fn obtain() -> &'static HookManager {
        static INSTANCE: OnceLock<HookManager> = OnceLock::new();
        INSTANCE.get_or_init(|| HookManager {
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Record intent to patch `symbol` in every mapped instance of the
    /// library identified by (dev, inode). No memory is touched until
    /// [`HookManager::commit`].
    pub fn register(
        &self,
        dev: u64,
        inode: u64,
        symbol: &str,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) -> bool {
        if dev == 0 || inode == 0 || symbol.is_empty() || replacement.is_null() {
            return false;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(PendingHook {
            dev,
            inode,
            symbol: symbol.to_string(),
            replacement: replacement as usize,
            backup: backup as usize,
        });
        true
    }

    /// Apply all pending registrations over `maps` and consume them.
    ///
    /// A registration whose target symbol is absent from every mapped
    /// instance is dropped silently; its backup slot stays null, which is
    /// how callers infer the target never materialized. Returns false only
    /// when a located slot could not be patched.
    pub fn commit(&self, maps: &[MapInfo]) -> bool {
        let pending = {
            let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if pending.is_empty() {
            return true;
        }

        let mut bases: HashMap<(u64, u64), Option<usize>> = HashMap::new();
        let mut ok = true;

        for hook in &pending {
            let base = *bases
                .entry((hook.dev, hook.inode))
                .or_insert_with(|| image_base(maps, hook.dev, hook.inode));
            let Some(base) = base else {
                debug!(
                    "no mapping for {}:{} in snapshot, dropping hook for {}",
                    hook.dev, hook.inode, hook.symbol
                );
                continue;
            };
            match unsafe { patch_image(base, maps, hook) } {
                Ok(0) => debug!("symbol {} not bound in image at {base:#x}", hook.symbol),
                Ok(n) => debug!("patched {n} slot(s) for {}", hook.symbol),
                Err(()) => {
                    warn!("failed to patch {} in image at {base:#x}", hook.symbol);
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Resolve a dynamic-table address that may be pristine (file-relative) or
/// already adjusted to a runtime address by the loader.
fn dyn_resolve(base: usize, val: u64) -> usize {
    if val as usize > base { val as usize } else { base + val as usize }
}

/// Patch every relocation slot bound to `hook.symbol` in the image mapped
/// at `base`. Returns the number of slots patched.
unsafe fn patch_image(base: usize, maps: &[MapInfo], hook: &PendingHook) -> Result<usize, ()> {
    unsafe {
        let hdr = base as *const u8;
        if std::slice::from_raw_parts(hdr, 4) != b"\x7fELF" {
            return Err(());
        }

        let e_phoff = (hdr.add(32) as *const u64).read_unaligned() as usize;
        let e_phentsize = (hdr.add(54) as *const u16).read_unaligned() as usize;
        let e_phnum = (hdr.add(56) as *const u16).read_unaligned() as usize;

        let mut dyn_addr = 0usize;
        for i in 0..e_phnum {
            let ph = hdr.add(e_phoff + i * e_phentsize);
            let p_type = (ph as *const u32).read_unaligned();
            if p_type == PT_DYNAMIC {
                let p_vaddr = (ph.add(16) as *const u64).read_unaligned();
                dyn_addr = base + p_vaddr as usize;
                break;
            }
        }
        if dyn_addr == 0 {
            return Ok(0);
        }

        let mut jmprel = 0usize;
        let mut jmprel_size = 0usize;
        let mut rela = 0usize;
        let mut rela_size = 0usize;
        let mut symtab = 0usize;
        let mut strtab = 0usize;

        let mut entry = dyn_addr as *const u8;
        loop {
            let d_tag = (entry as *const i64).read_unaligned();
            if d_tag == DT_NULL {
                break;
            }
            let d_val = (entry.add(8) as *const u64).read_unaligned();
            match d_tag {
                DT_JMPREL => jmprel = dyn_resolve(base, d_val),
                DT_PLTRELSZ => jmprel_size = d_val as usize,
                DT_RELA => rela = dyn_resolve(base, d_val),
                DT_RELASZ => rela_size = d_val as usize,
                DT_SYMTAB => symtab = dyn_resolve(base, d_val),
                DT_STRTAB => strtab = dyn_resolve(base, d_val),
                _ => {}
            }
            entry = entry.add(16);
        }
        if symtab == 0 || strtab == 0 {
            return Ok(0);
        }

        let mut patched = 0usize;
        for (rel_base, rel_size) in [(jmprel, jmprel_size), (rela, rela_size)] {
            if rel_base == 0 || rel_size == 0 {
                continue;
            }
            for i in 0..rel_size / RELA_ENTRY_SIZE {
                let rel = (rel_base + i * RELA_ENTRY_SIZE) as *const u8;
                let r_offset = (rel as *const u64).read_unaligned();
                let r_info = (rel.add(8) as *const u64).read_unaligned();
                let r_type = r_info as u32;
                if r_type != R_JUMP_SLOT && r_type != R_GLOB_DAT {
                    continue;
                }
                let sym_index = (r_info >> 32) as usize;
                let sym = (symtab + sym_index * SYM_ENTRY_SIZE) as *const u8;
                let st_name = (sym as *const u32).read_unaligned() as usize;
                if st_name == 0 {
                    continue;
                }
                let name = core::ffi::CStr::from_ptr((strtab + st_name) as *const core::ffi::c_char);
                if name.to_bytes() != hook.symbol.as_bytes() {
                    continue;
                }
                let slot = base + r_offset as usize;
                if patch_slot(slot, hook.replacement, hook.backup, maps) {
                    patched += 1;
                } else {
                    return Err(());
                }
            }
        }
        Ok(patched)
    }
}

/// Swap one GOT slot, recording the displaced value into the backup slot
/// before the new pointer becomes visible. Re-commits of an already-applied
/// patch keep the earlier backup instead of clobbering it with the
/// replacement itself.
unsafe fn patch_slot(slot: usize, replacement: usize, backup: usize, maps: &[MapInfo]) -> bool {
    unsafe {
        let slot_ptr = slot as *mut usize;
        let current = slot_ptr.read();
        if current == replacement {
            return true;
        }

        let region = maps.iter().find(|m| m.start <= slot && slot < m.end);
        let writable = region.map(|m| m.perms & libc::PROT_WRITE != 0).unwrap_or(false);

        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page = slot & !(page_size - 1);
        if !writable {
            let prot = region.map(|m| m.perms).unwrap_or(libc::PROT_READ) | libc::PROT_WRITE;
            if libc::mprotect(page as *mut c_void, page_size, prot) != 0 {
                return false;
            }
        }

        if backup != 0 {
            (backup as *mut usize).write(current);
        }
        slot_ptr.write(replacement);

        if !writable {
            if let Some(m) = region {
                // Restore the protections the snapshot recorded.
                libc::mprotect(page as *mut c_void, page_size, m.perms);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_hook_tests;
    use crate::maps::{library_identity, scan_maps};
    use core::ffi::c_void;

    fn own_identity(maps: &[MapInfo]) -> (u64, u64) {
        let exe = std::fs::read_link("/proc/self/exe").expect("readlink");
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        library_identity(maps, &name).expect("own image identity")
    }

    extern "C" fn fake_getpid() -> libc::pid_t {
        4242
    }

    #[test]
    fn register_rejects_invalid_input() {
        let mgr = HookManager::obtain();
        assert!(!mgr.register(0, 1, "x", fake_getpid as *mut c_void, std::ptr::null_mut()));
        assert!(!mgr.register(1, 0, "x", fake_getpid as *mut c_void, std::ptr::null_mut()));
        assert!(!mgr.register(1, 1, "", fake_getpid as *mut c_void, std::ptr::null_mut()));
        assert!(!mgr.register(1, 1, "x", std::ptr::null_mut(), std::ptr::null_mut()));
    }

    #[test]
    fn absent_symbol_commits_clean_and_leaves_backup_null() {
        let _guard = lock_hook_tests();
        let mgr = HookManager::obtain();
        let maps = scan_maps();
        let (dev, inode) = own_identity(&maps);

        let mut backup: *mut c_void = std::ptr::null_mut();
        assert!(mgr.register(
            dev,
            inode,
            "symbol_that_no_image_exports_q7",
            fake_getpid as *mut c_void,
            &mut backup,
        ));
        // Overall commit succeeds; the absent registration vanishes.
        assert!(mgr.commit(&maps));
        assert!(backup.is_null());
    }

    #[test]
    fn commit_unknown_identity_is_silent() {
        let _guard = lock_hook_tests();
        let mgr = HookManager::obtain();
        let maps = scan_maps();
        let mut backup: *mut c_void = std::ptr::null_mut();
        assert!(mgr.register(u64::MAX, u64::MAX, "getpid", fake_getpid as *mut c_void, &mut backup));
        assert!(mgr.commit(&maps));
        assert!(backup.is_null());
    }

    #[test]
    fn hook_commit_revert_roundtrip_on_live_got() {
        let _guard = lock_hook_tests();
        let mgr = HookManager::obtain();
        let maps = scan_maps();
        let (dev, inode) = own_identity(&maps);

        let real_pid = unsafe { libc::getpid() };
        let mut backup: *mut c_void = std::ptr::null_mut();

        assert!(mgr.register(dev, inode, "getpid", fake_getpid as *mut c_void, &mut backup));
        assert!(mgr.commit(&maps));

        if backup.is_null() {
            // Statically linked or no getpid relocation in this binary;
            // nothing to observe, and nothing was patched.
            return;
        }

        // Surviving record has a non-null backup and the call target changed.
        assert_eq!(unsafe { libc::getpid() }, 4242);

        // Re-committing the same replacement must not clobber the backup.
        let mut second_backup: *mut c_void = std::ptr::null_mut();
        assert!(mgr.register(dev, inode, "getpid", fake_getpid as *mut c_void, &mut second_backup));
        assert!(mgr.commit(&maps));
        assert!(second_backup.is_null());

        // Revert: re-point the slot at the recorded original.
        assert!(mgr.register(dev, inode, "getpid", backup, std::ptr::null_mut()));
        assert!(mgr.commit(&maps));
        assert_eq!(unsafe { libc::getpid() }, real_pid);
    }
}
