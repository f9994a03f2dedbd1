//! Replacing the host runtime's registered specialization entry points.
//!
//! The runtime library keeps static registration tables of named native
//! functions; the worker-specialization entries live in one of several
//! same-named local statics, so candidates are found by prefix probing and
//! validated by the method names they carry, the same discovery posture
//! as the registry scrub, since none of this is a published ABI.

use core::ffi::{c_char, c_int, c_void};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use graft_intercept::{ElfImg, MapInfo};

use crate::args::{AppSpecializeArgs, ServerSpecializeArgs};
use crate::context::{SpecializeArgs, SpecializeContext};

/// One row of a host registration table.
#[repr(C)]
pub struct NativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fn_ptr: *mut c_void,
}

/// Local-static prefix the registration tables are compiled under; build
/// tooling may append a dedup suffix.
const TABLE_SYMBOL_PREFIX: &str = "_ZL8gMethods";
/// Upper bound on plausible rows in one registration table.
const TABLE_SCAN_LIMIT: usize = 64;

const ENTRY_FORK_AND_SPECIALIZE: &str = "nativeForkAndSpecialize";
const ENTRY_SPECIALIZE: &str = "nativeSpecializeAppProcess";
const ENTRY_FORK_SERVER: &str = "nativeForkSystemServer";

type ForkAndSpecializeFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut AppSpecializeArgs) -> libc::pid_t;
type SpecializeFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut AppSpecializeArgs);
type ForkServerFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut ServerSpecializeArgs) -> libc::pid_t;

static ORIG_FORK_AND_SPECIALIZE: AtomicUsize = AtomicUsize::new(0);
static ORIG_SPECIALIZE: AtomicUsize = AtomicUsize::new(0);
static ORIG_FORK_SERVER: AtomicUsize = AtomicUsize::new(0);

/// Validated registration tables, kept for module-requested replacements.
static TABLES: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

/// Slots rewritten during the swap, with their displaced values.
pub struct EntrySwap {
    entries: Vec<(usize, usize)>,
}

fn in_readable_map(maps: &[MapInfo], addr: usize) -> bool {
    maps.iter()
        .any(|m| m.start <= addr && addr < m.end && m.perms & libc::PROT_READ != 0)
}

/// Count plausible rows starting at `table`: each row's name pointer must
/// land in readable memory and decode as a short identifier.
unsafe fn table_len(table: usize, maps: &[MapInfo]) -> usize {
    let rows = table as *const NativeMethod;
    for i in 0..TABLE_SCAN_LIMIT {
        let row = unsafe { &*rows.add(i) };
        let name = row.name as usize;
        if name == 0 || !in_readable_map(maps, name) || row.fn_ptr.is_null() {
            return i;
        }
        let text = unsafe { core::ffi::CStr::from_ptr(row.name) };
        let bytes = text.to_bytes();
        if bytes.is_empty()
            || bytes.len() > 64
            || !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            return i;
        }
    }
    TABLE_SCAN_LIMIT
}

unsafe fn row_name<'a>(row: &'a NativeMethod) -> &'a [u8] {
    unsafe { core::ffi::CStr::from_ptr(row.name) }.to_bytes()
}

/// Write through a table slot, lifting read-only protection only when the
/// snapshot says the region needs it and restoring it afterwards.
unsafe fn write_slot(slot: *mut *mut c_void, value: *mut c_void, maps: &[MapInfo]) -> bool {
    unsafe {
        let addr = slot as usize;
        let region = maps.iter().find(|m| m.start <= addr && addr < m.end);
        let writable = region.map(|m| m.perms & libc::PROT_WRITE != 0).unwrap_or(true);
        if writable {
            slot.write(value);
            return true;
        }

        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page = addr & !(page_size - 1);
        let perms = region.map(|m| m.perms).unwrap_or(libc::PROT_READ);
        if libc::mprotect(page as *mut c_void, page_size, perms | libc::PROT_WRITE) != 0 {
            return false;
        }
        slot.write(value);
        libc::mprotect(page as *mut c_void, page_size, perms);
        true
    }
}

/// Find the runtime's registration tables and point the three
/// specialization entries at our wrappers. Returns the displaced values
/// for the teardown path.
pub fn swap_specialize_entries(maps: &[MapInfo], runtime_library: &str) -> Option<EntrySwap> {
    let img = match ElfImg::find(runtime_library, maps) {
        Ok(img) => img,
        Err(e) => {
            warn!("cannot open runtime image: {e}");
            return None;
        }
    };

    let candidates = img.symbols_by_prefix(TABLE_SYMBOL_PREFIX);
    if candidates.is_empty() {
        warn!("no registration tables in runtime image");
        return None;
    }

    let wanted: [(&str, usize); 3] = [
        (ENTRY_FORK_AND_SPECIALIZE, hook_fork_and_specialize as usize),
        (ENTRY_SPECIALIZE, hook_specialize as usize),
        (ENTRY_FORK_SERVER, hook_fork_server as usize),
    ];

    let mut swap = EntrySwap { entries: Vec::new() };
    let mut tables = TABLES.lock().unwrap_or_else(|e| e.into_inner());
    tables.clear();

    for (symbol, table) in candidates {
        let len = unsafe { table_len(table, maps) };
        if len == 0 {
            continue;
        }
        tables.push((table, len));
        let rows = table as *mut NativeMethod;
        for i in 0..len {
            let row = unsafe { &mut *rows.add(i) };
            let name = unsafe { row_name(row) }.to_vec();
            for (wanted_name, wrapper) in wanted {
                if name != wanted_name.as_bytes() {
                    continue;
                }
                let original = row.fn_ptr as usize;
                let slot = &mut row.fn_ptr as *mut *mut c_void;
                if !unsafe { write_slot(slot, wrapper as *mut c_void, maps) } {
                    warn!("cannot rewrite entry {wanted_name} in {symbol}");
                    continue;
                }
                match wanted_name {
                    ENTRY_FORK_AND_SPECIALIZE => {
                        ORIG_FORK_AND_SPECIALIZE.store(original, Ordering::Release)
                    }
                    ENTRY_SPECIALIZE => ORIG_SPECIALIZE.store(original, Ordering::Release),
                    _ => ORIG_FORK_SERVER.store(original, Ordering::Release),
                }
                debug!("replaced {wanted_name} (was {original:#x}) in {symbol}");
                swap.entries.push((slot as usize, original));
            }
        }
    }

    if swap.entries.is_empty() {
        warn!("specialization entries not found in any registration table");
        return None;
    }
    Some(swap)
}

/// Point every swapped slot back at its displaced value.
pub fn restore_entries(swap: &EntrySwap) {
    let maps = graft_intercept::maps::scan_maps();
    for &(slot, original) in &swap.entries {
        unsafe {
            write_slot(slot as *mut *mut c_void, original as *mut c_void, &maps);
        }
    }
}

/// Module-facing native-method replacement: for every requested method
/// found in a validated table, swap in the module's pointer and hand the
/// displaced one back through the same structure.
///
/// # Safety
/// `methods` must point to `count` valid rows owned by the caller.
pub unsafe fn replace_native_methods(
    _env: *mut c_void,
    class_name: *const c_char,
    methods: *mut NativeMethod,
    count: c_int,
) {
    if methods.is_null() || count <= 0 {
        return;
    }
    let class = if class_name.is_null() {
        "<any>".to_string()
    } else {
        unsafe { core::ffi::CStr::from_ptr(class_name) }
            .to_string_lossy()
            .into_owned()
    };
    let tables: Vec<(usize, usize)> = TABLES.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let maps = graft_intercept::maps::scan_maps();
    let requested = unsafe { std::slice::from_raw_parts_mut(methods, count as usize) };

    for request in requested {
        if request.fn_ptr.is_null() || request.name.is_null() {
            continue;
        }
        let name = unsafe { row_name(request) }.to_vec();
        let mut replaced = false;
        for &(table, len) in &tables {
            let rows = table as *mut NativeMethod;
            for i in 0..len {
                let row = unsafe { &mut *rows.add(i) };
                if unsafe { row_name(row) } != name.as_slice() {
                    continue;
                }
                let original = row.fn_ptr;
                let slot = &mut row.fn_ptr as *mut *mut c_void;
                if unsafe { write_slot(slot, request.fn_ptr, &maps) } {
                    request.fn_ptr = original;
                    replaced = true;
                }
            }
        }
        if !replaced {
            // Null signals "not found" so callers can tell replacements apart.
            request.fn_ptr = std::ptr::null_mut();
            debug!(
                "native method {} not present for {class}",
                String::from_utf8_lossy(&name)
            );
        }
    }
}

// ---- replaced entry points ---------------------------------------------
//
// Each wrapper brackets the host's own routine with the state machine's
// pre and post phases. The context is created on entry and dropped on
// exit; its drop arms the deferred self-unload on the child path.

unsafe extern "C" fn hook_fork_and_specialize(
    env: *mut c_void,
    class: *mut c_void,
    args: *mut AppSpecializeArgs,
) -> libc::pid_t {
    let mut ctx = SpecializeContext::new(env, SpecializeArgs::App(args));
    ctx.fork_and_specialize_pre();
    let orig = ORIG_FORK_AND_SPECIALIZE.load(Ordering::Acquire);
    let pid = if orig != 0 {
        let orig: ForkAndSpecializeFn = unsafe { std::mem::transmute(orig) };
        unsafe { orig(env, class, args) }
    } else {
        ctx.pid
    };
    ctx.fork_and_specialize_post();
    pid
}

unsafe extern "C" fn hook_specialize(
    env: *mut c_void,
    class: *mut c_void,
    args: *mut AppSpecializeArgs,
) {
    let mut ctx = SpecializeContext::new(env, SpecializeArgs::App(args));
    ctx.specialize_pre();
    let orig = ORIG_SPECIALIZE.load(Ordering::Acquire);
    if orig != 0 {
        let orig: SpecializeFn = unsafe { std::mem::transmute(orig) };
        unsafe { orig(env, class, args) };
    }
    ctx.specialize_post();
}

unsafe extern "C" fn hook_fork_server(
    env: *mut c_void,
    class: *mut c_void,
    args: *mut ServerSpecializeArgs,
) -> libc::pid_t {
    let mut ctx = SpecializeContext::new(env, SpecializeArgs::Server(args));
    ctx.fork_server_pre();
    let orig = ORIG_FORK_SERVER.load(Ordering::Acquire);
    let pid = if orig != 0 {
        let orig: ForkServerFn = unsafe { std::mem::transmute(orig) };
        unsafe { orig(env, class, args) }
    } else {
        ctx.pid
    };
    ctx.fork_server_post();
    pid
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_intercept::maps::scan_maps;

    unsafe extern "C" fn dummy_entry() {}

    /// Build a synthetic registration table backed by ordinary heap memory
    /// (already writable, so write_slot's mprotect is a formality).
    fn make_table(names: &[&'static [u8]]) -> (Vec<std::ffi::CString>, Box<[NativeMethod]>) {
        let strings: Vec<std::ffi::CString> = names
            .iter()
            .map(|n| std::ffi::CString::new(*n).unwrap())
            .collect();
        let rows: Vec<NativeMethod> = strings
            .iter()
            .map(|s| NativeMethod {
                name: s.as_ptr(),
                signature: c"()V".as_ptr(),
                fn_ptr: dummy_entry as *mut c_void,
            })
            .collect();
        (strings, rows.into_boxed_slice())
    }

    #[test]
    fn table_len_stops_at_invalid_rows() {
        let maps = scan_maps();
        let (_strings, table) = make_table(&[b"nativeForkAndSpecialize", b"nativeAllocate"]);
        let len = unsafe { table_len(table.as_ptr() as usize, &maps) };
        assert_eq!(len, 2);

        let (_strings, mut bad) = make_table(&[b"validName"]);
        bad[0].name = 0x10 as *const c_char; // unreadable
        let len = unsafe { table_len(bad.as_ptr() as usize, &maps) };
        assert_eq!(len, 0);
    }

    #[test]
    fn replace_native_methods_swaps_and_returns_original() {
        let (_strings, mut table) = make_table(&[b"nativeAllocate", b"nativeRelease"]);
        {
            let mut tables = TABLES.lock().unwrap_or_else(|e| e.into_inner());
            tables.clear();
            tables.push((table.as_ptr() as usize, table.len()));
        }

        unsafe extern "C" fn module_impl() {}

        let name = std::ffi::CString::new("nativeRelease").unwrap();
        let mut request = [NativeMethod {
            name: name.as_ptr(),
            signature: c"()V".as_ptr(),
            fn_ptr: module_impl as *mut c_void,
        }];
        unsafe {
            replace_native_methods(
                std::ptr::null_mut(),
                std::ptr::null(),
                request.as_mut_ptr(),
                1,
            );
        }
        // The table row now holds the module's pointer, and the request row
        // got the displaced original back.
        assert_eq!(table[1].fn_ptr as usize, module_impl as usize);
        assert_eq!(request[0].fn_ptr as usize, dummy_entry as usize);
    }

    #[test]
    fn replace_native_methods_flags_missing_entries_with_null() {
        {
            let mut tables = TABLES.lock().unwrap_or_else(|e| e.into_inner());
            tables.clear();
        }
        unsafe extern "C" fn module_impl() {}
        let name = std::ffi::CString::new("nativeNotThere").unwrap();
        let mut request = [NativeMethod {
            name: name.as_ptr(),
            signature: c"()V".as_ptr(),
            fn_ptr: module_impl as *mut c_void,
        }];
        unsafe {
            replace_native_methods(
                std::ptr::null_mut(),
                std::ptr::null(),
                request.as_mut_ptr(),
                1,
            );
        }
        assert!(request[0].fn_ptr.is_null());
    }
}
