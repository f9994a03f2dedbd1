//! Scrubbing the host linker's private module registry.
//!
//! The linker keeps a singly linked list of per-library records. Its field
//! layout is not a published contract and shifts between host builds, so
//! the offsets are discovered once per process by probing a bounded window
//! of the head record, then reused for the process's remaining lifetime.
//! Probing and consumption are strictly separated so the probe can be
//! exercised against synthetic layouts.

use core::ffi::{c_char, c_void};
use std::sync::OnceLock;

use log::{debug, error, info};

use graft_intercept::{ElfImg, maps::scan_maps};

/// Probe window over the head record, in bytes.
const PROBE_WINDOW: usize = 1024;
/// A field is taken as the record's byte size when it falls in this range.
const SIZE_MINIMAL: usize = 0x100;
const SIZE_MAXIMAL: usize = 0x100000;

const WORD: usize = std::mem::size_of::<usize>();

type AccessorFn = unsafe extern "C" fn(usize) -> *const c_char;
type FreeFn = unsafe extern "C" fn(usize);
type GuardFn = unsafe extern "C" fn(usize);

/// Field offsets inside a registry record. The defaults match the common
/// 64-bit layout and are overridden by whatever the probe discovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoLayout {
    pub size_offset: usize,
    pub next_offset: usize,
}

impl Default for SoLayout {
    fn default() -> Self {
        SoLayout { size_offset: 0x18, next_offset: 0x28 }
    }
}

/// Discover the size and next-link offsets.
///
/// `main_words` is the known permanently-resident ("main") record read at
/// word granularity; a word holding a plausible byte size marks the size
/// field. `head_words` is the list head; a word equal to the main record's
/// address (or the vdso sentinel's) marks the next link, and the scan
/// stops there.
pub fn probe_layout(
    head_words: &[usize],
    main_words: &[usize],
    main_addr: usize,
    vdso_addr: Option<usize>,
) -> SoLayout {
    let mut layout = SoLayout::default();
    let window = (PROBE_WINDOW / WORD).min(head_words.len()).min(main_words.len());
    for i in 0..window {
        let possible_size = main_words[i];
        if possible_size > SIZE_MINIMAL && possible_size < SIZE_MAXIMAL {
            layout.size_offset = i * WORD;
        }
        if head_words[i] == main_addr || (vdso_addr.is_some() && Some(head_words[i]) == vdso_addr) {
            layout.next_offset = i * WORD;
            break;
        }
    }
    layout
}

/// Handle over the located registry: the head record, the discovered
/// layout, and the linker's own accessor and free routines.
pub struct SoList {
    head: usize,
    layout: SoLayout,
    get_realpath: AccessorFn,
    get_soname: AccessorFn,
    soinfo_free: FreeFn,
    guard: Option<(GuardFn, GuardFn)>,
    load_counter: Option<usize>,
    unload_counter: Option<usize>,
}

/// Scoped acquisition of the linker's internal data guard. When the guard
/// routines were not located, mutation proceeds unguarded: refusing to
/// operate would itself leave detectable evidence.
struct DataGuard<'a> {
    list: &'a SoList,
    token: [usize; 4],
}

impl<'a> DataGuard<'a> {
    fn acquire(list: &'a SoList) -> DataGuard<'a> {
        let guard = DataGuard { list, token: [0; 4] };
        if let Some((ctor, _)) = list.guard {
            unsafe { ctor(guard.token.as_ptr() as usize) };
        }
        guard
    }
}

impl Drop for DataGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, dtor)) = self.list.guard {
            unsafe { dtor(self.token.as_ptr() as usize) };
        }
    }
}

impl SoList {
    fn next(&self, record: usize) -> usize {
        unsafe { *((record + self.layout.next_offset) as *const usize) }
    }

    fn size(&self, record: usize) -> usize {
        unsafe { *((record + self.layout.size_offset) as *const usize) }
    }

    fn set_size(&self, record: usize, size: usize) {
        unsafe { *((record + self.layout.size_offset) as *mut usize) = size }
    }

    fn path(&self, record: usize) -> Option<String> {
        let ptr = unsafe { (self.get_realpath)(record) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { core::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    fn name(&self, record: usize) -> Option<String> {
        let ptr = unsafe { (self.get_soname)(record) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { core::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    /// Drop every record whose path contains `target`. A record counts as
    /// dropped only when its size was still non-zero: re-running over an
    /// already-scrubbed list mutates nothing and reports false.
    pub fn drop_path(&self, target: &str) -> bool {
        let mut found = false;
        let mut record = self.head;
        while record != 0 {
            let next = self.next(record);
            if let (Some(name), Some(path)) = (self.name(record), self.path(record)) {
                if path.contains(target) && self.size(record) > 0 {
                    let _guard = DataGuard::acquire(self);
                    info!(
                        "dropping registry record for {} at {} (size {})",
                        name,
                        path,
                        self.size(record)
                    );
                    self.set_size(record, 0);
                    unsafe { (self.soinfo_free)(record) };
                    found = true;
                }
            }
            record = next;
        }
        found
    }

    /// Saturating decrement of the linker's load/unload tallies, when the
    /// counters exist in this build.
    pub fn reset_counters(&self, load: usize, unload: usize) {
        let (Some(load_addr), Some(unload_addr)) = (self.load_counter, self.unload_counter) else {
            info!("module counters not present, skipping reset");
            return;
        };
        unsafe {
            saturating_reset(&mut *(load_addr as *mut u64), load as u64);
            saturating_reset(&mut *(unload_addr as *mut u64), unload as u64);
        }
    }
}

fn saturating_reset(counter: &mut u64, by: u64) {
    if *counter >= by {
        *counter -= by;
    }
}

/// Locate the registry inside the linker image. Returns `None` when any
/// required symbol is missing, which disables scrubbing for this process.
fn initialize() -> Option<SoList> {
    let maps = scan_maps();
    let img = ElfImg::find("/linker64", &maps)
        .or_else(|_| ElfImg::find("/linker", &maps))
        .ok()?;

    let head_name = img.symbol_name_by_prefix("__dl__ZL6solist")?;
    debug!("found registry head symbol {head_name}");
    // Build tooling appends one shared suffix to all internal statics.
    let suffix = head_name.strip_prefix("__dl__ZL6solist").unwrap_or("").to_string();

    let head = img.static_pointer(&head_name)?;
    let main = img.static_pointer(&format!("__dl__ZL6somain{suffix}"))?;
    // The tail slot is located to validate the symbol set; the scrub walks
    // forward from the head and never moves the tail itself.
    img.symbol_address(&format!("__dl__ZL6sonext{suffix}"))?;
    let vdso = img.static_pointer(&format!("__dl__ZL4vdso{suffix}"));

    let free_name = img.symbol_name_by_prefix("__dl__ZL11soinfo_freeP6soinfo")?;
    let soinfo_free = img.symbol_address(&free_name)?;
    let get_realpath = img.symbol_address("__dl__ZNK6soinfo12get_realpathEv")?;
    let get_soname = img.symbol_address("__dl__ZNK6soinfo10get_sonameEv")?;

    let guard_ctor = img.symbol_address("__dl__ZN18ProtectedDataGuardC2Ev");
    let guard_dtor = img.symbol_address("__dl__ZN18ProtectedDataGuardD2Ev");
    let guard = match (guard_ctor, guard_dtor) {
        (Some(c), Some(d)) => Some(unsafe {
            (
                std::mem::transmute::<usize, GuardFn>(c),
                std::mem::transmute::<usize, GuardFn>(d),
            )
        }),
        _ => None,
    };

    let load_counter = img.symbol_address("__dl__ZL21g_module_load_counter");
    let unload_counter = img.symbol_address("__dl__ZL23g_module_unload_counter");

    let head_words = unsafe {
        std::slice::from_raw_parts(head as *const usize, PROBE_WINDOW / WORD)
    };
    let main_words = unsafe {
        std::slice::from_raw_parts(main as *const usize, PROBE_WINDOW / WORD)
    };
    let layout = probe_layout(head_words, main_words, main, vdso);
    debug!("registry layout probed: {layout:?}");

    Some(SoList {
        head,
        layout,
        get_realpath: unsafe { std::mem::transmute::<usize, AccessorFn>(get_realpath) },
        get_soname: unsafe { std::mem::transmute::<usize, AccessorFn>(get_soname) },
        soinfo_free: unsafe { std::mem::transmute::<usize, FreeFn>(soinfo_free) },
        guard,
        load_counter,
        unload_counter,
    })
}

fn shared() -> Option<&'static SoList> {
    static LIST: OnceLock<Option<SoList>> = OnceLock::new();
    LIST.get_or_init(|| {
        let list = initialize();
        if list.is_none() {
            error!("module registry not locatable, scrubbing disabled");
        }
        list
    })
    .as_ref()
}

/// Erase evidence of loading anything under `target`: adjust the load
/// tallies, drop matching registry records, and optionally re-label the
/// matching memory mappings.
pub fn clean_trace(target: &str, loaded: usize, unloaded: usize, spoof: bool) {
    debug!("cleaning trace for {target}");
    let Some(list) = shared() else { return };
    if loaded > 0 || unloaded > 0 {
        list.reset_counters(loaded, unloaded);
    }
    let found = list.drop_path(target);
    if found && spoof {
        spoof_maps(target);
    }
}

/// Replace every mapping whose path contains `target` with an anonymous
/// copy at the same address with the same bytes and protections, erasing
/// only the path label a mapping-introspection pass would report.
pub fn spoof_maps(target: &str) {
    debug!("spoofing mappings for {target}");
    for map in scan_maps() {
        if map.inode == 0 || !map.path.contains(target) {
            continue;
        }
        let addr = map.start as *mut c_void;
        let size = map.end - map.start;
        unsafe {
            let copy = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            );
            if copy == libc::MAP_FAILED {
                error!("cannot stage copy of {} [{addr:p}, {size:#x}]", map.path);
                continue;
            }
            if map.perms & libc::PROT_READ == 0 {
                libc::mprotect(addr, size, libc::PROT_READ);
            }
            std::ptr::copy_nonoverlapping(addr as *const u8, copy as *mut u8, size);
            libc::mremap(copy, size, size, libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED, addr);
            libc::mprotect(addr, size, map.perms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::CString;
    use std::sync::Mutex;

    const TEST_LAYOUT: SoLayout = SoLayout { size_offset: 0x20, next_offset: 0x40 };
    const RECORD_BYTES: usize = 0x80;

    static PATHS: Mutex<Option<HashMap<usize, (CString, CString)>>> = Mutex::new(None);
    static FREED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static GUARD_DEPTH: Mutex<i32> = Mutex::new(0);

    unsafe extern "C" fn fake_realpath(record: usize) -> *const c_char {
        let guard = PATHS.lock().unwrap();
        guard
            .as_ref()
            .and_then(|m| m.get(&record))
            .map(|(_, p)| p.as_ptr())
            .unwrap_or(std::ptr::null())
    }

    unsafe extern "C" fn fake_soname(record: usize) -> *const c_char {
        let guard = PATHS.lock().unwrap();
        guard
            .as_ref()
            .and_then(|m| m.get(&record))
            .map(|(n, _)| n.as_ptr())
            .unwrap_or(std::ptr::null())
    }

    unsafe extern "C" fn fake_free(record: usize) {
        FREED.lock().unwrap().push(record);
    }

    unsafe extern "C" fn fake_guard_ctor(_this: usize) {
        *GUARD_DEPTH.lock().unwrap() += 1;
    }

    unsafe extern "C" fn fake_guard_dtor(_this: usize) {
        *GUARD_DEPTH.lock().unwrap() -= 1;
    }

    /// Build a synthetic registry: boxed record blocks linked through the
    /// test layout's next field.
    fn build_list(specs: &[(&str, &str, usize)]) -> (Vec<Box<[u8]>>, SoList) {
        let mut records: Vec<Box<[u8]>> = specs
            .iter()
            .map(|_| vec![0u8; RECORD_BYTES].into_boxed_slice())
            .collect();

        let addrs: Vec<usize> = records.iter().map(|r| r.as_ptr() as usize).collect();
        let mut paths = HashMap::new();
        for (i, (name, path, size)) in specs.iter().enumerate() {
            let addr = addrs[i];
            let next = addrs.get(i + 1).copied().unwrap_or(0);
            unsafe {
                *(records[i].as_mut_ptr().add(TEST_LAYOUT.size_offset) as *mut usize) = *size;
                *(records[i].as_mut_ptr().add(TEST_LAYOUT.next_offset) as *mut usize) = next;
            }
            paths.insert(addr, (CString::new(*name).unwrap(), CString::new(*path).unwrap()));
        }
        *PATHS.lock().unwrap() = Some(paths);
        FREED.lock().unwrap().clear();

        let list = SoList {
            head: addrs[0],
            layout: TEST_LAYOUT,
            get_realpath: fake_realpath,
            get_soname: fake_soname,
            soinfo_free: fake_free,
            guard: Some((fake_guard_ctor, fake_guard_dtor)),
            load_counter: None,
            unload_counter: None,
        };
        (records, list)
    }

    #[test]
    fn probe_finds_size_and_next_offsets() {
        let main_addr = 0x7000_0000_usize;
        let mut head = [0usize; 128];
        let mut main = [0usize; 128];
        // Size field at word 3 of the main record, next link at word 5 of
        // the head record.
        main[3] = 0x4_2000;
        head[5] = main_addr;
        let layout = probe_layout(&head, &main, main_addr, None);
        assert_eq!(layout.size_offset, 3 * WORD);
        assert_eq!(layout.next_offset, 5 * WORD);
    }

    #[test]
    fn probe_accepts_vdso_sentinel_for_next() {
        let vdso_addr = 0x7100_0000_usize;
        let mut head = [0usize; 128];
        let mut main = [0usize; 128];
        main[2] = 0x800;
        head[4] = vdso_addr;
        let layout = probe_layout(&head, &main, 0x7000_0000, Some(vdso_addr));
        assert_eq!(layout.next_offset, 4 * WORD);
    }

    #[test]
    fn probe_keeps_defaults_when_nothing_matches() {
        let head = [0usize; 128];
        let main = [0usize; 128];
        let layout = probe_layout(&head, &main, 0x7000_0000, None);
        assert_eq!(layout, SoLayout::default());
    }

    #[test]
    fn probe_stops_scanning_at_next_field() {
        let main_addr = 0x7000_0000_usize;
        let mut head = [0usize; 128];
        let mut main = [0usize; 128];
        head[2] = main_addr;
        // This plausible size sits beyond the next link and must not win.
        main[6] = 0x2000;
        let layout = probe_layout(&head, &main, main_addr, None);
        assert_eq!(layout.next_offset, 2 * WORD);
        assert_eq!(layout.size_offset, SoLayout::default().size_offset);
    }

    #[test]
    fn drop_path_is_idempotent() {
        let (_records, list) = build_list(&[
            ("libone.so", "/system/lib64/libone.so", 0x3000),
            ("staged", "/memfd:jit-module (deleted)", 0x5000),
            ("libtwo.so", "/system/lib64/libtwo.so", 0x1000),
        ]);

        assert!(list.drop_path("jit-module"));
        assert_eq!(FREED.lock().unwrap().len(), 1);

        // Second pass: the record's size is already zero, so nothing is
        // freed again and the call reports "not found".
        assert!(!list.drop_path("jit-module"));
        assert_eq!(FREED.lock().unwrap().len(), 1);

        // Unrelated records stay intact.
        assert_eq!(list.size(list.head), 0x3000);
        assert_eq!(*GUARD_DEPTH.lock().unwrap(), 0);
    }

    #[test]
    fn drop_path_misses_report_false() {
        let (_records, list) = build_list(&[("libone.so", "/system/lib64/libone.so", 0x3000)]);
        assert!(!list.drop_path("no-such-path"));
        assert!(FREED.lock().unwrap().is_empty());
    }

    #[test]
    fn counters_saturate_at_zero() {
        let mut load: u64 = 2;
        let mut unload: u64 = 1;
        saturating_reset(&mut load, 5);
        assert_eq!(load, 2, "underflowing reset must not change the counter");
        saturating_reset(&mut load, 2);
        assert_eq!(load, 0);
        saturating_reset(&mut unload, 1);
        assert_eq!(unload, 0);
        saturating_reset(&mut unload, 1);
        assert_eq!(unload, 0);
    }

    #[test]
    fn counter_reset_through_list() {
        let (_records, mut list) = build_list(&[("a", "/a", 0x1000)]);
        let mut load: u64 = 3;
        let mut unload: u64 = 0;
        list.load_counter = Some(&mut load as *mut u64 as usize);
        list.unload_counter = Some(&mut unload as *mut u64 as usize);
        list.reset_counters(2, 1);
        assert_eq!(load, 1);
        assert_eq!(unload, 0);
    }
}
