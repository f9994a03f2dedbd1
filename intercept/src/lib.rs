//! graft-intercept: the failure-sensitive leaf machinery.
//!
//! Three pieces, all conservative by construction because they execute
//! inside a process whose crash kills the host:
//!
//! * [`maps`]: a one-shot snapshot of the process's memory mappings,
//!   reused for a whole hook phase so every patch in a batch agrees on the
//!   same mapping generation.
//! * [`elf`]: on-disk symbol resolution that never consults the host's
//!   dynamic linker (it may be compromised, or the symbols are local).
//! * [`hook`]: registration, batched commit and revert of PLT/GOT call
//!   target patches, keyed by the backing file's (dev, inode) so multiple
//!   mappings of the same library are handled correctly.

pub mod elf;
pub mod hook;
pub mod maps;
pub mod types;

pub use elf::ElfImg;
pub use hook::HookManager;
pub use maps::scan_maps;
pub use types::{ElfError, MapInfo};

/// Process-global lock for tests that patch live call targets.
///
/// Tests that rewrite the test binary's GOT must hold this to avoid two
/// threads patching the same slot concurrently.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
