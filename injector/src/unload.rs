//! Deferred self-unload.
//!
//! Releasing our own mapping cannot happen from code inside that mapping:
//! the release call would return into unmapped memory. Instead the unload
//! trigger is a patched thread-attribute call whose signature matches the
//! release syscall's argument shape. When the trigger decides to unload,
//! it tail-jumps into a tiny stub staged on a page *outside* our image;
//! the stub performs the unmap syscall and returns the trigger's original
//! result straight to the trigger's caller. Phase 1 (revert every patch)
//! must fully succeed before phase 2 (release) is attempted; otherwise we
//! deliberately stay resident.

use core::ffi::{c_int, c_void};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};

use crate::hooks;

pub static ORIG_PTHREAD_ATTR_SETSTACKSIZE: AtomicUsize = AtomicUsize::new(0);

/// Runtime address of the staged stub page.
static STUB: AtomicUsize = AtomicUsize::new(0);

/// Arguments the trigger leaves for the stub: the region to release and
/// the return value to forward. Field offsets are part of the trigger's
/// assembly contract.
#[repr(C, align(16))]
struct UnloadAction {
    base: usize,  // +0
    size: usize,  // +8
    res: c_int,   // +16
    _pad: c_int,  // +20
    stub: usize,  // +24
}

struct ActionCell(UnsafeCell<UnloadAction>);
// Safety: written once on the host main thread immediately before the
// tail-jump that consumes it.
unsafe impl Sync for ActionCell {}

static ACTION: ActionCell = ActionCell(UnsafeCell::new(UnloadAction {
    base: 0,
    size: 0,
    res: 0,
    _pad: 0,
    stub: 0,
}));

/// `munmap(base, size)` followed by `return res`. Position independent,
/// entered with the munmap arguments in the first two argument registers
/// and the forwarded result in the third.
#[cfg(target_arch = "x86_64")]
const STUB_CODE: &[u8] = &[
    0xb8, 0x0b, 0x00, 0x00, 0x00, // mov eax, SYS_munmap
    0x0f, 0x05, // syscall
    0x89, 0xd0, // mov eax, edx
    0xc3, // ret
];

#[cfg(target_arch = "aarch64")]
const STUB_CODE: &[u8] = &[
    0xe8, 0x1a, 0x80, 0xd2, // mov x8, #215 (munmap)
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0xe0, 0x03, 0x02, 0x2a, // mov w0, w2
    0xc0, 0x03, 0x5f, 0xd6, // ret
];

/// Stage the stub on a fresh executable page. Idempotent; the page is
/// never released (it must survive our own unmapping).
pub fn prepare_stub() -> bool {
    if STUB.load(Ordering::Acquire) != 0 {
        return true;
    }
    unsafe {
        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page = libc::mmap(
            std::ptr::null_mut(),
            page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if page == libc::MAP_FAILED {
            return false;
        }
        std::ptr::copy_nonoverlapping(STUB_CODE.as_ptr(), page as *mut u8, STUB_CODE.len());
        if libc::mprotect(page, page_size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            libc::munmap(page, page_size);
            return false;
        }
        STUB.store(page as usize, Ordering::Release);
    }
    true
}

#[cfg(test)]
pub(crate) fn stub_address() -> usize {
    STUB.load(Ordering::Acquire)
}

/// Decision logic behind the trigger. Returns either `(res << 1)` for the
/// plain passthrough, or the `UnloadAction` address with bit 0 set when
/// the caller must tail-jump into the stub.
unsafe extern "C" fn unload_impl(attr: *mut c_void, stack_size: usize) -> usize {
    let res = {
        let original = ORIG_PTHREAD_ATTR_SETSTACKSIZE.load(Ordering::Acquire);
        if original != 0 {
            let original: unsafe extern "C" fn(*mut c_void, usize) -> c_int =
                unsafe { std::mem::transmute(original) };
            unsafe { original(attr, stack_size) }
        } else {
            0
        }
    };
    let encoded = (res as u32 as usize) << 1;

    // Only the host main thread may unload; worker threads hit this call
    // site constantly during VM thread setup.
    let (tid, pid) = unsafe { (libc::gettid(), libc::getpid()) };
    if tid != pid {
        return encoded;
    }

    let Some(state) = hooks::state() else {
        return encoded;
    };
    if !state.should_unload {
        return encoded;
    }

    debug!("unload trigger fired on main thread");
    state.restore_plt_hooks();
    if !state.should_unload {
        // Phase 1 failed: a call site may still point at us. Stay resident
        // forever rather than risk running unmapped code.
        info!("hook restore incomplete, abandoning self-unload");
        return encoded;
    }

    let stub = STUB.load(Ordering::Acquire);
    if stub == 0 {
        return encoded;
    }

    let Some(state) = hooks::take_state() else {
        return encoded;
    };
    let (base, size) = (state.start_addr, state.block_size);
    drop(state);
    if base == 0 || size == 0 {
        return encoded;
    }

    info!("releasing own image at {base:#x} (+{size:#x})");
    unsafe {
        let action = &mut *ACTION.0.get();
        action.base = base;
        action.size = size;
        action.res = res;
        action.stub = stub;
        (action as *mut UnloadAction as usize) | 1
    }
}

/// The patched thread-attribute entry. Calls into [`unload_impl`] and
/// either returns its decoded result or tail-jumps into the staged stub,
/// so the release syscall returns directly to the trigger's own caller.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn unload_trigger(_attr: *mut c_void, _stack_size: usize) -> c_int {
    core::arch::naked_asm!(
        "push rbp",
        "call {impl_fn}",
        "pop rbp",
        "test al, 1",
        "jnz 2f",
        "sar rax, 1",
        "ret",
        "2:",
        "and rax, -2",
        "mov rdi, [rax]",      // region base
        "mov rsi, [rax + 8]",  // region size
        "mov edx, [rax + 16]", // forwarded result
        "mov rax, [rax + 24]", // stub entry
        "jmp rax",
        impl_fn = sym unload_impl,
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn unload_trigger(_attr: *mut c_void, _stack_size: usize) -> c_int {
    core::arch::naked_asm!(
        "stp x29, x30, [sp, #-16]!",
        "bl {impl_fn}",
        "ldp x29, x30, [sp], #16",
        "tbnz x0, #0, 2f",
        "asr x0, x0, #1",
        "ret",
        "2:",
        "and x9, x0, #0xfffffffffffffffe",
        "ldr x1, [x9, #8]",   // region size
        "ldr w2, [x9, #16]",  // forwarded result
        "ldr x3, [x9, #24]",  // stub entry
        "ldr x0, [x9]",       // region base
        "br x3",
        impl_fn = sym unload_impl,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_layout_matches_assembly_contract() {
        assert_eq!(std::mem::offset_of!(UnloadAction, base), 0);
        assert_eq!(std::mem::offset_of!(UnloadAction, size), 8);
        assert_eq!(std::mem::offset_of!(UnloadAction, res), 16);
        assert_eq!(std::mem::offset_of!(UnloadAction, stub), 24);
        // Alignment keeps bit 0 free for the jump flag.
        assert_eq!(std::mem::align_of::<UnloadAction>() % 2, 0);
    }

    #[test]
    fn stub_unmaps_region_and_forwards_result() {
        assert!(prepare_stub());
        let stub = stub_address();
        assert_ne!(stub, 0);

        unsafe {
            let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let victim = libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(victim, libc::MAP_FAILED);

            // The stub's contract: munmap(arg0, arg1), return arg2.
            let stub_fn: unsafe extern "C" fn(*mut c_void, usize, c_int) -> c_int =
                std::mem::transmute(stub);
            let forwarded = stub_fn(victim, page_size, 42);
            assert_eq!(forwarded, 42);

            // The victim page is really gone.
            assert_eq!(libc::msync(victim, page_size, libc::MS_ASYNC), -1);
        }
    }

    #[test]
    fn trigger_without_pending_unload_passes_through() {
        // No hook state installed in this process path: the trigger must
        // behave exactly like the original call.
        let mut attr: libc::pthread_attr_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::pthread_attr_init(&mut attr);
            let res = unload_trigger(
                &mut attr as *mut libc::pthread_attr_t as *mut c_void,
                512 * 1024,
            );
            // With no recorded original the impl substitutes success.
            assert_eq!(res, 0);
            libc::pthread_attr_destroy(&mut attr);
        }
    }
}
