//! Lifecycle function patches and the state that outlives specialization.
//!
//! `HookState` lives as long as the injected image itself. It tracks the
//! patched call targets and their displaced originals, the cached mapping
//! snapshot every commit in this process agrees on, and the self-unload
//! arming bit. Like the specialization context, it is reachable through a
//! process-global pointer because the patched functions cannot carry
//! context arguments.

use core::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use log::{debug, error, info, warn};

use graft_intercept::{HookManager, MapInfo, maps};
use graft_protocol::daemon;

use crate::context::{self, SessionFlags};
use crate::runtime::{self, EntrySwap};
use crate::unload;

/// Host runtime library carrying the lifecycle call sites we patch.
pub const RUNTIME_LIBRARY: &str = "/libandroid_runtime.so";
/// VM library whose thread-attribute setup is the self-unload trigger.
pub const VM_LIBRARY: &str = "/libart.so";
/// The string the host duplicates exactly once, right before it enters its
/// managed init. Seeing it means the runtime tables exist.
const RUNTIME_INIT_MARKER: &str = "com.android.internal.os.ZygoteInit";

static ORIG_FORK: AtomicUsize = AtomicUsize::new(0);
static ORIG_UNSHARE: AtomicUsize = AtomicUsize::new(0);
static ORIG_STRDUP: AtomicUsize = AtomicUsize::new(0);
static ORIG_LOG_CLOSE: AtomicUsize = AtomicUsize::new(0);
static ORIG_SETCONTEXT: AtomicUsize = AtomicUsize::new(0);

/// Daemon-backed logging channel, guarded against the host's log teardown.
static LOG_PIPE: AtomicI32 = AtomicI32::new(-1);

struct PltBackup {
    dev: u64,
    inode: u64,
    symbol: &'static str,
    backup: &'static AtomicUsize,
}

pub struct HookState {
    pub start_addr: usize,
    pub block_size: usize,
    /// The mapping generation all hook commits in this process target.
    pub cached_maps: Vec<MapInfo>,
    plt_backups: Vec<PltBackup>,
    pub should_unload: bool,
    /// Latch: the zygote itself has been moved to the clean mount view.
    pub zygote_unmounted: bool,
    runtime_swap: Option<EntrySwap>,
}

static STATE: AtomicPtr<HookState> = AtomicPtr::new(std::ptr::null_mut());

pub fn state() -> Option<&'static mut HookState> {
    unsafe { STATE.load(Ordering::Acquire).as_mut() }
}

/// Tear down the global state, returning ownership to the caller.
pub(crate) fn take_state() -> Option<Box<HookState>> {
    let ptr = STATE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() { None } else { Some(unsafe { Box::from_raw(ptr) }) }
}

/// Install the lifecycle patches. Called once from the injected entry.
pub fn install(start_addr: usize, block_size: usize) {
    let state = Box::new(HookState {
        start_addr,
        block_size,
        cached_maps: Vec::new(),
        plt_backups: Vec::new(),
        should_unload: false,
        zygote_unmounted: false,
        runtime_swap: None,
    });
    let ptr = Box::into_raw(state);
    STATE.store(ptr, Ordering::Release);
    unsafe { &mut *ptr }.install_lifecycle_hooks();
}

pub fn set_log_pipe(fd: c_int) {
    let previous = LOG_PIPE.swap(fd, Ordering::AcqRel);
    if previous >= 0 {
        unsafe { libc::close(previous) };
    }
}

/// Reopen the daemon log channel if the host tore it down. Runs while the
/// process still holds its pre-transition security context.
fn refresh_log_pipe() {
    if LOG_PIPE.load(Ordering::Acquire) >= 0 {
        return;
    }
    if let Some(fd) = daemon::request_log_pipe() {
        use std::os::fd::IntoRawFd;
        set_log_pipe(fd.into_raw_fd());
    }
}

impl HookState {
    fn register_lifecycle(
        &mut self,
        dev: u64,
        inode: u64,
        symbol: &'static str,
        replacement: *mut c_void,
        backup: &'static AtomicUsize,
    ) {
        let slot = backup.as_ptr() as *mut *mut c_void;
        if !HookManager::obtain().register(dev, inode, symbol, replacement, slot) {
            error!("failed to register hook for {symbol}");
            return;
        }
        self.plt_backups.push(PltBackup { dev, inode, symbol, backup });
    }

    fn install_lifecycle_hooks(&mut self) {
        self.cached_maps = maps::scan_maps();
        let Some((dev, inode)) = maps::library_identity(&self.cached_maps, RUNTIME_LIBRARY)
        else {
            error!("runtime library not mapped, staying inert");
            return;
        };

        self.register_lifecycle(dev, inode, "fork", hook_fork as *mut c_void, &ORIG_FORK);
        self.register_lifecycle(dev, inode, "unshare", hook_unshare as *mut c_void, &ORIG_UNSHARE);
        self.register_lifecycle(dev, inode, "strdup", hook_strdup as *mut c_void, &ORIG_STRDUP);
        self.register_lifecycle(
            dev,
            inode,
            "__android_log_close",
            hook_log_close as *mut c_void,
            &ORIG_LOG_CLOSE,
        );
        self.register_lifecycle(
            dev,
            inode,
            "selinux_android_setcontext",
            hook_setcontext as *mut c_void,
            &ORIG_SETCONTEXT,
        );

        if !HookManager::obtain().commit(&self.cached_maps) {
            error!("lifecycle hook commit failed");
        }

        // A registration whose backup never filled targeted a call site
        // that does not exist in this process; forget it.
        self.plt_backups.retain(|b| b.backup.load(Ordering::Acquire) != 0);
        debug!("{} lifecycle hooks live", self.plt_backups.len());
    }

    /// The runtime finished loading its libraries and registration tables:
    /// take over the specialization entry points and refresh the snapshot
    /// modules will resolve their own hooks against.
    fn on_runtime_init(&mut self) {
        if self.runtime_swap.is_none() {
            self.runtime_swap = runtime::swap_specialize_entries(&self.cached_maps, RUNTIME_LIBRARY);
        }
        self.cached_maps = maps::scan_maps();
    }

    pub fn restore_runtime_entries(&mut self) {
        if let Some(swap) = self.runtime_swap.take() {
            runtime::restore_entries(&swap);
        }
    }

    /// Register the unload trigger against the VM library. The trigger
    /// function runs on the host's main thread only after the worker has
    /// fully left any code we patched.
    pub fn install_unload_hook(&mut self) {
        if !unload::prepare_stub() {
            warn!("cannot stage unload trampoline, staying resident");
            self.should_unload = false;
            return;
        }
        let Some((dev, inode)) = maps::library_identity(&self.cached_maps, VM_LIBRARY) else {
            warn!("VM library not mapped, staying resident");
            self.should_unload = false;
            return;
        };
        self.register_lifecycle(
            dev,
            inode,
            "pthread_attr_setstacksize",
            unload::unload_trigger as *mut c_void,
            &unload::ORIG_PTHREAD_ATTR_SETSTACKSIZE,
        );
        if !HookManager::obtain().commit(&self.cached_maps) {
            error!("unload hook commit failed");
            self.should_unload = false;
        }
        self.plt_backups.retain(|b| b.backup.load(Ordering::Acquire) != 0);
    }

    /// Re-point every patched slot at its recorded original. Any failure
    /// clears `should_unload`: releasing our image while a live call site
    /// still points into it would be fatal to the host.
    pub fn restore_plt_hooks(&mut self) {
        let manager = HookManager::obtain();
        for b in &self.plt_backups {
            let original = b.backup.load(Ordering::Acquire);
            if original == 0 {
                continue;
            }
            if !manager.register(b.dev, b.inode, b.symbol, original as *mut c_void, std::ptr::null_mut())
            {
                error!("failed to queue restore for {}", b.symbol);
                self.should_unload = false;
            }
        }
        if !manager.commit(&self.cached_maps) {
            error!("hook restore commit failed");
            self.should_unload = false;
        }
        if self.should_unload {
            self.plt_backups.clear();
        }
    }
}

// ---- original call-throughs --------------------------------------------

macro_rules! call_original {
    ($slot:expr, $ty:ty, $fallback:expr, ($($arg:expr),*)) => {{
        let original = $slot.load(Ordering::Acquire);
        if original != 0 {
            let original: $ty = unsafe { std::mem::transmute(original) };
            unsafe { original($($arg),*) }
        } else {
            $fallback
        }
    }};
}

pub fn original_fork() -> libc::pid_t {
    call_original!(ORIG_FORK, unsafe extern "C" fn() -> libc::pid_t, unsafe { libc::fork() }, ())
}

fn original_unshare(flags: c_int) -> c_int {
    call_original!(
        ORIG_UNSHARE,
        unsafe extern "C" fn(c_int) -> c_int,
        unsafe { libc::unshare(flags) },
        (flags)
    )
}

fn set_errno(value: c_int) {
    unsafe {
        #[cfg(target_os = "android")]
        {
            *libc::__errno() = value;
        }
        #[cfg(not(target_os = "android"))]
        {
            *libc::__errno_location() = value;
        }
    }
}

// ---- replaced lifecycle functions --------------------------------------

/// The host's own fork call inside its specialization routine returns the
/// pid cached by `fork_pre`, never forking a second time.
unsafe extern "C" fn hook_fork() -> libc::pid_t {
    context::with_current(|ctx| ctx.pid)
        .filter(|pid| *pid >= 0)
        .unwrap_or_else(original_fork)
}

/// Namespace creation is the one-shot decision point for which mount view
/// the worker observes.
unsafe extern "C" fn hook_unshare(flags: c_int) -> c_int {
    let res = original_unshare(flags);
    if res == 0 && flags & libc::CLONE_NEWNS != 0 {
        context::with_current(|ctx| {
            // System server and the very first worker keep their mounts.
            if ctx.flags.contains(SessionFlags::SERVER_FORK_AND_SPECIALIZE)
                || ctx
                    .info_flags
                    .contains(graft_protocol::ProcessFlags::IS_FIRST_PROCESS)
            {
                return;
            }
            if !ctx.mount_decided() {
                ctx.apply_mount_decision();
                // Unshare again so the view we switched into stays private
                // to this worker.
                original_unshare(libc::CLONE_NEWNS);
            }
        });
    }
    set_errno(0);
    res
}

unsafe extern "C" fn hook_strdup(s: *const c_char) -> *mut c_char {
    if !s.is_null() {
        let text = unsafe { core::ffi::CStr::from_ptr(s) };
        if text.to_bytes() == RUNTIME_INIT_MARKER.as_bytes() {
            info!("runtime init marker observed");
            if let Some(state) = state() {
                state.on_runtime_init();
            }
        }
    }
    call_original!(
        ORIG_STRDUP,
        unsafe extern "C" fn(*const c_char) -> *mut c_char,
        unsafe { libc::strdup(s) },
        (s)
    )
}

/// The host tears down its log pipe during specialization; ours follows
/// unless the active path suppresses descriptor closing.
unsafe extern "C" fn hook_log_close() {
    let suppress = context::with_current(|ctx| {
        ctx.flags.contains(SessionFlags::SKIP_CLOSE_LOG_PIPE)
    })
    .unwrap_or(false);
    if !suppress {
        let fd = LOG_PIPE.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
    call_original!(ORIG_LOG_CLOSE, unsafe extern "C" fn(), (), ())
}

/// Secure-context transition: the last moment this process can talk to
/// the daemon with zygote credentials, so re-arm the log channel first.
unsafe extern "C" fn hook_setcontext(
    uid: libc::uid_t,
    is_system_server: c_int,
    seinfo: *const c_char,
    nice_name: *const c_char,
) -> c_int {
    refresh_log_pipe();
    call_original!(
        ORIG_SETCONTEXT,
        unsafe extern "C" fn(libc::uid_t, c_int, *const c_char, *const c_char) -> c_int,
        0,
        (uid, is_system_server, seinfo, nice_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_reset_round_trip() {
        set_errno(libc::EINVAL);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINVAL));
        set_errno(0);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(0));
    }

    #[test]
    fn log_pipe_swap_closes_previous() {
        // Two pipes: installing the second must close the first's read end.
        let mut first = [0 as c_int; 2];
        let mut second = [0 as c_int; 2];
        unsafe {
            assert_eq!(libc::pipe(first.as_mut_ptr()), 0);
            assert_eq!(libc::pipe(second.as_mut_ptr()), 0);
        }
        set_log_pipe(first[0]);
        set_log_pipe(second[0]);
        // first[0] is gone: fcntl on it fails with EBADF.
        let res = unsafe { libc::fcntl(first[0], libc::F_GETFD) };
        assert_eq!(res, -1);
        set_log_pipe(-1);
        unsafe {
            libc::close(first[1]);
            libc::close(second[1]);
        }
    }

    #[test]
    fn install_without_runtime_library_stays_inert() {
        // The test process maps no host runtime library; installation must
        // leave a live but hook-less state behind.
        install(0, 0);
        let state = state().expect("state installed");
        assert!(state.plt_backups.is_empty());
        assert!(!state.should_unload);
        assert!(!state.cached_maps.is_empty());

        // Restoring with nothing patched keeps the unload decision.
        state.should_unload = true;
        state.restore_plt_hooks();
        assert!(state.should_unload);
        take_state();
        assert!(super::state().is_none());
    }

    #[test]
    fn original_fork_falls_back_to_libc() {
        // With no patched original recorded, the passthrough must still
        // produce a working fork.
        assert_eq!(ORIG_FORK.load(Ordering::Acquire), 0);
        let pid = original_fork();
        if pid == 0 {
            unsafe { libc::_exit(0) };
        }
        assert!(pid > 0);
        unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
    }
}
