//! The per-fork specialization state machine.
//!
//! Exactly one `SpecializeContext` is live per specialization attempt. The
//! patched lifecycle functions are free functions with host-defined
//! signatures, so the context is reachable through a process-global
//! pointer with a narrow validity window: set on construction, cleared on
//! drop, and every consumer treats "unset" as a no-op.

use core::ffi::{c_char, c_int, c_void};
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;
use log::{debug, info, warn};
use regex::Regex;

use graft_intercept::HookManager;
use graft_protocol::{MountNamespace, ProcessFlags, daemon};

use crate::args::{AppSpecializeArgs, ServerSpecializeArgs, grow_int_array};
use crate::hooks;
use crate::module::{self, ModuleHandle};
use crate::solist;

bitflags! {
    /// Phase bits for the current specialization attempt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        const APP_SPECIALIZE = 1 << 0;
        const APP_FORK_AND_SPECIALIZE = 1 << 1;
        const SERVER_FORK_AND_SPECIALIZE = 1 << 2;
        /// Module-induced mounts must be hidden from this worker.
        const DO_REVERT_UNMOUNT = 1 << 3;
        const POST_SPECIALIZE = 1 << 4;
        /// The host must keep its log pipe across this specialization.
        const SKIP_CLOSE_LOG_PIPE = 1 << 5;
        /// The one-shot mount-view decision has been made.
        const MOUNT_DECIDED = 1 << 6;
    }
}

/// Which view a freshly unshared worker namespace should be switched to.
/// `None` leaves the namespace exactly as the host created it.
pub fn choose_mount_view(info: ProcessFlags, flags: SessionFlags) -> Option<MountNamespace> {
    if flags.contains(SessionFlags::SERVER_FORK_AND_SPECIALIZE)
        || info.contains(ProcessFlags::IS_FIRST_PROCESS)
    {
        return None;
    }
    if info.intersects(ProcessFlags::IS_MANAGER | ProcessFlags::GRANTED_ROOT) {
        Some(MountNamespace::Root)
    } else if flags.contains(SessionFlags::DO_REVERT_UNMOUNT) {
        Some(MountNamespace::Module)
    } else {
        None
    }
}

/// Allowed-descriptor bitmap sized to the process's descriptor limit.
pub struct FdSet {
    words: Vec<u64>,
    capacity: usize,
}

impl FdSet {
    pub fn new(capacity: usize) -> FdSet {
        FdSet {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set(&mut self, fd: c_int, allowed: bool) {
        let Ok(fd) = usize::try_from(fd) else { return };
        if fd >= self.capacity {
            return;
        }
        let (word, bit) = (fd / 64, fd % 64);
        if allowed {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }

    pub fn contains(&self, fd: c_int) -> bool {
        let Ok(fd) = usize::try_from(fd) else { return false };
        if fd >= self.capacity {
            return false;
        }
        self.words[fd / 64] & (1 << (fd % 64)) != 0
    }
}

/// Descriptors that must be closed: everything open that is neither
/// allowed nor the enumeration directory's own descriptor.
pub fn compute_close_set(open: &[c_int], allowed: &FdSet, enum_dirfd: c_int) -> Vec<c_int> {
    open.iter()
        .copied()
        .filter(|&fd| fd != enum_dirfd && !allowed.contains(fd))
        .collect()
}

/// Hard descriptor-table cap, the bitmap's dimension.
fn fd_table_size() -> usize {
    let mut limit = libc::rlimit { rlim_cur: 32768, rlim_max: 32768 };
    unsafe {
        libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit);
    }
    limit.rlim_max as usize
}

/// Visit every open descriptor while the enumeration directory is open.
/// The callback receives each fd and the directory's own fd.
fn with_open_fds(mut visit: impl FnMut(c_int, c_int)) {
    unsafe {
        let dir = libc::opendir(c"/proc/self/fd".as_ptr());
        if dir.is_null() {
            return;
        }
        let dfd = libc::dirfd(dir);
        loop {
            let entry = libc::readdir(dir);
            if entry.is_null() {
                break;
            }
            let name = core::ffi::CStr::from_ptr((*entry).d_name.as_ptr());
            if let Ok(fd) = name.to_string_lossy().parse::<c_int>() {
                visit(fd, dfd);
            }
        }
        libc::closedir(dir);
    }
}

/// A deferred hook request matched against mapped paths at commit time.
struct RegexHookRequest {
    pattern: Regex,
    symbol: String,
    replacement: usize,
    backup: usize,
}

/// Suppresses matching requests for a (path pattern, symbol) pair.
struct RegexIgnoreRequest {
    pattern: Regex,
    symbol: Option<String>,
}

pub enum SpecializeArgs {
    App(*mut AppSpecializeArgs),
    Server(*mut ServerSpecializeArgs),
}

impl SpecializeArgs {
    pub fn app(&self) -> Option<&mut AppSpecializeArgs> {
        match self {
            SpecializeArgs::App(p) => unsafe { p.as_mut() },
            SpecializeArgs::Server(_) => None,
        }
    }

    pub fn server(&self) -> Option<&mut ServerSpecializeArgs> {
        match self {
            SpecializeArgs::Server(p) => unsafe { p.as_mut() },
            SpecializeArgs::App(_) => None,
        }
    }
}

static CURRENT: AtomicPtr<SpecializeContext> = AtomicPtr::new(std::ptr::null_mut());

/// Run against the live context, or return `None` outside any
/// specialization attempt.
pub fn with_current<R>(f: impl FnOnce(&mut SpecializeContext) -> R) -> Option<R> {
    let ptr = CURRENT.load(Ordering::Acquire);
    unsafe { ptr.as_mut() }.map(f)
}

pub struct SpecializeContext {
    pub env: *mut c_void,
    pub args: SpecializeArgs,
    /// -1 before fork, 0 in the child, the child pid in the parent.
    pub pid: libc::pid_t,
    pub flags: SessionFlags,
    pub info_flags: ProcessFlags,
    modules: Vec<Box<ModuleHandle>>,
    allowed_fds: FdSet,
    exempted_fds: Vec<c_int>,
    hook_requests: Mutex<(Vec<RegexHookRequest>, Vec<RegexIgnoreRequest>)>,
    process: Option<String>,
}

impl SpecializeContext {
    pub fn new(env: *mut c_void, args: SpecializeArgs) -> Box<SpecializeContext> {
        let mut ctx = Box::new(SpecializeContext {
            env,
            args,
            pid: -1,
            flags: SessionFlags::empty(),
            info_flags: ProcessFlags::empty(),
            modules: Vec::new(),
            allowed_fds: FdSet::new(fd_table_size()),
            exempted_fds: Vec::new(),
            hook_requests: Mutex::new((Vec::new(), Vec::new())),
            process: None,
        });
        CURRENT.store(&mut *ctx, Ordering::Release);
        ctx
    }

    pub fn is_child(&self) -> bool {
        self.pid <= 0
    }

    pub fn module_visible_flags(&self) -> ProcessFlags {
        self.info_flags.module_visible()
    }

    pub fn force_revert_unmount(&mut self) {
        self.flags |= SessionFlags::DO_REVERT_UNMOUNT;
    }

    // ---- fork bracket --------------------------------------------------

    fn sigmask(how: c_int, signum: c_int) {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signum);
            libc::sigprocmask(how, &set, std::ptr::null_mut());
        }
    }

    /// Fork before any third-party code runs, with the child-termination
    /// signal blocked so the host's own signal handling cannot observe a
    /// child exit mid-bookkeeping.
    pub fn fork_pre(&mut self) {
        Self::sigmask(libc::SIG_BLOCK, libc::SIGCHLD);
        self.pid = hooks::original_fork();

        if !self.is_child() {
            return;
        }

        // Record every currently open descriptor as allowed, then disallow
        // the enumeration directory's own descriptor: it closes when the
        // enumeration ends and must not count as staying open.
        let allowed = &mut self.allowed_fds;
        with_open_fds(|fd, dfd| {
            if fd == dfd {
                return;
            }
            if (fd as usize) < allowed.capacity() {
                allowed.set(fd, true);
            } else {
                unsafe { libc::close(fd) };
            }
        });
    }

    /// Unblock the child-termination signal in case the host did not.
    pub fn fork_post(&mut self) {
        Self::sigmask(libc::SIG_UNBLOCK, libc::SIGCHLD);
    }

    // ---- descriptor sanitization --------------------------------------

    pub fn can_exempt_fd(&self) -> bool {
        if !self.flags.contains(SessionFlags::APP_FORK_AND_SPECIALIZE) {
            return false;
        }
        self.args.app().is_some_and(|a| !a.fds_to_ignore.is_null())
    }

    /// Module request to preserve a descriptor across sanitization.
    /// Honored only while the pre phase of an array-rewriting fork kind is
    /// active; unconditionally accepted once specialization completed.
    pub fn exempt_fd(&mut self, fd: c_int) -> bool {
        if self
            .flags
            .intersects(SessionFlags::POST_SPECIALIZE | SessionFlags::SKIP_CLOSE_LOG_PIPE)
        {
            return true;
        }
        if !self.can_exempt_fd() {
            return false;
        }
        self.exempted_fds.push(fd);
        true
    }

    /// Close every descriptor the child is not allowed to keep.
    pub fn sanitize_fds(&mut self) {
        if !self.is_child() {
            return;
        }

        if self.can_exempt_fd() && !self.exempted_fds.is_empty() {
            for &fd in &self.exempted_fds {
                self.allowed_fds.set(fd, true);
            }
            // Rewrite the caller-owned slot: extend the existing array, or
            // create a fresh one when the host supplied none.
            let exempted = std::mem::take(&mut self.exempted_fds);
            let slot = self.args.app().map(|a| a.fds_to_ignore);
            if let Some(slot) = slot {
                unsafe {
                    let existing: Vec<c_int> = (*slot)
                        .as_ref()
                        .map(|arr| arr.as_slice().to_vec())
                        .unwrap_or_default();
                    for &fd in &existing {
                        self.allowed_fds.set(fd, true);
                    }
                    *slot = grow_int_array(&existing, &exempted);
                }
            }
        }

        let mut open = Vec::new();
        let mut enum_dirfd = -1;
        with_open_fds(|fd, dfd| {
            enum_dirfd = dfd;
            open.push(fd);
        });
        for fd in compute_close_set(&open, &self.allowed_fds, enum_dirfd) {
            unsafe { libc::close(fd) };
        }
    }

    // ---- deferred regex hooks -----------------------------------------

    /// # Safety
    /// `pattern` and `symbol` must be valid C strings for the duration of
    /// the call; `replacement` must be a function with the target's ABI.
    pub unsafe fn plt_hook_register(
        &self,
        pattern: *const c_char,
        symbol: *const c_char,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) {
        if pattern.is_null() || symbol.is_null() || replacement.is_null() {
            return;
        }
        let (Ok(pattern), Ok(symbol)) = (
            unsafe { core::ffi::CStr::from_ptr(pattern) }.to_str(),
            unsafe { core::ffi::CStr::from_ptr(symbol) }.to_str(),
        ) else {
            return;
        };
        let Ok(regex) = Regex::new(pattern) else {
            warn!("rejecting unparseable hook pattern [{pattern}]");
            return;
        };
        let mut guard = self.hook_requests.lock().unwrap_or_else(|e| e.into_inner());
        guard.0.push(RegexHookRequest {
            pattern: regex,
            symbol: symbol.to_string(),
            replacement: replacement as usize,
            backup: backup as usize,
        });
    }

    /// # Safety
    /// `pattern` must be a valid C string; `symbol` may be null to ignore
    /// every symbol for matching paths.
    pub unsafe fn plt_hook_exclude(&self, pattern: *const c_char, symbol: *const c_char) {
        if pattern.is_null() {
            return;
        }
        let Ok(pattern) = unsafe { core::ffi::CStr::from_ptr(pattern) }.to_str() else {
            return;
        };
        let Ok(regex) = Regex::new(pattern) else {
            return;
        };
        let symbol = if symbol.is_null() {
            None
        } else {
            unsafe { core::ffi::CStr::from_ptr(symbol) }
                .to_str()
                .ok()
                .map(str::to_string)
        };
        let mut guard = self.hook_requests.lock().unwrap_or_else(|e| e.into_inner());
        guard.1.push(RegexIgnoreRequest { pattern: regex, symbol });
    }

    /// Drain both request lists atomically, resolve them against the
    /// cached snapshot, then apply the whole batch lock-free.
    pub fn plt_hook_commit(&self) -> bool {
        let Some(state) = hooks::state() else {
            return false;
        };
        // One mapping generation for resolution and application alike.
        let maps = state.cached_maps.clone();
        {
            let mut guard = self.hook_requests.lock().unwrap_or_else(|e| e.into_inner());
            let (requests, ignores) = std::mem::take(&mut *guard);
            drop(guard);
            let manager = HookManager::obtain();
            for map in &maps {
                if map.offset != 0
                    || !map.is_private
                    || map.perms & libc::PROT_READ == 0
                    || map.path.is_empty()
                {
                    continue;
                }
                for request in &requests {
                    if !request.pattern.is_match(&map.path) {
                        continue;
                    }
                    let ignored = ignores.iter().any(|ign| {
                        ign.pattern.is_match(&map.path)
                            && ign.symbol.as_deref().is_none_or(|s| s == request.symbol)
                    });
                    if !ignored {
                        manager.register(
                            map.dev,
                            map.inode,
                            &request.symbol,
                            request.replacement as *mut c_void,
                            request.backup as *mut *mut c_void,
                        );
                    }
                }
            }
        }
        HookManager::obtain().commit(&maps)
    }

    // ---- module lifecycle ----------------------------------------------

    fn run_modules_pre(&mut self) {
        self.load_modules();
        self.invoke_modules_pre();
    }

    fn load_modules(&mut self) {
        let binaries = daemon::read_modules();
        for (index, binary) in binaries.iter().enumerate() {
            let Some(handle) = module::dlopen_module_fd(&binary.memfd) else {
                continue;
            };
            match module::resolve_entry(handle) {
                Some(entry) => {
                    debug!("loaded module [{}]", binary.name);
                    self.modules.push(ModuleHandle::new(index, handle, entry));
                }
                None => {
                    warn!("module [{}] lacks an entry symbol, skipping", binary.name);
                    unsafe { libc::dlclose(handle) };
                }
            }
        }
    }

    fn invoke_modules_pre(&mut self) {
        let env = self.env;
        let mut modules = std::mem::take(&mut self.modules);
        for m in &mut modules {
            m.on_load(env);
            if self.flags.contains(SessionFlags::APP_SPECIALIZE) {
                if let Some(args) = self.args.app() {
                    m.pre_app_specialize(args);
                }
            } else if self.flags.contains(SessionFlags::SERVER_FORK_AND_SPECIALIZE) {
                if let Some(args) = self.args.server() {
                    m.pre_server_specialize(args);
                }
            }
        }
        self.modules = modules;
    }

    /// Post-phase over every module in load order, then the trace scrub.
    /// Returns (unloaded, total) for the registry-counter reset.
    fn run_modules_post(&mut self) -> (usize, usize) {
        self.flags |= SessionFlags::POST_SPECIALIZE;

        let mut unloaded = 0;
        for m in &self.modules {
            if self.flags.contains(SessionFlags::APP_SPECIALIZE) {
                if let Some(args) = self.args.app() {
                    m.post_app_specialize(args);
                }
            } else if self.flags.contains(SessionFlags::SERVER_FORK_AND_SPECIALIZE) {
                if let Some(args) = self.args.server() {
                    m.post_server_specialize(args);
                }
            }
            if m.try_unload() {
                unloaded += 1;
            }
        }

        let total = self.modules.len();
        if total > 0 {
            debug!("modules unloaded: {unloaded}/{total}");
            solist::clean_trace(module::MODULE_STAGE_NAME, total, unloaded, true);
        }
        (unloaded, total)
    }

    // ---- specialization phases -----------------------------------------

    fn app_specialize_pre(&mut self) {
        if !self.flags.contains(SessionFlags::APP_FORK_AND_SPECIALIZE) {
            // The fork path already fetched the classification.
            let uid = self.args.app().map(|a| a.uid()).unwrap_or(0);
            self.info_flags = daemon::get_process_flags(uid);
        }

        if self.info_flags.contains(ProcessFlags::IS_FIRST_PROCESS)
            && !hooks::state().map(|s| s.zygote_unmounted).unwrap_or(true)
        {
            daemon::cache_mount_namespace(unsafe { libc::getpid() });
        }

        if self.info_flags.wants_revert_unmount() {
            info!(
                "[{}] is on the deny list",
                self.process.as_deref().unwrap_or("<unknown>")
            );
            self.flags |= SessionFlags::DO_REVERT_UNMOUNT;
        }

        self.flags |= SessionFlags::APP_SPECIALIZE;
        self.run_modules_pre();
    }

    fn app_specialize_post(&mut self) {
        self.run_modules_post();

        if self
            .info_flags
            .contains(ProcessFlags::IS_MANAGER | ProcessFlags::ROOT_IMPL_ACTIVE)
        {
            info!("manager process detected");
            unsafe {
                libc::setenv(c"GRAFT_ENABLED".as_ptr(), c"1".as_ptr(), 1);
            }
        }
    }

    fn server_specialize_pre(&mut self) {
        self.run_modules_pre();
        daemon::system_server_started();
    }

    fn server_specialize_post(&mut self) {
        self.run_modules_post();
    }

    // ---- entry points driven by the replaced host functions ------------

    pub fn fork_and_specialize_pre(&mut self) {
        self.flags |= SessionFlags::APP_FORK_AND_SPECIALIZE;
        self.process = self.args.app().and_then(|a| a.nice_name().map(str::to_string));
        debug!(
            "pre fork-and-specialize [{}]",
            self.process.as_deref().unwrap_or("<unknown>")
        );

        let uid = self.args.app().map(|a| a.uid()).unwrap_or(0);
        self.info_flags = daemon::get_process_flags(uid);

        if let Some(state) = hooks::state() {
            if !state.zygote_unmounted {
                // Capture the pristine view before any worker observes it,
                // then move the zygote itself onto the clean view once.
                if self.info_flags.contains(ProcessFlags::IS_FIRST_PROCESS) {
                    daemon::cache_mount_namespace(unsafe { libc::getpid() });
                }
                if update_mount_namespace(MountNamespace::Clean) {
                    state.zygote_unmounted = true;
                    debug!("zygote mount view cleared");
                }
            }
        }

        self.fork_pre();
        if self.is_child() {
            self.app_specialize_pre();
        }
        self.sanitize_fds();
    }

    pub fn fork_and_specialize_post(&mut self) {
        if self.is_child() {
            debug!(
                "post fork-and-specialize [{}]",
                self.process.as_deref().unwrap_or("<unknown>")
            );
            self.app_specialize_post();
        }
        self.fork_post();
    }

    pub fn specialize_pre(&mut self) {
        self.process = self.args.app().and_then(|a| a.nice_name().map(str::to_string));
        debug!(
            "pre specialize [{}]",
            self.process.as_deref().unwrap_or("<unknown>")
        );
        // Specialize-only workers keep the host's log pipe.
        self.flags |= SessionFlags::SKIP_CLOSE_LOG_PIPE;
        self.app_specialize_pre();
    }

    pub fn specialize_post(&mut self) {
        debug!(
            "post specialize [{}]",
            self.process.as_deref().unwrap_or("<unknown>")
        );
        self.app_specialize_post();
    }

    pub fn fork_server_pre(&mut self) {
        debug!("pre fork-system-server");
        self.flags |= SessionFlags::SERVER_FORK_AND_SPECIALIZE;

        self.fork_pre();
        if self.is_child() {
            self.server_specialize_pre();
        }
        self.sanitize_fds();
    }

    pub fn fork_server_post(&mut self) {
        if self.is_child() {
            debug!("post fork-system-server");
            self.server_specialize_post();
        }
        self.fork_post();
    }

    // ---- mount view -----------------------------------------------------

    /// The one-shot unmount decision, taken at the first opportunity after
    /// the host created the worker's private namespace.
    pub fn apply_mount_decision(&mut self) {
        if self.flags.contains(SessionFlags::MOUNT_DECIDED) {
            return;
        }
        self.flags |= SessionFlags::MOUNT_DECIDED;
        if let Some(view) = choose_mount_view(self.info_flags, self.flags) {
            update_mount_namespace(view);
        }
    }

    pub fn mount_decided(&self) -> bool {
        self.flags.contains(SessionFlags::MOUNT_DECIDED)
    }
}

impl Drop for SpecializeContext {
    fn drop(&mut self) {
        // The global points at this value; clear it first so the patched
        // functions fall back to pass-through behavior.
        CURRENT.store(std::ptr::null_mut(), Ordering::Release);

        if !self.is_child() {
            return;
        }

        // Strip capability tables, then arm the deferred self-unload.
        for m in &mut self.modules {
            m.clear_api();
        }
        if let Some(state) = hooks::state() {
            state.should_unload = true;
            state.restore_runtime_entries();
            state.install_unload_hook();
        }
    }
}

/// Enter a daemon-prepared mount namespace.
pub fn update_mount_namespace(kind: MountNamespace) -> bool {
    let Some(ns_path) = daemon::update_mount_namespace(kind) else {
        return false;
    };
    let Ok(path) = std::ffi::CString::new(ns_path.clone()) else {
        return false;
    };
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            warn!("cannot open mount namespace [{ns_path}]");
            return false;
        }
        let ok = libc::setns(fd, libc::CLONE_NEWNS) == 0;
        libc::close(fd);
        if ok {
            debug!("switched mount namespace to [{ns_path}]");
        } else {
            warn!("setns [{ns_path}] failed: {}", std::io::Error::last_os_error());
        }
        ok
    }
}
