//! Module loading, capability negotiation and lifecycle invocation.
//!
//! Modules arrive from the daemon as anonymous memory-backed descriptors.
//! Each one exposes a single entry symbol; calling it is the `on_load`
//! step, during which the module hands us its ABI block through the
//! `register_module` callback and we hand back a version-gated capability
//! table.

use core::ffi::{c_char, c_int, c_long, c_void};
use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, warn};

use crate::args::{AppSpecializeArgs, LegacyAppSpecializeArgs, ServerSpecializeArgs};
use crate::context;
use crate::hooks;
use crate::runtime::{self, NativeMethod};

/// Highest module ABI revision this host implements.
pub const API_VERSION: c_long = 5;

/// Entry symbol every module binary must export.
pub const MODULE_ENTRY_SYMBOL: &str = "graft_module_entry";

/// Name the daemon gives module memfds; doubles as the scrub substring.
pub const MODULE_STAGE_NAME: &str = "jit-module";

pub type ModuleEntryFn = unsafe extern "C" fn(*mut RawApi, *mut c_void);

/// Behavior options a module may set during its callbacks.
pub const OPTION_FORCE_REVERT_UNMOUNT: c_int = 0;
pub const OPTION_UNLOAD_AFTER_SPECIALIZE: c_int = 1;

/// The ABI block a module registers: requested version plus its lifecycle
/// entry points. All four lifecycle pointers must be present for the
/// module to be considered valid.
#[repr(C)]
pub struct ModuleAbi {
    pub api_version: c_long,
    pub handle: *mut c_void,
    pub pre_app_specialize: Option<unsafe extern "C" fn(*mut c_void, *mut AppSpecializeArgs)>,
    pub post_app_specialize: Option<unsafe extern "C" fn(*mut c_void, *const AppSpecializeArgs)>,
    pub pre_server_specialize: Option<unsafe extern "C" fn(*mut c_void, *mut ServerSpecializeArgs)>,
    pub post_server_specialize: Option<unsafe extern "C" fn(*mut c_void, *const ServerSpecializeArgs)>,
}

/// The capability table handed to a module's entry function. Fields beyond
/// `register_module` are filled in according to the version the module
/// requests; a v1 module never observes the v2+ slots.
#[repr(C)]
pub struct RawApi {
    /// Back-pointer to the owning [`ModuleHandle`].
    pub owner: *mut c_void,
    pub register_module: unsafe extern "C" fn(*mut RawApi, *mut ModuleAbi) -> bool,

    // v1
    pub hook_native_methods:
        Option<unsafe extern "C" fn(*mut c_void, *const c_char, *mut NativeMethod, c_int)>,
    pub plt_hook_register:
        Option<unsafe extern "C" fn(*const c_char, *const c_char, *mut c_void, *mut *mut c_void)>,
    pub plt_hook_exclude: Option<unsafe extern "C" fn(*const c_char, *const c_char)>,
    pub plt_hook_commit: Option<unsafe extern "C" fn() -> bool>,
    pub connect_companion: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub set_option: Option<unsafe extern "C" fn(*mut c_void, c_int)>,

    // v2
    pub get_module_dir: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub get_flags: Option<unsafe extern "C" fn(*mut c_void) -> u32>,

    // v4
    pub plt_hook_register_ident:
        Option<unsafe extern "C" fn(u64, u64, *const c_char, *mut c_void, *mut *mut c_void)>,
    pub plt_hook_commit_ident: Option<unsafe extern "C" fn() -> bool>,
    pub exempt_fd: Option<unsafe extern "C" fn(c_int) -> bool>,
}

impl RawApi {
    fn empty(owner: *mut c_void) -> Self {
        RawApi {
            owner,
            register_module: register_module_impl,
            hook_native_methods: None,
            plt_hook_register: None,
            plt_hook_exclude: None,
            plt_hook_commit: None,
            connect_companion: None,
            set_option: None,
            get_module_dir: None,
            get_flags: None,
            plt_hook_register_ident: None,
            plt_hook_commit_ident: None,
            exempt_fd: None,
        }
    }

    /// Strip every capability pointer. Called before self-unload so a
    /// module that kept the table cannot call into released code.
    pub fn clear(&mut self) {
        *self = RawApi::empty(self.owner);
    }
}

/// One loaded module binary and its negotiated state.
pub struct ModuleHandle {
    index: usize,
    dl_handle: *mut c_void,
    entry: ModuleEntryFn,
    api: Box<RawApi>,
    abi: *mut ModuleAbi,
    unload_requested: std::cell::Cell<bool>,
}

impl ModuleHandle {
    pub fn new(index: usize, dl_handle: *mut c_void, entry: ModuleEntryFn) -> Box<ModuleHandle> {
        let mut module = Box::new(ModuleHandle {
            index,
            dl_handle,
            entry,
            api: Box::new(RawApi::empty(std::ptr::null_mut())),
            abi: std::ptr::null_mut(),
            unload_requested: std::cell::Cell::new(false),
        });
        module.api.owner = &mut *module as *mut ModuleHandle as *mut c_void;
        module
    }

    /// Run the module entry. The module registers its ABI from inside this
    /// call; afterwards [`ModuleHandle::valid`] reflects the outcome.
    pub fn on_load(&mut self, env: *mut c_void) {
        unsafe { (self.entry)(&mut *self.api, env) }
    }

    /// A module missing any lifecycle entry point is tracked but never
    /// invoked.
    pub fn valid(&self) -> bool {
        if self.abi.is_null() {
            return false;
        }
        let abi = unsafe { &*self.abi };
        matches!(abi.api_version, 1..=API_VERSION)
            && abi.pre_app_specialize.is_some()
            && abi.post_app_specialize.is_some()
            && abi.pre_server_specialize.is_some()
            && abi.post_server_specialize.is_some()
    }

    fn api_version(&self) -> c_long {
        if self.abi.is_null() { 0 } else { unsafe { (*self.abi).api_version } }
    }

    pub fn pre_app_specialize(&self, args: &mut AppSpecializeArgs) {
        if !self.valid() {
            return;
        }
        let abi = unsafe { &*self.abi };
        let Some(func) = abi.pre_app_specialize else { return };
        match self.api_version() {
            1 | 2 => unsafe {
                let mut legacy = LegacyAppSpecializeArgs::from_unified(args);
                let legacy_fn: unsafe extern "C" fn(*mut c_void, *mut LegacyAppSpecializeArgs) =
                    std::mem::transmute(func);
                legacy_fn(abi.handle, &mut legacy);
            },
            _ => unsafe { func(abi.handle, args) },
        }
    }

    pub fn post_app_specialize(&self, args: &AppSpecializeArgs) {
        if !self.valid() {
            return;
        }
        let abi = unsafe { &*self.abi };
        let Some(func) = abi.post_app_specialize else { return };
        match self.api_version() {
            1 | 2 => unsafe {
                let legacy = LegacyAppSpecializeArgs::from_unified(args);
                let legacy_fn: unsafe extern "C" fn(*mut c_void, *const LegacyAppSpecializeArgs) =
                    std::mem::transmute(func);
                legacy_fn(abi.handle, &legacy);
            },
            _ => unsafe { func(abi.handle, args) },
        }
    }

    pub fn pre_server_specialize(&self, args: &mut ServerSpecializeArgs) {
        if !self.valid() {
            return;
        }
        let abi = unsafe { &*self.abi };
        let Some(func) = abi.pre_server_specialize else { return };
        unsafe { func(abi.handle, args) }
    }

    pub fn post_server_specialize(&self, args: &ServerSpecializeArgs) {
        if !self.valid() {
            return;
        }
        let abi = unsafe { &*self.abi };
        let Some(func) = abi.post_server_specialize else { return };
        unsafe { func(abi.handle, args) }
    }

    pub fn request_unload(&self) {
        self.unload_requested.set(true);
    }

    /// Best-effort unload, attempted only when the module asked for it
    /// from its post-specialize callback.
    pub fn try_unload(&self) -> bool {
        if !self.unload_requested.get() || self.dl_handle.is_null() {
            return false;
        }
        unsafe { libc::dlclose(self.dl_handle) == 0 }
    }

    pub fn clear_api(&mut self) {
        self.api.clear();
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Capability-table callback: the module announces its requested ABI
/// version and lifecycle entry points. Versions newer than this host are
/// rejected outright.
unsafe extern "C" fn register_module_impl(api: *mut RawApi, abi: *mut ModuleAbi) -> bool {
    if api.is_null() || abi.is_null() {
        return false;
    }
    unsafe {
        let requested = (*abi).api_version;
        if requested > API_VERSION {
            return false;
        }

        let module = &mut *((*api).owner as *mut ModuleHandle);
        module.abi = abi;

        if requested >= 1 {
            (*api).hook_native_methods = Some(hook_native_methods_impl);
            (*api).plt_hook_register = Some(plt_hook_register_impl);
            (*api).plt_hook_exclude = Some(plt_hook_exclude_impl);
            (*api).plt_hook_commit = Some(plt_hook_commit_impl);
            (*api).connect_companion = Some(connect_companion_impl);
            (*api).set_option = Some(set_option_impl);
        }
        if requested >= 2 {
            (*api).get_module_dir = Some(get_module_dir_impl);
            (*api).get_flags = Some(get_flags_impl);
        }
        if requested >= 4 {
            (*api).plt_hook_register_ident = Some(plt_hook_register_ident_impl);
            (*api).plt_hook_commit_ident = Some(plt_hook_commit_ident_impl);
            (*api).exempt_fd = Some(exempt_fd_impl);
        }
    }
    true
}

unsafe extern "C" fn hook_native_methods_impl(
    env: *mut c_void,
    class_name: *const c_char,
    methods: *mut NativeMethod,
    count: c_int,
) {
    unsafe { runtime::replace_native_methods(env, class_name, methods, count) }
}

unsafe extern "C" fn plt_hook_register_impl(
    pattern: *const c_char,
    symbol: *const c_char,
    replacement: *mut c_void,
    backup: *mut *mut c_void,
) {
    context::with_current(|ctx| unsafe {
        ctx.plt_hook_register(pattern, symbol, replacement, backup)
    });
}

unsafe extern "C" fn plt_hook_exclude_impl(pattern: *const c_char, symbol: *const c_char) {
    context::with_current(|ctx| unsafe { ctx.plt_hook_exclude(pattern, symbol) });
}

unsafe extern "C" fn plt_hook_commit_impl() -> bool {
    context::with_current(|ctx| ctx.plt_hook_commit()).unwrap_or(false)
}

unsafe extern "C" fn connect_companion_impl(owner: *mut c_void) -> c_int {
    let module = unsafe { &*(owner as *const ModuleHandle) };
    graft_protocol::daemon::connect_companion(module.index)
        .map(into_raw_owned_fd)
        .unwrap_or(-1)
}

unsafe extern "C" fn set_option_impl(_owner: *mut c_void, option: c_int) {
    match option {
        OPTION_FORCE_REVERT_UNMOUNT => {
            context::with_current(|ctx| ctx.force_revert_unmount());
        }
        OPTION_UNLOAD_AFTER_SPECIALIZE => {
            let owner = _owner as *const ModuleHandle;
            if !owner.is_null() {
                unsafe { (*owner).request_unload() }
            }
        }
        other => debug!("module requested unknown option {other}"),
    }
}

unsafe extern "C" fn get_module_dir_impl(owner: *mut c_void) -> c_int {
    let module = unsafe { &*(owner as *const ModuleHandle) };
    graft_protocol::daemon::get_module_dir(module.index)
        .map(into_raw_owned_fd)
        .unwrap_or(-1)
}

unsafe extern "C" fn get_flags_impl(_owner: *mut c_void) -> u32 {
    context::with_current(|ctx| ctx.module_visible_flags().bits()).unwrap_or(0)
}

unsafe extern "C" fn plt_hook_register_ident_impl(
    dev: u64,
    inode: u64,
    symbol: *const c_char,
    replacement: *mut c_void,
    backup: *mut *mut c_void,
) {
    if dev == 0 || inode == 0 || symbol.is_null() || replacement.is_null() {
        return;
    }
    let Ok(symbol) = unsafe { core::ffi::CStr::from_ptr(symbol) }.to_str() else {
        return;
    };
    graft_intercept::HookManager::obtain().register(dev, inode, symbol, replacement, backup);
}

unsafe extern "C" fn plt_hook_commit_ident_impl() -> bool {
    match hooks::state() {
        Some(state) => graft_intercept::HookManager::obtain().commit(&state.cached_maps),
        None => false,
    }
}

unsafe extern "C" fn exempt_fd_impl(fd: c_int) -> bool {
    context::with_current(|ctx| ctx.exempt_fd(fd)).unwrap_or(false)
}

fn into_raw_owned_fd(fd: OwnedFd) -> c_int {
    use std::os::fd::IntoRawFd;
    fd.into_raw_fd()
}

/// Open a memory-backed module binary through its descriptor path.
pub fn dlopen_module_fd(memfd: &OwnedFd) -> Option<*mut c_void> {
    let path = format!("/proc/self/fd/{}\0", memfd.as_raw_fd());
    let handle = unsafe { libc::dlopen(path.as_ptr() as *const c_char, libc::RTLD_NOW) };
    if handle.is_null() {
        let err = unsafe { libc::dlerror() };
        let msg = if err.is_null() {
            "unknown".to_string()
        } else {
            unsafe { core::ffi::CStr::from_ptr(err) }.to_string_lossy().into_owned()
        };
        warn!("dlopen of module fd {} failed: {}", memfd.as_raw_fd(), msg);
        return None;
    }
    Some(handle)
}

/// Resolve the module entry symbol from an opened handle.
pub fn resolve_entry(handle: *mut c_void) -> Option<ModuleEntryFn> {
    let symbol = std::ffi::CString::new(MODULE_ENTRY_SYMBOL).ok()?;
    let sym = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if sym.is_null() {
        return None;
    }
    Some(unsafe { std::mem::transmute::<*mut c_void, ModuleEntryFn>(sym) })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records lifecycle calls made into the fake module below.
    pub(crate) static CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static VALID_ABI: Mutex<ModuleAbi> = Mutex::new(ModuleAbi {
        api_version: API_VERSION,
        handle: std::ptr::null_mut(),
        pre_app_specialize: Some(pre_app),
        post_app_specialize: Some(post_app),
        pre_server_specialize: Some(pre_server),
        post_server_specialize: Some(post_server),
    });

    unsafe impl Send for ModuleAbi {}

    unsafe extern "C" fn pre_app(_: *mut c_void, _: *mut AppSpecializeArgs) {
        CALLS.lock().unwrap().push("pre_app");
    }
    unsafe extern "C" fn post_app(_: *mut c_void, _: *const AppSpecializeArgs) {
        CALLS.lock().unwrap().push("post_app");
    }
    unsafe extern "C" fn pre_server(_: *mut c_void, _: *mut ServerSpecializeArgs) {
        CALLS.lock().unwrap().push("pre_server");
    }
    unsafe extern "C" fn post_server(_: *mut c_void, _: *const ServerSpecializeArgs) {
        CALLS.lock().unwrap().push("post_server");
    }

    pub(crate) unsafe extern "C" fn valid_entry(api: *mut RawApi, _env: *mut c_void) {
        CALLS.lock().unwrap().push("on_load");
        let abi = &mut *VALID_ABI.lock().unwrap() as *mut ModuleAbi;
        unsafe {
            assert!(((*api).register_module)(api, abi));
        }
    }

    static INVALID_ABI: Mutex<ModuleAbi> = Mutex::new(ModuleAbi {
        api_version: API_VERSION,
        handle: std::ptr::null_mut(),
        pre_app_specialize: Some(pre_app),
        post_app_specialize: None,
        pre_server_specialize: Some(pre_server),
        post_server_specialize: Some(post_server),
    });

    pub(crate) unsafe extern "C" fn incomplete_entry(api: *mut RawApi, _env: *mut c_void) {
        CALLS.lock().unwrap().push("on_load");
        let abi = &mut *INVALID_ABI.lock().unwrap() as *mut ModuleAbi;
        unsafe {
            // Registration itself succeeds; validity is judged separately.
            assert!(((*api).register_module)(api, abi));
        }
    }

    static FUTURE_ABI: Mutex<ModuleAbi> = Mutex::new(ModuleAbi {
        api_version: API_VERSION + 1,
        handle: std::ptr::null_mut(),
        pre_app_specialize: Some(pre_app),
        post_app_specialize: Some(post_app),
        pre_server_specialize: Some(pre_server),
        post_server_specialize: Some(post_server),
    });

    unsafe extern "C" fn future_entry(api: *mut RawApi, _env: *mut c_void) {
        let abi = &mut *FUTURE_ABI.lock().unwrap() as *mut ModuleAbi;
        unsafe {
            assert!(!((*api).register_module)(api, abi));
        }
    }

    pub(crate) fn make_module(index: usize, entry: ModuleEntryFn) -> Box<ModuleHandle> {
        // A real dlopen handle so try_unload exercises the genuine dlclose
        // path; opening libc again only bumps its refcount.
        let handle = unsafe { libc::dlopen(c"libc.so.6".as_ptr(), libc::RTLD_NOW) };
        ModuleHandle::new(index, handle, entry)
    }

    #[test]
    fn valid_module_negotiates_full_table() {
        let mut module = make_module(0, valid_entry);
        module.on_load(std::ptr::null_mut());
        assert!(module.valid());
        assert!(module.api.plt_hook_register.is_some());
        assert!(module.api.exempt_fd.is_some());
    }

    #[test]
    fn module_missing_lifecycle_entry_is_invalid_and_never_called() {
        let mut module = make_module(0, incomplete_entry);
        module.on_load(std::ptr::null_mut());
        assert!(!module.valid());

        let before = CALLS.lock().unwrap().len();
        let mut server_args = ServerSpecializeArgs {
            uid: std::ptr::null_mut(),
            gid: std::ptr::null_mut(),
            gids: std::ptr::null_mut(),
            runtime_flags: std::ptr::null_mut(),
            permitted_capabilities: std::ptr::null_mut(),
            effective_capabilities: std::ptr::null_mut(),
        };
        module.pre_server_specialize(&mut server_args);
        module.post_server_specialize(&server_args);
        assert_eq!(CALLS.lock().unwrap().len(), before);
    }

    #[test]
    fn future_api_version_is_rejected() {
        let mut module = make_module(0, future_entry);
        module.on_load(std::ptr::null_mut());
        assert!(!module.valid());
    }

    #[test]
    fn unload_only_happens_when_requested() {
        let module = make_module(0, valid_entry);
        assert!(!module.try_unload());
        module.request_unload();
        assert!(module.try_unload());
    }

    #[test]
    fn clear_api_strips_capabilities() {
        let mut module = make_module(0, valid_entry);
        module.on_load(std::ptr::null_mut());
        assert!(module.api.plt_hook_commit.is_some());
        module.clear_api();
        assert!(module.api.plt_hook_commit.is_none());
        // The registration callback itself survives for accounting.
        let owner = module.api.owner;
        assert!(!owner.is_null());
    }
}
