//! graft-injector: the code that lives inside the zygote.
//!
//! Compiled as a cdylib and mapped into the host by the out-of-process
//! loader, which then calls [`graft_entry`] with our own image bounds and
//! the daemon's socket directory. From that moment on, control flows only
//! through patched host lifecycle functions:
//!
//! * `strdup` of the runtime init marker → take over the specialization
//!   entry points,
//! * a specialization entry → [`context::SpecializeContext`] drives
//!   fork, module lifecycle and descriptor sanitization,
//! * `unshare` → the one-shot mount-view decision,
//! * thread-attribute setup on the main thread → revert everything and
//!   release our own image.

pub mod args;
pub mod context;
pub mod hooks;
pub mod module;
pub mod runtime;
pub mod solist;
pub mod unload;

use core::ffi::{c_char, c_void};

use log::{error, info};

use graft_protocol::daemon;

/// Injected entry point. `addr`/`size` describe our own mapping so the
/// deferred unload can release it; `path` is the daemon's socket root.
///
/// # Safety
/// Called exactly once by the loader with a valid NUL-terminated `path`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn graft_entry(addr: *mut c_void, size: usize, path: *const c_char) {
    let _ = env_logger::try_init();

    if path.is_null() {
        return;
    }
    let Ok(path) = unsafe { core::ffi::CStr::from_ptr(path) }.to_str() else {
        return;
    };

    info!("injected at {addr:p} (+{size:#x})");
    daemon::init(path);

    if !daemon::ping_heartbeat() {
        error!("control daemon is not running, staying inert");
        return;
    }

    if let Some(fd) = daemon::request_log_pipe() {
        use std::os::fd::IntoRawFd;
        hooks::set_log_pipe(fd.into_raw_fd());
    }

    info!("installing lifecycle hooks");
    hooks::install(addr as usize, size);

    // Our own binary was linked from the daemon's staging directory; make
    // the host's bookkeeping forget it ever loaded anything from there.
    solist::clean_trace(path, 1, 0, false);
}
