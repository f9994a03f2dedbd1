//! Specialization argument ABI shared with the host runtime and modules.
//!
//! The host passes one unified argument block per specialization call; the
//! fields are pointers into the host's own frame so writes made by modules
//! during the pre phase are observed by the native specialization.

use core::ffi::{c_char, c_int, c_void};

/// A host-owned int array (gids, descriptor lists).
#[repr(C)]
#[derive(Debug)]
pub struct RawIntArray {
    pub len: c_int,
    pub data: *mut c_int,
}

impl RawIntArray {
    pub fn as_slice(&self) -> &[c_int] {
        if self.data.is_null() || self.len <= 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
        }
    }
}

/// Build a fresh host-compatible array holding `existing` followed by
/// `extra`. The allocation is intentionally leaked: ownership transfers to
/// the host, which outlives every specialization attempt.
pub fn grow_int_array(existing: &[c_int], extra: &[c_int]) -> *mut RawIntArray {
    let mut combined = Vec::with_capacity(existing.len() + extra.len());
    combined.extend_from_slice(existing);
    combined.extend_from_slice(extra);
    let len = combined.len() as c_int;
    let data = Box::leak(combined.into_boxed_slice()).as_mut_ptr();
    Box::leak(Box::new(RawIntArray { len, data }))
}

/// Unified app-specialization arguments (current ABI, v3+ modules).
#[repr(C)]
pub struct AppSpecializeArgs {
    pub uid: *mut libc::uid_t,
    pub gid: *mut libc::gid_t,
    pub gids: *mut RawIntArray,
    pub runtime_flags: *mut u32,
    pub mount_external: *mut c_int,
    pub se_info: *const c_char,
    pub nice_name: *const c_char,
    pub instruction_set: *const c_char,
    pub app_data_dir: *const c_char,
    pub fds_to_close: *mut RawIntArray,
    /// Caller-owned slot; may hold null when the host supplied no list.
    /// Descriptor exemption rewrites the slot (see `SpecializeContext`).
    pub fds_to_ignore: *mut *mut RawIntArray,
    pub is_child_zygote: *mut bool,
    pub is_top_app: *mut bool,
}

impl AppSpecializeArgs {
    pub fn uid(&self) -> libc::uid_t {
        if self.uid.is_null() { 0 } else { unsafe { *self.uid } }
    }

    pub fn nice_name(&self) -> Option<&str> {
        if self.nice_name.is_null() {
            return None;
        }
        unsafe { core::ffi::CStr::from_ptr(self.nice_name) }.to_str().ok()
    }
}

/// Server-specialization arguments.
#[repr(C)]
pub struct ServerSpecializeArgs {
    pub uid: *mut libc::uid_t,
    pub gid: *mut libc::gid_t,
    pub gids: *mut RawIntArray,
    pub runtime_flags: *mut u32,
    pub permitted_capabilities: *mut u64,
    pub effective_capabilities: *mut u64,
}

/// The app-argument layout the oldest module ABI expects. Synthesized from
/// the unified block for every v1/v2 call so old and new modules observe
/// the same semantic fields under different physical layouts.
#[repr(C)]
pub struct LegacyAppSpecializeArgs {
    pub uid: *mut libc::uid_t,
    pub gid: *mut libc::gid_t,
    pub gids: *mut RawIntArray,
    pub runtime_flags: *mut u32,
    pub mount_external: *mut c_int,
    pub se_info: *const c_char,
    pub nice_name: *const c_char,
    pub instruction_set: *const c_char,
    pub app_data_dir: *const c_char,
}

impl LegacyAppSpecializeArgs {
    pub fn from_unified(args: &AppSpecializeArgs) -> Self {
        LegacyAppSpecializeArgs {
            uid: args.uid,
            gid: args.gid,
            gids: args.gids,
            runtime_flags: args.runtime_flags,
            mount_external: args.mount_external,
            se_info: args.se_info,
            nice_name: args.nice_name,
            instruction_set: args.instruction_set,
            app_data_dir: args.app_data_dir,
        }
    }
}
