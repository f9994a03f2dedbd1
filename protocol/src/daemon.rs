//! Client side of the control-daemon contract.
//!
//! Every request is a fresh connection: one action byte, request fields,
//! response fields, close. The zygote fork path must never stall on the
//! daemon, so all helpers degrade to a default answer on any error instead
//! of propagating it.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::OnceLock;

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::flags::ProcessFlags;
use crate::wire::UnixStreamExt;

#[cfg(target_pointer_width = "64")]
const SOCKET_NAME: &str = "cp64.sock";
#[cfg(target_pointer_width = "32")]
const SOCKET_NAME: &str = "cp32.sock";

/// Request codes understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DaemonAction {
    PingHeartbeat = 0,
    GetProcessFlags = 1,
    ReadModules = 2,
    RequestCompanionSocket = 3,
    GetModuleDir = 4,
    UpdateMountNamespace = 5,
    CacheMountNamespace = 6,
    SystemServerStarted = 7,
    RequestLogPipe = 8,
}

/// Which view of the filesystem a worker should be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MountNamespace {
    /// The zygote's pristine view, with every injection mount removed.
    Clean = 0,
    /// The unrestricted view including the root implementation's mounts.
    Root = 1,
    /// The module-filtered view.
    Module = 2,
}

/// A module binary handed over by the daemon: a display name plus an
/// anonymous memory-backed descriptor holding the shared object.
#[derive(Debug)]
pub struct ModuleBinary {
    pub name: String,
    pub memfd: OwnedFd,
}

static SOCKET_PATH: OnceLock<String> = OnceLock::new();

/// Record the daemon socket directory. Called once from the injected entry
/// point; later calls are ignored.
pub fn init(tmp_path: &str) {
    let _ = SOCKET_PATH.set(format!("{}/{}", tmp_path, SOCKET_NAME));
}

fn connect() -> Result<UnixStream> {
    let path = SOCKET_PATH
        .get()
        .ok_or_else(|| anyhow::anyhow!("daemon client not initialized"))?;
    Ok(UnixStream::connect(path)?)
}

fn request(action: DaemonAction) -> Result<UnixStream> {
    let mut stream = connect()?;
    stream.write_u8(action as u8)?;
    Ok(stream)
}

/// Liveness check. The injector refuses to touch the host when this fails.
pub fn ping_heartbeat() -> bool {
    match request(DaemonAction::PingHeartbeat) {
        Ok(mut stream) => stream.read_u8().map(|b| b == 0).unwrap_or(false),
        Err(e) => {
            debug!("daemon heartbeat failed: {e:#}");
            false
        }
    }
}

/// Fetch the classification for a worker UID. Daemon failure means "no
/// special classification" so specialization proceeds with least side
/// effects.
pub fn get_process_flags(uid: libc::uid_t) -> ProcessFlags {
    let fetch = || -> Result<u32> {
        let mut stream = request(DaemonAction::GetProcessFlags)?;
        stream.write_u32(uid)?;
        stream.read_u32()
    };
    match fetch() {
        Ok(bits) => ProcessFlags::from_bits_retain(bits),
        Err(e) => {
            warn!("get_process_flags({uid}) failed, assuming defaults: {e:#}");
            ProcessFlags::empty()
        }
    }
}

/// Fetch the ordered module list. Each entry carries a memory-backed fd.
pub fn read_modules() -> Vec<ModuleBinary> {
    let fetch = || -> Result<Vec<ModuleBinary>> {
        let mut stream = request(DaemonAction::ReadModules)?;
        let count = stream.read_usize()?;
        let mut modules = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let name = stream.read_string()?;
            let memfd = stream.recv_fd()?;
            modules.push(ModuleBinary { name, memfd });
        }
        Ok(modules)
    };
    match fetch() {
        Ok(modules) => modules,
        Err(e) => {
            warn!("read_modules failed: {e:#}");
            Vec::new()
        }
    }
}

/// Ask the daemon for the path of a prepared mount namespace to enter.
/// Returns the `/proc/<pid>/ns/mnt` style path on success.
pub fn update_mount_namespace(kind: MountNamespace) -> Option<String> {
    let fetch = || -> Result<String> {
        let mut stream = request(DaemonAction::UpdateMountNamespace)?;
        stream.write_u8(kind as u8)?;
        stream.read_string()
    };
    match fetch() {
        Ok(path) if path.starts_with("/proc/") => Some(path),
        Ok(path) => {
            warn!("daemon returned unusable namespace path [{path}]");
            None
        }
        Err(e) => {
            warn!("update_mount_namespace({kind:?}) failed: {e:#}");
            None
        }
    }
}

/// Let the daemon capture the pristine namespace of the given process
/// before any module mounts become visible in it.
pub fn cache_mount_namespace(pid: libc::pid_t) {
    let send = || -> Result<()> {
        let mut stream = request(DaemonAction::CacheMountNamespace)?;
        stream.write_u32(pid as u32)?;
        // Ack byte keeps the daemon's capture ordered before our fork.
        stream.read_u8()?;
        Ok(())
    };
    if let Err(e) = send() {
        warn!("cache_mount_namespace({pid}) failed: {e:#}");
    }
}

/// Open a private channel to a module's out-of-process companion.
pub fn connect_companion(index: usize) -> Option<OwnedFd> {
    let fetch = || -> Result<OwnedFd> {
        let mut stream = request(DaemonAction::RequestCompanionSocket)?;
        stream.write_usize(index)?;
        stream.recv_fd()
    };
    match fetch() {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("connect_companion({index}) failed: {e:#}");
            None
        }
    }
}

/// Open a module's private data directory.
pub fn get_module_dir(index: usize) -> Option<OwnedFd> {
    let fetch = || -> Result<OwnedFd> {
        let mut stream = request(DaemonAction::GetModuleDir)?;
        stream.write_usize(index)?;
        stream.recv_fd()
    };
    match fetch() {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("get_module_dir({index}) failed: {e:#}");
            None
        }
    }
}

/// Open the daemon-backed logging pipe. Held by the injector so the host's
/// own log teardown can be intercepted without touching our channel.
pub fn request_log_pipe() -> Option<OwnedFd> {
    let fetch = || -> Result<OwnedFd> {
        let mut stream = request(DaemonAction::RequestLogPipe)?;
        stream.recv_fd()
    };
    match fetch() {
        Ok(fd) => Some(fd),
        Err(e) => {
            debug!("request_log_pipe failed: {e:#}");
            None
        }
    }
}

/// One-way notification, fired from the system-server pre-specialize phase.
pub fn system_server_started() {
    if let Err(e) = request(DaemonAction::SystemServerStarted) {
        debug!("system_server_started notification failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixListener;

    /// Serve exactly one connection with the given handler on a fresh
    /// socket under a private temp dir, and point the client at it.
    fn with_fake_daemon<F>(handler: F) -> std::thread::JoinHandle<()>
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        let dir = std::env::temp_dir().join(format!("graft-daemon-{}", unsafe {
            libc::getpid()
        }));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(SOCKET_NAME);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind fake daemon");
        // SOCKET_PATH is process-global; all tests share the same directory.
        init(dir.to_str().unwrap());
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        })
    }

    // The fake-daemon tests share one global socket path, so they run in a
    // single test body to avoid cross-talk between parallel test threads.
    #[test]
    fn daemon_roundtrips() {
        // Heartbeat.
        let server = with_fake_daemon(|mut s| {
            assert_eq!(s.read_u8().unwrap(), DaemonAction::PingHeartbeat as u8);
            s.write_u8(0).unwrap();
        });
        assert!(ping_heartbeat());
        server.join().unwrap();

        // Process flags.
        let server = with_fake_daemon(|mut s| {
            assert_eq!(s.read_u8().unwrap(), DaemonAction::GetProcessFlags as u8);
            assert_eq!(s.read_u32().unwrap(), 10144);
            s.write_u32((ProcessFlags::ON_DENYLIST | ProcessFlags::UNMOUNT_MASK).bits())
                .unwrap();
        });
        let flags = get_process_flags(10144);
        assert!(flags.wants_revert_unmount());
        server.join().unwrap();

        // Module list with one memfd-backed entry.
        let server = with_fake_daemon(|mut s| {
            assert_eq!(s.read_u8().unwrap(), DaemonAction::ReadModules as u8);
            s.write_usize(1).unwrap();
            s.write_string("example-module").unwrap();
            let file = std::fs::File::open("/proc/self/maps").unwrap();
            s.send_fd(file.as_raw_fd()).unwrap();
        });
        let modules = read_modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "example-module");
        let mut content = String::new();
        std::fs::File::from(modules[0].memfd.try_clone().unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert!(!content.is_empty());
        server.join().unwrap();

        // Namespace path validation: non-/proc answers are discarded.
        let server = with_fake_daemon(|mut s| {
            assert_eq!(s.read_u8().unwrap(), DaemonAction::UpdateMountNamespace as u8);
            assert_eq!(s.read_u8().unwrap(), MountNamespace::Module as u8);
            s.write_string("error: no namespace cached").unwrap();
        });
        assert_eq!(update_mount_namespace(MountNamespace::Module), None);
        server.join().unwrap();

        let server = with_fake_daemon(|mut s| {
            let _ = s.read_u8();
            let _ = s.read_u8();
            s.write_string("/proc/1234/ns/mnt").unwrap();
        });
        assert_eq!(
            update_mount_namespace(MountNamespace::Root).as_deref(),
            Some("/proc/1234/ns/mnt")
        );
        server.join().unwrap();
    }

    #[test]
    fn action_code_serde_roundtrip() {
        let json = serde_json::to_string(&MountNamespace::Module).unwrap();
        let back: MountNamespace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MountNamespace::Module);
    }
}
