//! graft-protocol: shared types and the daemon wire protocol.
//!
//! Everything the in-zygote injector and the out-of-process control daemon
//! agree on lives here: process classification bits, the length-prefixed
//! unix-socket codec, and the request client.

pub mod daemon;
pub mod flags;
pub mod wire;

pub use daemon::{DaemonAction, ModuleBinary, MountNamespace};
pub use flags::ProcessFlags;
pub use wire::UnixStreamExt;
