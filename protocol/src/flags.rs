//! Process classification bits reported by the control daemon.

use bitflags::bitflags;

bitflags! {
    /// Per-UID classification fetched from the daemon when a worker forks.
    ///
    /// The high bits are host-side bookkeeping and are masked out before a
    /// module is allowed to observe the value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcessFlags: u32 {
        /// The worker's UID has been granted root by the active root implementation.
        const GRANTED_ROOT = 1 << 0;
        /// The worker is on the deny list: module mounts must not be visible to it.
        const ON_DENYLIST = 1 << 1;
        /// Module-induced mounts should be reverted when this worker forks.
        const UNMOUNT_ON_FORK = 1 << 2;
        /// Module-induced mounts should be reverted when this worker unshares
        /// its mount namespace.
        const UNMOUNT_ON_UNSHARE = 1 << 3;

        /// The worker is the management app of the root implementation.
        const IS_MANAGER = 1 << 27;
        /// This is the very first worker the zygote forks after its own start.
        const IS_FIRST_PROCESS = 1 << 28;
        /// The root implementation itself is active for this process.
        const ROOT_IMPL_ACTIVE = 1 << 29;
    }
}

impl ProcessFlags {
    /// Bits a module is never allowed to see.
    pub const PRIVATE_MASK: ProcessFlags = ProcessFlags::IS_FIRST_PROCESS
        .union(ProcessFlags::ROOT_IMPL_ACTIVE);

    /// Both unmount conditions present: a revert-mount intent must be recorded.
    pub const UNMOUNT_MASK: ProcessFlags =
        ProcessFlags::UNMOUNT_ON_FORK.union(ProcessFlags::UNMOUNT_ON_UNSHARE);

    /// The classification as exposed through the module capability table.
    pub fn module_visible(self) -> ProcessFlags {
        self & !Self::PRIVATE_MASK
    }

    /// True when the worker must not observe module mounts.
    pub fn wants_revert_unmount(self) -> bool {
        self.contains(Self::UNMOUNT_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmount_mask_requires_both_bits() {
        assert!(!ProcessFlags::UNMOUNT_ON_FORK.wants_revert_unmount());
        assert!(!ProcessFlags::UNMOUNT_ON_UNSHARE.wants_revert_unmount());
        let both = ProcessFlags::UNMOUNT_ON_FORK | ProcessFlags::UNMOUNT_ON_UNSHARE;
        assert!(both.wants_revert_unmount());
    }

    #[test]
    fn module_visible_strips_private_bits() {
        let raw = ProcessFlags::ON_DENYLIST
            | ProcessFlags::IS_FIRST_PROCESS
            | ProcessFlags::ROOT_IMPL_ACTIVE;
        let visible = raw.module_visible();
        assert!(visible.contains(ProcessFlags::ON_DENYLIST));
        assert!(!visible.intersects(ProcessFlags::PRIVATE_MASK));
    }

    #[test]
    fn unknown_bits_survive_from_bits_retain() {
        // The daemon may report bits newer than this build knows about.
        let raw = ProcessFlags::from_bits_retain(1 << 30 | 1);
        assert!(raw.contains(ProcessFlags::GRANTED_ROOT));
        assert_eq!(raw.bits() & (1 << 30), 1 << 30);
    }
}
