use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("cannot open image: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ELF image")]
    NotElf,

    #[error("image truncated or malformed")]
    Malformed,
}

/// One line of `/proc/self/maps`, the unit of the mapping snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub start: usize,
    pub end: usize,
    /// PROT_* bits as they appear in the permission column.
    pub perms: i32,
    /// True for MAP_PRIVATE (`p`), false for shared mappings.
    pub is_private: bool,
    pub offset: u64,
    pub dev: u64,
    pub inode: u64,
    pub path: String,
}

impl MapInfo {
    /// Identity of the backing file, the key hooks are registered under.
    pub fn identity(&self) -> (u64, u64) {
        (self.dev, self.inode)
    }
}
