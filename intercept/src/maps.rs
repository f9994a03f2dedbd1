//! `/proc/self/maps` snapshotting.
//!
//! A snapshot is taken once per hook phase and passed around explicitly;
//! mappings can legitimately change between individual patch applications,
//! and a batch must agree on which mapping generation it targets.

use crate::types::MapInfo;

/// Parse one maps line:
/// `start-end perms offset dev inode          path`
fn parse_line(line: &str) -> Option<MapInfo> {
    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());

    let range = fields.next()?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    let perm_str = fields.next()?;
    let perm_bytes = perm_str.as_bytes();
    if perm_bytes.len() < 4 {
        return None;
    }
    let mut perms = 0;
    if perm_bytes[0] == b'r' {
        perms |= libc::PROT_READ;
    }
    if perm_bytes[1] == b'w' {
        perms |= libc::PROT_WRITE;
    }
    if perm_bytes[2] == b'x' {
        perms |= libc::PROT_EXEC;
    }
    let is_private = perm_bytes[3] == b'p';

    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;

    let dev_str = fields.next()?;
    let (maj, min) = dev_str.split_once(':')?;
    let maj = u32::from_str_radix(maj, 16).ok()?;
    let min = u32::from_str_radix(min, 16).ok()?;
    let dev = libc::makedev(maj, min);

    let inode = fields.next()?.parse::<u64>().ok()?;
    let path = fields.next().map(|p| p.trim().to_string()).unwrap_or_default();

    Some(MapInfo {
        start,
        end,
        perms,
        is_private,
        offset,
        dev,
        inode,
        path,
    })
}

/// Snapshot the current process's mappings.
///
/// Unparseable lines are skipped rather than failing the whole scan; a
/// partial snapshot degrades to "fewer hooks land", never to a crash.
pub fn scan_maps() -> Vec<MapInfo> {
    let content = match std::fs::read_to_string("/proc/self/maps") {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    content.lines().filter_map(parse_line).collect()
}

/// Find the (dev, inode) identity of a mapped library by path suffix.
pub fn library_identity(maps: &[MapInfo], suffix: &str) -> Option<(u64, u64)> {
    maps.iter()
        .find(|m| m.inode != 0 && m.path.ends_with(suffix))
        .map(MapInfo::identity)
}

/// Base address of an image: the lowest mapping of that identity whose file
/// offset is zero (where the ELF header lives).
pub fn image_base(maps: &[MapInfo], dev: u64, inode: u64) -> Option<usize> {
    maps.iter()
        .filter(|m| m.dev == dev && m.inode == inode && m.offset == 0)
        .map(|m| m.start)
        .min()
}

/// Full path recorded for an identity, if any mapping carries one.
pub fn image_path(maps: &[MapInfo], dev: u64, inode: u64) -> Option<&str> {
    maps.iter()
        .find(|m| m.dev == dev && m.inode == inode && !m.path.is_empty())
        .map(|m| m.path.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_line() {
        let line = "7f01a2b00000-7f01a2b25000 r-xp 00002000 fd:01 9054305 /usr/lib/libc.so.6";
        let m = parse_line(line).expect("parse");
        assert_eq!(m.start, 0x7f01a2b00000);
        assert_eq!(m.end, 0x7f01a2b25000);
        assert_eq!(m.perms, libc::PROT_READ | libc::PROT_EXEC);
        assert!(m.is_private);
        assert_eq!(m.offset, 0x2000);
        assert_eq!(m.inode, 9054305);
        assert_eq!(m.path, "/usr/lib/libc.so.6");
    }

    #[test]
    fn parses_anonymous_mapping() {
        let line = "7ffd7a9e0000-7ffd7aa01000 rw-p 00000000 00:00 0";
        let m = parse_line(line).expect("parse");
        assert_eq!(m.inode, 0);
        assert!(m.path.is_empty());
        assert_eq!(m.perms, libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn parses_bracketed_pseudo_path() {
        let line = "7ffd7abff000-7ffd7ac00000 r-xp 00000000 00:00 0                  [vdso]";
        let m = parse_line(line).expect("parse");
        assert_eq!(m.path, "[vdso]");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line("not a maps line").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn scan_finds_own_executable() {
        let maps = scan_maps();
        assert!(!maps.is_empty());
        let exe = std::fs::read_link("/proc/self/exe").expect("readlink");
        let exe = exe.to_string_lossy();
        assert!(
            maps.iter().any(|m| m.path == exe),
            "no mapping for {exe} in snapshot"
        );
    }

    #[test]
    fn identity_and_base_agree_with_executable() {
        let maps = scan_maps();
        let exe = std::fs::read_link("/proc/self/exe").expect("readlink");
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        let (dev, inode) = library_identity(&maps, &name).expect("identity");
        let base = image_base(&maps, dev, inode).expect("base");
        // The ELF header must actually be mapped at the computed base.
        let magic = unsafe { std::slice::from_raw_parts(base as *const u8, 4) };
        assert_eq!(magic, b"\x7fELF");
    }
}
