// Parse /etc/devtab once at boot and wire the named major numbers into
// file::DEVSW, rather than reconciling it lazily against concurrent
// mknod calls on first open.
//
// Each line is "<inum> <class> <major> <minor>", e.g. "9 char 1 1" for
// the console. Only class "char" resolves to a live driver today; other
// classes are recorded but not wired (no block-special Devsw exists --
// the IDE gateway is reached through bio.rs, not the file table).

use crate::ext2::fs::{ilock, iunlock, namei, readi};
use crate::file::{Devsw, CONSOLE, DEVSW};
use crate::param::NDEV;

const DEVTAB_PATH: &[u8] = b"/etc/devtab";
const MAX_DEVTAB_SIZE: usize = 4096;

/// Map a major device number named in /etc/devtab to its driver
/// instance. The console is the only char device this kernel ships;
/// other majors are accepted (so an admin can renumber it) but only
/// major 1 actually resolves.
fn driver_for_major(major: u32) -> Option<&'static dyn Devsw> {
    if major as usize == CONSOLE {
        Some(unsafe { &crate::console::CONSOLE_INSTANCE as &dyn Devsw })
    } else {
        None
    }
}

struct Line<'a> {
    class: &'a [u8],
    major: u32,
    minor: u32,
}

fn parse_line(line: &[u8]) -> Option<Line<'_>> {
    let mut fields = line.split(|&b| b == b' ' || b == b'\t').filter(|f| !f.is_empty());
    let _inum = parse_u32(fields.next()?)?;
    let class = fields.next()?;
    let major = parse_u32(fields.next()?)?;
    let minor = parse_u32(fields.next()?)?;
    Some(Line { class, major, minor })
}

fn parse_u32(field: &[u8]) -> Option<u32> {
    let mut n: u32 = 0;
    if field.is_empty() {
        return None;
    }
    for &b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(n)
}

/// Read and apply /etc/devtab. Safe to call even before the file exists
/// (e.g. a root image built without one): falls back to the console's
/// well-known major so the shell still has a tty.
pub fn init() {
    let mut ip = match namei(DEVTAB_PATH) {
        Some(ip) => ip,
        None => {
            log::warn!("devtab: no /etc/devtab, defaulting console to major {}", CONSOLE);
            unsafe {
                DEVSW[CONSOLE] = driver_for_major(CONSOLE as u32);
            }
            return;
        }
    };
    let ip_ref = unsafe { ip.as_mut() };
    ilock(ip_ref);

    let mut buf = [0u8; MAX_DEVTAB_SIZE];
    let cap = (ip_ref.size as usize).min(buf.len());
    let n = readi(ip_ref, false, buf.as_mut_ptr() as usize, 0, cap);
    iunlock(ip_ref);

    let mut wired = 0usize;
    for raw_line in buf[..n].split(|&b| b == b'\n') {
        let line = trim(raw_line);
        if line.is_empty() {
            continue;
        }
        let parsed = match parse_line(line) {
            Some(l) => l,
            None => {
                log::warn!("devtab: malformed line, skipping");
                continue;
            }
        };
        if parsed.class != b"char" {
            continue;
        }
        if parsed.major as usize >= NDEV {
            log::warn!("devtab: major {} out of range", parsed.major);
            continue;
        }
        match driver_for_major(parsed.major) {
            Some(drv) => {
                unsafe {
                    DEVSW[parsed.major as usize] = Some(drv);
                }
                wired += 1;
            }
            None => log::warn!(
                "devtab: no driver for major {} minor {}",
                parsed.major,
                parsed.minor
            ),
        }
    }
    log::info!("devtab: wired {} char device(s) from /etc/devtab", wired);
}

fn trim(s: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = s.len();
    while start < end && (s[start] == b' ' || s[start] == b'\r' || s[start] == b'\t') {
        start += 1;
    }
    while end > start && (s[end - 1] == b' ' || s[end - 1] == b'\r' || s[end - 1] == b'\t') {
        end -= 1;
    }
    &s[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_console_line() {
        let l = parse_line(b"9 char 1 1").unwrap();
        assert_eq!(l.class, b"char");
        assert_eq!(l.major, 1);
        assert_eq!(l.minor, 1);
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(parse_line(b"9 char x 1").is_none());
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_line(b"9 char").is_none());
    }

    #[test]
    fn trims_trailing_carriage_return() {
        assert_eq!(trim(b"9 char 1 1\r"), b"9 char 1 1");
    }
}
