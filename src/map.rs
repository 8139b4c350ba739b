//! Virtual-memory plumbing: reserving the address range both regions
//! carve from, installing file-backed mappings over pieces of it, and
//! handing ranges back to the reservation.
//!
//! The reservation is a single anonymous `PROT_NONE` mapping, so the
//! whole range is contiguous but costs nothing until it is backed.
//! Backing files are created unlinked: they exist only through their
//! descriptor, the kernel reclaims the disk space when the last
//! mapping goes away, and `MAP_SHARED` file pages are written back to
//! disk under memory pressure instead of competing for anonymous swap.
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("unable to find the page size: errno={}", last_errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
    static ref BACKING_DIR: Mutex<Option<PathBuf>> = Default::default();
}

/// Live mappings: the initial reservation plus one per installed
/// backing file.  Surfaced in diagnostics when `mmap` starts failing
/// (usually `vm.max_map_count` exhaustion).
static ACTIVE_MAPPINGS: AtomicUsize = AtomicUsize::new(0);

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn active_mapping_count() -> usize {
    ACTIVE_MAPPINGS.load(Ordering::Relaxed)
}

/// Updates the parent directory for backing files.  `None` falls back
/// to the system temp directory.
pub fn set_backing_directory(path: Option<PathBuf>) {
    let mut dir = BACKING_DIR.lock().unwrap();

    *dir = path;
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Returns a pre-unlinked temporary file in the configured backing
/// directory.
fn get_temp_file() -> Result<File, i32> {
    let dir = BACKING_DIR.lock().unwrap();

    match &*dir {
        Some(path) => tempfile::tempfile_in(path),
        None => tempfile::tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(0))
}

/// Attempts to reserve `size` bytes of address space.  The range is
/// `PROT_NONE` until pieces of it are backed.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_range(size: usize) -> Result<usize, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad reservation size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(last_errno());
    }

    ACTIVE_MAPPINGS.fetch_add(1, Ordering::Relaxed);
    Ok(base as usize)
}

/// Backs `[addr, addr + size)` with a fresh unlinked temporary file,
/// atomically replacing whatever mapping covered the range.  The
/// descriptor is closed on return; the mapping keeps the inode alive.
///
/// Both arguments must be page aligned.
pub fn install_file_mapping(addr: usize, size: usize) -> Result<(), i32> {
    assert!(
        size > 0 && (addr % page_size()) == 0 && (size % page_size()) == 0,
        "Bad mapping addr={:#x} size={} page_size={}",
        addr,
        size,
        page_size()
    );

    let file = get_temp_file()?;
    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(last_errno());
    }

    ACTIVE_MAPPINGS.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Replaces `[addr, addr + size)` with an anonymous `PROT_NONE`
/// mapping, releasing the backing file's pages to the kernel.
///
/// Both arguments must be page aligned.
pub fn reset_to_reserve(addr: usize, size: usize) -> Result<(), i32> {
    assert!(
        size > 0 && (addr % page_size()) == 0 && (size % page_size()) == 0,
        "Bad mapping addr={:#x} size={} page_size={}",
        addr,
        size,
        page_size()
    );

    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(last_errno());
    }

    ACTIVE_MAPPINGS.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}
