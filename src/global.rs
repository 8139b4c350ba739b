//! One-shot bootstrap and the process-wide allocator state.
//!
//! The first entry-point call drives the load-state machine:
//!
//! ```text
//! NOT_LOADED -> LOADING_MEM_FUNCS -> LOADING_LIBRARY -> LOADED
//!                                                    \-> LIBRARY_FAIL
//! ```
//!
//! Exactly one thread claims the bootstrap with a compare-exchange;
//! everyone else observes an intermediate state and bypasses to the
//! underlying allocator.  The states are manual atomics rather than
//! `std::sync::Once` because resolving the underlying symbols
//! re-enters our own entry points on the same thread, and `Once` would
//! self-deadlock there.
//!
//! After `LIBRARY_FAIL` every entry point degrades to a pure
//! passthrough; the host process keeps running without us.
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::Config;
use crate::map;
use crate::real;
use crate::region::Region;

const LIBRARY_FAIL: i32 = -1;
const NOT_LOADED: i32 = 0;
const LOADING_MEM_FUNCS: i32 = 1;
const LOADING_LIBRARY: i32 = 2;
const LOADED: i32 = 3;

static LOAD_STATE: AtomicI32 = AtomicI32::new(NOT_LOADED);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadState {
    LibraryFail,
    NotLoaded,
    LoadingMemFuncs,
    LoadingLibrary,
    Loaded,
}

pub fn load_state() -> LoadState {
    match LOAD_STATE.load(Ordering::Acquire) {
        LIBRARY_FAIL => LoadState::LibraryFail,
        NOT_LOADED => LoadState::NotLoaded,
        LOADING_MEM_FUNCS => LoadState::LoadingMemFuncs,
        LOADING_LIBRARY => LoadState::LoadingLibrary,
        _ => LoadState::Loaded,
    }
}

/// Both regions behind the single process-wide lock.  One lock, not
/// one per region: a realloc that moves a block across regions must be
/// atomic with respect to both.
pub struct LargeAllocator {
    pub fries: Region,
    pub bigmaacs: Region,
}

lazy_static::lazy_static! {
    static ref REGIONS: Mutex<Option<LargeAllocator>> = Mutex::new(None);
}

// Routing thresholds and region bounds, published (Release) before the
// LOADED transition so entry points can classify requests without the
// lock.
static MIN_FRY: AtomicUsize = AtomicUsize::new(0);
static MIN_BIGMAAC: AtomicUsize = AtomicUsize::new(0);
static FRY_MULTIPLE: AtomicUsize = AtomicUsize::new(0);
static BASE_FRIES: AtomicUsize = AtomicUsize::new(0);
static END_BIGMAAC: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub fn min_fry() -> usize {
    MIN_FRY.load(Ordering::Acquire)
}

#[inline]
pub fn min_bigmaac() -> usize {
    MIN_BIGMAAC.load(Ordering::Acquire)
}

#[inline]
pub fn fry_multiple() -> usize {
    FRY_MULTIPLE.load(Ordering::Acquire)
}

#[inline]
pub fn base_fries() -> usize {
    BASE_FRIES.load(Ordering::Acquire)
}

#[inline]
pub fn end_bigmaac() -> usize {
    END_BIGMAAC.load(Ordering::Acquire)
}

/// True when `ptr` falls inside the reservation.  Only meaningful
/// once the state is `Loaded`.
#[inline]
pub fn owns(ptr: usize) -> bool {
    ptr >= base_fries() && ptr < end_bigmaac()
}

pub fn regions() -> &'static Mutex<Option<LargeAllocator>> {
    &REGIONS
}

/// Triggers the bootstrap from an entry point.  Cheap once loaded.
#[inline]
pub fn ensure_loaded() {
    if LOAD_STATE.load(Ordering::Acquire) == NOT_LOADED && !real::have_malloc() {
        init();
    }
}

fn init() {
    if LOAD_STATE
        .compare_exchange(
            NOT_LOADED,
            LOADING_MEM_FUNCS,
            Ordering::SeqCst,
            Ordering::Acquire,
        )
        .is_err()
    {
        // Another thread owns the bootstrap, or it already ran.
        return;
    }

    // The lookup may allocate through our own entry points; the
    // LOADING_MEM_FUNCS state makes those calls fall through.
    if !real::resolve() {
        eprintln!("bigmaac: some underlying allocator symbols did not resolve");
    }

    LOAD_STATE.store(LOADING_LIBRARY, Ordering::Release);

    eprintln!(
        "bigmaac: loading, pid {} ppid {}",
        unsafe { libc::getpid() },
        unsafe { libc::getppid() }
    );

    let config = match Config::from_env(map::page_size()) {
        Ok(config) => config,
        Err(reason) => return fail(reason),
    };

    let total = match config.size_fries.checked_add(config.size_bigmaac) {
        Some(total) => total,
        None => return fail("region capacities overflow the address space"),
    };

    map::set_backing_directory(config.backing_directory());

    // One contiguous reservation; fries low, bigmaacs directly above.
    let base = match map::reserve_range(total) {
        Ok(base) => base,
        Err(err) => return fail_errno("reserving address space", err),
    };

    // Fries share a single backing file for the region's whole
    // lifetime; bigmaac chunks get their own file lazily.
    if let Err(err) = map::install_file_mapping(base, config.size_fries) {
        return fail_errno("backing the fries region", err);
    }

    let fries = Region::new(base, config.size_fries);
    let bigmaacs = Region::new(base + config.size_fries, config.size_bigmaac);
    *REGIONS.lock().unwrap() = Some(LargeAllocator { fries, bigmaacs });

    MIN_FRY.store(config.min_fry, Ordering::Release);
    MIN_BIGMAAC.store(config.min_bigmaac, Ordering::Release);
    FRY_MULTIPLE.store(config.fry_multiple, Ordering::Release);
    BASE_FRIES.store(base, Ordering::Release);
    END_BIGMAAC.store(base + total, Ordering::Release);

    LOAD_STATE.store(LOADED, Ordering::Release);
}

fn fail(reason: &str) {
    eprintln!("bigmaac: failed to initialize: {}", reason);
    LOAD_STATE.store(LIBRARY_FAIL, Ordering::Release);
}

fn fail_errno(what: &str, err: i32) {
    eprintln!(
        "bigmaac: failed to initialize: {}: {}",
        what,
        std::io::Error::from_raw_os_error(err)
    );
    LOAD_STATE.store(LIBRARY_FAIL, Ordering::Release);
}
