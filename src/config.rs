//! Tunables, read once from the environment during bootstrap.
//!
//! Unset or unparseable variables keep their defaults, so a stray
//! value never turns into a fatal error; the only configuration that
//! refuses to load is a fry threshold above the bigmaac threshold,
//! which would make the routing ranges overlap.
use std::path::PathBuf;

use static_assertions::const_assert;

/// Template whose parent directory receives the backing files.
pub const DEFAULT_TEMPLATE: &str = "/tmp/bigmaac.XXXXXX";

/// Requests above this many bytes leave the system allocator for the
/// fries region.
pub const DEFAULT_MIN_FRY_SIZE: usize = 16 << 10;

/// Requests above this many bytes go to the bigmaacs region instead.
pub const DEFAULT_MIN_BIGMAAC_SIZE: usize = 2 << 20;

/// Capacity reserved for the fries region.
pub const DEFAULT_SIZE_FRIES: usize = 1 << 30;

/// Capacity reserved for the bigmaacs region.  Address space only;
/// nothing is backed until chunks are allocated.
pub const DEFAULT_SIZE_BIGMAAC: usize = 256 << 30;

const_assert!(DEFAULT_MIN_FRY_SIZE <= DEFAULT_MIN_BIGMAAC_SIZE);
const_assert!(DEFAULT_MIN_BIGMAAC_SIZE <= DEFAULT_SIZE_BIGMAAC);

#[derive(Clone, Debug)]
pub struct Config {
    pub template: PathBuf,
    /// Requests of at most this size bypass to the underlying
    /// allocator.
    pub min_fry: usize,
    /// Requests above this size go to bigmaacs; in between goes to
    /// fries.
    pub min_bigmaac: usize,
    pub size_fries: usize,
    pub size_bigmaac: usize,
    /// Fry requests round up to this multiple.
    pub fry_multiple: usize,
}

impl Config {
    /// Reads the tunables from the environment.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the thresholds or capacities are not usable;
    /// the library must then disable itself rather than misroute.
    pub fn from_env(page_size: usize) -> Result<Config, &'static str> {
        let template = std::env::var_os("BIGMAAC_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE));

        let min_bigmaac = env_size("BIGMAAC_MIN_BIGMAAC_SIZE").unwrap_or(DEFAULT_MIN_BIGMAAC_SIZE);
        let min_fry = env_size("BIGMAAC_MIN_FRY_SIZE").unwrap_or(DEFAULT_MIN_FRY_SIZE);
        let (min_fry, min_bigmaac) = normalized_thresholds(min_fry, min_bigmaac)?;

        let size_fries = round_up(
            env_size("SIZE_FRIES").unwrap_or(DEFAULT_SIZE_FRIES),
            page_size,
        )
        .ok_or("fries capacity overflows")?;
        let size_bigmaac = round_up(
            env_size("SIZE_BIGMAAC").unwrap_or(DEFAULT_SIZE_BIGMAAC),
            page_size,
        )
        .ok_or("bigmaac capacity overflows")?;
        if size_fries == 0 || size_bigmaac == 0 {
            return Err("region capacities must be positive");
        }

        let fry_multiple = env_size("BIGMAAC_FRY_SIZE_MULTIPLE")
            .filter(|&multiple| multiple > 0)
            .unwrap_or(page_size);

        Ok(Config {
            template,
            min_fry,
            min_bigmaac,
            size_fries,
            size_bigmaac,
            fry_multiple,
        })
    }

    /// Directory that receives the backing files.  Only the template's
    /// parent matters: the files are unlinked at birth, so the
    /// placeholder basename is never observable.
    pub fn backing_directory(&self) -> Option<PathBuf> {
        self.template
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| parent.to_path_buf())
    }
}

/// A zero fry threshold disables the fries region by raising it to the
/// bigmaac threshold: everything at or below `min_bigmaac` bypasses.
fn normalized_thresholds(
    min_fry: usize,
    min_bigmaac: usize,
) -> Result<(usize, usize), &'static str> {
    let min_fry = if min_fry == 0 { min_bigmaac } else { min_fry };

    if min_fry > min_bigmaac {
        return Err("fries must be smaller than bigmaacs");
    }

    Ok((min_fry, min_bigmaac))
}

fn env_size(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Rounds `size` up to a multiple of `multiple`, or `None` on
/// overflow.
pub fn round_up(size: usize, multiple: usize) -> Option<usize> {
    debug_assert!(multiple > 0);

    let rem = size % multiple;
    if rem == 0 {
        Some(size)
    } else {
        size.checked_add(multiple - rem)
    }
}
