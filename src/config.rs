//! Crate-wide configuration.
//!
//! The original expresses `UNVME_TIMEOUT` and the diagnostic log path as
//! compile-time `#define`s. A library can't fix those at compile time for
//! every caller, so they become a small `Default`-able config struct passed
//! to [`crate::open`].

use std::path::PathBuf;
use std::time::Duration;

/// Default synchronous-operation timeout (`UNVME_TIMEOUT` in the original).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct UnvmeConfig {
    /// Path for the diagnostic log (spec.md S6). Defaults to
    /// `/dev/shm/unvme.log`, the original's fixed location.
    pub log_path: PathBuf,

    /// Default timeout for `read`/`write`, the synchronous convenience
    /// wrappers (`UNVME_TIMEOUT` in the original).
    pub default_timeout: Duration,

    /// Timeout for the internal back-pressure drain a full queue performs
    /// inside `submit` (spec.md S4.3 step 3). A stuck drain surfaces as
    /// `QueueStuck`, not `Timeout`.
    pub back_pressure_timeout: Duration,
}

impl Default for UnvmeConfig {
    fn default() -> Self {
        UnvmeConfig {
            log_path: crate::diag::default_log_path(),
            default_timeout: DEFAULT_TIMEOUT,
            back_pressure_timeout: DEFAULT_TIMEOUT,
        }
    }
}
