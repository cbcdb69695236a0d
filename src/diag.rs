//! Diagnostic log sink.
//!
//! Spec.md S6 calls for "a text log at a fixed path (`/dev/shm/unvme.log`)
//! opened on first init and closed on teardown, receiving info/debug/error
//! lines." Not part of the core contract, so it is a thin [`log::Log`]
//! implementation rather than something the core modules call directly;
//! core code just uses `log::info!`/`log::debug!`/`log::error!` as usual.
//!
//! Global state is held behind a [`spin::Mutex`], the same pattern the
//! teacher's kernel log service uses for its circular buffer, adapted here
//! to guard a `File` handle instead of an in-memory ring.

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

struct DiagLog {
    file: Mutex<Option<File>>,
}

impl Log for DiagLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(
                file,
                "[{level}] {target}: {args}",
                level = record.level(),
                target = record.target(),
                args = record.args()
            );
        }
    }

    fn flush(&self) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let _ = file.flush();
        }
    }
}

static DIAG: OnceLock<DiagLog> = OnceLock::new();

/// Default diagnostic log path, matching the original's fixed location.
pub fn default_log_path() -> PathBuf {
    PathBuf::from("/dev/shm/unvme.log")
}

/// Opens (creating/truncating) the diagnostic log at `path` and installs it
/// as the global `log` sink. Idempotent: a second call re-opens the file
/// but does not double-register the logger.
///
/// Called once, on first controller init (spec.md S4.5); closed (the file
/// handle dropped) on last `close`.
pub fn init(path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let diag = DIAG.get_or_init(|| DiagLog { file: Mutex::new(None) });
    *diag.file.lock() = Some(file);

    // log::set_logger may only be called once per process; ignore the
    // "already set" error on repeated `open` cycles within one process.
    let _ = log::set_logger(diag).map(|()| log::set_max_level(LevelFilter::Debug));

    Ok(())
}

/// Drops the held file handle, closing the diagnostic log. The global
/// logger registration itself cannot be undone (the `log` facade has no
/// unregister hook), so subsequent log calls after `close` simply have
/// nowhere to write and are silently dropped.
pub fn close() {
    if let Some(diag) = DIAG.get() {
        *diag.file.lock() = None;
    }
}
