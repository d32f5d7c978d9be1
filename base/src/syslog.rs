// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Installs the process-wide logger used by the `log` macros re-exported from this crate.
//!
//! Until `init()` or `init_with()` succeeds every log statement is discarded.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     eprintln!("failed to initialize logging: {}", e);
//! }
//! warn!("surface {:#x} still allocated", 0x0300_0000);
//! ```

use std::env;
use std::ffi::OsStr;
use std::io::Write;
use std::path::PathBuf;

use remain::sorted;
use sync::Mutex;
use thiserror::Error as ThisError;

/// Environment variable that overrides the configured filter.
pub const FILTER_ENV: &str = "RUST_LOG";

static INITIALIZED: Mutex<bool> = Mutex::new(false);

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// Another logger was installed before this one.
    #[error("a logger is already installed: {0}")]
    AlreadyInstalled(log::SetLoggerError),
}

/// Options for the logger.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// `env_logger` filter directives, e.g. `info` or `ipvr::execbuf=trace`.
    pub filter: String,
    /// Name printed in front of each line.
    pub proc_name: String,
    /// Route output through the test harness capture.
    pub is_test: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: String::from("info"),
            proc_name: proc_name().unwrap_or_else(|| String::from("ipvr")),
            is_test: false,
        }
    }
}

fn proc_name() -> Option<String> {
    env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(OsStr::to_os_string))
        .and_then(|s| s.into_string().ok())
}

/// Installs the logger with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(LogConfig::default())
}

/// Installs the logger. `RUST_LOG`, when set, takes precedence over `cfg.filter`.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&cfg.filter);
    if let Ok(filter) = env::var(FILTER_ENV) {
        builder.parse_filters(&filter);
    }
    let name = cfg.proc_name;
    builder.format(move |buf, record| {
        write!(buf, "{} {}", name, record.level())?;
        if let Some(path) = record.file() {
            write!(buf, " [{}", path)?;
            if let Some(line) = record.line() {
                write!(buf, ":{}", line)?;
            }
            write!(buf, "]")?;
        }
        writeln!(buf, " {}", record.args())
    });
    builder.is_test(cfg.is_test);
    builder.try_init().map_err(Error::AlreadyInstalled)?;
    *INITIALIZED.lock() = true;
    Ok(())
}

/// Returns true once a logger from this module has been installed.
pub fn is_initialized() -> bool {
    *INITIALIZED.lock()
}

/// Installs a debug-level logger captured by the test harness. Safe to call from every test.
pub fn test_only_ensure_inited() {
    let mut initialized = INITIALIZED.lock();
    if *initialized {
        return;
    }
    let mut builder = env_logger::Builder::new();
    builder.parse_filters("debug");
    builder.is_test(true);
    // A logger installed by someone else is good enough for tests.
    let _ = builder.try_init();
    *initialized = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_filters_info() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.filter, "info");
        assert!(!cfg.is_test);
    }

    #[test]
    fn test_init_is_idempotent() {
        test_only_ensure_inited();
        test_only_ensure_inited();
        assert!(is_initialized());
        crate::debug!("logging from a test");
    }
}
