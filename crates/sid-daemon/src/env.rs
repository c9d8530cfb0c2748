// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon binary.

use sid_worker::TimeoutSpec;

/// `tracing-subscriber` filter directive used when `RUST_LOG` isn't set.
pub fn default_log_directive() -> &'static str {
    "sidd=info,sid_worker=info,sid_core=info"
}

/// Default worker exec/idle timeout, `SID_EXEC_TIMEOUT_MS` in milliseconds
/// (0 or unset disables the timeout). `SIGKILL` is used once it fires.
pub fn default_exec_timeout() -> TimeoutSpec {
    let usec = std::env::var("SID_EXEC_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|ms| ms * 1_000)
        .unwrap_or(0);
    if usec == 0 {
        TimeoutSpec::NONE
    } else {
        TimeoutSpec {
            usec,
            signum: nix::sys::signal::Signal::SIGKILL as i32,
        }
    }
}
