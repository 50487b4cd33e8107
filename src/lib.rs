// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Mikaela Szekely <mikaela.szekely@qyriad.me>
// SPDX-FileContributor: Written by Piotr Esden-Tempski <piotr@esden.net>
// SPDX-FileContributor: Modified by Rachel Mant <git@dragonmux.network>
//! Host-side client library for Apple mobile device DFU, WTF, Recovery, and KIS boot modes.
//!
//! The crate-root surface mirrors the original `libirecovery` C API's shape (spec §6) while
//! expressing it in idiomatic Rust: `open_*`/`close` become [`connection::ClientSession`]'s
//! constructor and `Drop`, the six event callbacks become [`event::Callbacks`], and the
//! process-level `irecv_init`/`irecv_exit` entry points are kept only as no-ops for source
//! compatibility with callers ported from that API (see [`init`]/[`exit`]).

pub mod connection;
pub mod crc;
pub mod db;
pub mod error;
pub mod event;
pub mod hotplug;
pub mod identity;
pub mod kis;
#[cfg(test)]
mod testutil;
pub mod upload;
pub mod usb;

pub use connection::ClientSession;
pub use error::{Error, ErrorKind};
pub use event::{Callbacks, Event};
pub use identity::DeviceInfo;
pub use usb::{Mode, UsbTransport};

use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide debug level (spec §5 "Shared resources"). Torn reads across threads are accepted
/// as debug-only, matching the spec's explicit allowance.
static DEBUG_LEVEL: AtomicU32 = AtomicU32::new(0);

/// Sets the process-wide debug level. Higher values produce more diagnostic writes; this crate
/// itself only reads the level to decide whether to emit `log::debug!`/`log::trace!` calls — it
/// never installs a logger, matching spec §9's "no platform branches in core logic" intent: a host
/// application installs whatever `log` backend (e.g. `env_logger`) it wants.
pub fn set_debug_level(level: u32)
{
    DEBUG_LEVEL.store(level, Ordering::Relaxed);
}

/// Reads the process-wide debug level set by [`set_debug_level`] or the `LIBIRECOVERY_DEBUG_LEVEL`
/// environment variable read at first use.
pub fn debug_level() -> u32
{
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Parses `LIBIRECOVERY_DEBUG_LEVEL` (spec §6) the way a small systems tool parses a debug-level
/// knob: plain decimal, or hex with a `0x`/`0X` prefix. Absent or unparseable values default to 0.
fn parse_debug_level_env(value: &str) -> u32
{
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        value.parse().unwrap_or(0)
    }
}

/// One-time process initializer: seeds [`DEBUG_LEVEL`] from `LIBIRECOVERY_DEBUG_LEVEL` if set.
/// `nusb`, the hot-plug singleton, and every mutex in this crate construct themselves lazily on
/// first use, so there is nothing else for a process-level initializer to do (spec §5 "Startup /
/// teardown"). Every real entry point ([`connection::ClientSession::open_with_ecid`],
/// [`hotplug::subscribe`]) calls this before doing anything else, which is what makes the legacy
/// [`init`] below a genuine no-op rather than the thing callers actually need to invoke.
pub(crate) fn ensure_initialized()
{
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        if let Ok(value) = std::env::var("LIBIRECOVERY_DEBUG_LEVEL") {
            set_debug_level(parse_debug_level_env(&value));
        }
    });
}

/// Legacy entry point from the original API. Calling it is a no-op (spec §5): this crate's
/// process-level initialization happens automatically on first use of any real entry point, not
/// here.
pub fn init() {}

/// Legacy entry point from the original API. Calling it is a no-op: this crate has no process-level
/// teardown to perform (spec §5) — every resource is owned by the value that created it and is
/// released by that value's `Drop`.
pub fn exit() {}

/// The stable English phrase for an error code (spec §6 `strerror`).
pub use error::strerror;

/// This crate's version, as embedded at build time — the Rust equivalent of the original API's
/// `irecv_version()`.
pub fn version() -> &'static str
{
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn debug_level_env_parsing()
    {
        assert_eq!(parse_debug_level_env(""), 0);
        assert_eq!(parse_debug_level_env("3"), 3);
        assert_eq!(parse_debug_level_env("0x10"), 16);
        assert_eq!(parse_debug_level_env("garbage"), 0);
    }

    #[test]
    fn set_and_read_debug_level()
    {
        set_debug_level(7);
        assert_eq!(debug_level(), 7);
        set_debug_level(0);
    }

    #[test]
    fn version_reports_crate_version()
    {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
    }
}
