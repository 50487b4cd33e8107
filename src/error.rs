// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error handling for the library.
//!
//! Mirrors the error taxonomy of the original `libirecovery` C API closely enough that a caller
//! translating this crate's errors back into that API's stable integer codes (see
//! [`ErrorKind::code`]) gets the same numbering.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
#[cfg(feature = "backtrace")]
use std::backtrace::{Backtrace, BacktraceStatus};

use thiserror::Error;

/// Convenience alias for `Box<dyn StdError + Send + Sync>`.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of error this crate can return. Use [`ErrorKind::error`] / [`ErrorKind::error_from`] to
/// build the [`Error`] value for a given kind.
#[derive(Debug)]
pub enum ErrorKind
{
    /// No matching device could be found (discovery failure).
    NoDevice,

    /// A device was found but could not be opened or configured.
    UnableToConnect,

    /// Host-side allocation failed (e.g. reading an oversized firmware file).
    OutOfMemory,

    /// A caller-supplied argument violates a documented range or length constraint.
    InvalidInput(/** why */ Option<String>),

    /// The requested firmware file does not exist or could not be read.
    FileNotFound(/** path */ Option<String>),

    /// The DFU or Recovery upload flow failed (bad length, bad status, retries exhausted).
    UsbUpload,

    /// A `DFU_GETSTATUS` reply was malformed or the device reported an unexpected state.
    UsbStatus,

    /// Claiming or configuring the expected USB interface failed.
    UsbInterface,

    /// Setting the expected USB configuration failed.
    UsbConfiguration,

    /// The endpoint stalled (`STALL`/`PIPE`) on a transfer that wasn't expected to.
    Pipe,

    /// A USB transfer exceeded its timeout.
    Timeout,

    /// This operation is not implemented for the active platform backend.
    Unsupported,

    /// Device returned data that doesn't parse as a valid identity string or KIS response.
    DeviceSeemsInvalid(/** what was invalid */ String),

    /// Unhandled error from an external crate.
    External(ErrorSource),

    /// Catch-all for anything not otherwise classified.
    Unknown,
}

impl ErrorKind
{
    /// The original library's stable integer error code for this kind, for ABI-compatible callers.
    pub const fn code(&self) -> i32
    {
        use ErrorKind::*;
        match self {
            NoDevice => -1,
            OutOfMemory => -2,
            UnableToConnect => -3,
            InvalidInput(_) => -4,
            FileNotFound(_) => -5,
            UsbUpload => -6,
            UsbStatus => -7,
            UsbInterface => -8,
            UsbConfiguration => -9,
            Pipe => -10,
            Timeout => -11,
            Unsupported => -12,
            DeviceSeemsInvalid(_) => -13,
            External(_) => -254,
            Unknown => -255,
        }
    }

    /// Creates a new [`Error`] from this error kind.
    #[inline(always)]
    pub fn error(self) -> Error
    {
        Error::new(self, None)
    }

    /// Creates a new [`Error`] from this error kind, with `source` attached as the cause.
    #[inline(always)]
    pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
    {
        Error::new(self, Some(Box::new(source)))
    }
}

impl From<ErrorKind> for Error
{
    fn from(other: ErrorKind) -> Self
    {
        other.error()
    }
}

impl Display for ErrorKind
{
    fn fmt(&self, f: &mut Formatter) -> fmt::Result
    {
        use ErrorKind::*;
        match self {
            NoDevice => write!(f, "no device found"),
            OutOfMemory => write!(f, "out of memory"),
            UnableToConnect => write!(f, "unable to connect to device"),
            InvalidInput(None) => write!(f, "invalid input"),
            InvalidInput(Some(why)) => write!(f, "invalid input: {}", why),
            FileNotFound(None) => write!(f, "file not found"),
            FileNotFound(Some(path)) => write!(f, "file not found: {}", path),
            UsbUpload => write!(f, "unable to upload data to device"),
            UsbStatus => write!(f, "unable to get device status"),
            UsbInterface => write!(f, "unable to set device interface"),
            UsbConfiguration => write!(f, "unable to set device configuration"),
            Pipe => write!(f, "pipe error"),
            Timeout => write!(f, "transfer timed out"),
            Unsupported => write!(f, "operation not supported"),
            DeviceSeemsInvalid(thing) => write!(f, "device returned invalid data ({})", thing),
            External(source) => write!(f, "unhandled error: {}", source),
            Unknown => write!(f, "unknown error"),
        }
    }
}

/// Error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub struct Error
{
    pub kind: ErrorKind,
    pub source: Option<BoxedError>,

    #[cfg(feature = "backtrace")]
    pub backtrace: Box<Backtrace>,

    /// Additional context about what was being attempted when this error occurred,
    /// e.g. "reading serial string descriptor".
    pub context: Option<String>,
}

impl Error
{
    #[inline(always)]
    pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
    {
        Self {
            kind,
            source,
            context: None,
            #[cfg(feature = "backtrace")]
            backtrace: Box::new(Backtrace::capture()),
        }
    }

    /// Attach context about what was being attempted when this error occurred.
    #[must_use]
    pub fn with_ctx(mut self, ctx: &str) -> Self
    {
        self.context = Some(ctx.to_string());
        self
    }

    /// The stable integer code for this error's kind, for ABI-compatible callers.
    pub const fn code(&self) -> i32
    {
        self.kind.code()
    }
}

impl Display for Error
{
    fn fmt(&self, f: &mut Formatter) -> fmt::Result
    {
        if let Some(ctx) = &self.context {
            write!(f, "(while {}): {}", ctx, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }

        #[cfg(feature = "backtrace")]
        {
            if self.backtrace.status() == BacktraceStatus::Captured {
                write!(f, "\nBacktrace:\n{}", self.backtrace)?;
            }
        }

        if let Some(source) = &self.source {
            write!(f, "\nCaused by: {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error
{
    fn source(&self) -> Option<&(dyn StdError + 'static)>
    {
        self.source.as_deref().map(|e| e as &dyn StdError)
    }
}

impl From<nusb::transfer::TransferError> for Error
{
    fn from(other: nusb::transfer::TransferError) -> Self
    {
        use nusb::transfer::TransferError::*;
        match other {
            Stall => ErrorKind::Pipe.error_from(other),
            Cancelled => ErrorKind::Timeout.error_from(other),
            Disconnected => ErrorKind::NoDevice.error_from(other),
            _ => ErrorKind::External(ErrorSource::NusbTransfer(other.to_string())).error(),
        }
    }
}

impl From<std::io::Error> for Error
{
    fn from(other: std::io::Error) -> Self
    {
        match other.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound(None).error_from(other),
            _ => ErrorKind::External(ErrorSource::StdIo(other)).error(),
        }
    }
}

/// Sources of external error wrapped by [`ErrorKind::External`].
#[derive(Debug, Error)]
pub enum ErrorSource
{
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error("nusb transfer error: {0}")]
    NusbTransfer(String),
}

/// Extension trait for inspecting the [`ErrorKind`] of a `Result<T, Error>` without consuming it.
pub trait ResErrorKind<T>
{
    fn err_kind(&self) -> Result<&T, &ErrorKind>;
}

impl<T> ResErrorKind<T> for Result<T, Error>
{
    fn err_kind(&self) -> Result<&T, &ErrorKind>
    {
        self.as_ref().map_err(|e| &e.kind)
    }
}

/// Returns the stable English phrase for an error code, as produced by the original library's
/// `irecv_strerror()`.
pub fn strerror(code: i32) -> &'static str
{
    match code {
        0 => "success",
        -1 => "no device found",
        -2 => "out of memory",
        -3 => "unable to connect to device",
        -4 => "invalid input",
        -5 => "file not found",
        -6 => "unable to upload data to device",
        -7 => "unable to get device status",
        -8 => "unable to set device interface",
        -9 => "unable to set device configuration",
        -10 => "pipe error",
        -11 => "transfer timed out",
        -12 => "operation not supported",
        -13 => "device returned invalid data",
        -254 => "unhandled external error",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn error_kind_codes_match_strerror()
    {
        assert_eq!(ErrorKind::NoDevice.code(), -1);
        assert_eq!(strerror(ErrorKind::NoDevice.code()), "no device found");
        assert_eq!(strerror(0), "success");
        assert_eq!(strerror(12345), "unknown error");
    }

    #[test]
    fn with_ctx_changes_display()
    {
        let err = ErrorKind::NoDevice.error().with_ctx("opening probe");
        assert_eq!(err.to_string(), "(while opening probe): no device found");
    }
}
