//! Error taxonomy for the networking core.
//!
//! Every fallible operation surfaces one of two error flavors: a
//! [`SystemError`] carrying a raw platform code tagged with where the code
//! came from, or a [`TlsError`] carrying the TLS state machine's
//! description. Cancellation is not a separate type; it is a `SystemError`
//! whose code compares equal to the platform's "operation aborted" code and
//! is recognized by [`SystemError::is_canceled`].

#[cfg(unix)]
use std::ffi::CStr;
use std::fmt;

use thiserror::Error;

/// Raw platform error code.
#[cfg(windows)]
pub type ErrorCode = u32;
/// Raw platform error code.
#[cfg(unix)]
pub type ErrorCode = i32;

/// Where a [`SystemError`] code came from. The same numeric value means
/// different things in different code spaces, so the kind travels with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Socket functions and other OS APIs.
    System,
    /// `getaddrinfo`/`getnameinfo` return codes.
    AddrInfo,
    /// macOS IOKit/IOBluetooth return codes.
    IoReturn,
}

/// An error code returned by a platform API.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SystemError {
    /// The platform-specific error code.
    pub code: ErrorCode,
    /// The code space the error belongs to.
    pub kind: ErrorKind,
}

impl std::error::Error for SystemError {}

impl SystemError {
    pub(crate) fn new(code: ErrorCode, kind: ErrorKind) -> SystemError {
        SystemError { code, kind }
    }

    /// The calling thread's last OS error, under the `System` kind.
    pub(crate) fn last_os() -> SystemError {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        SystemError::new(code as ErrorCode, ErrorKind::System)
    }

    /// Whether this error represents a canceled operation.
    ///
    /// Recognizes every platform's abort code so callers can distinguish
    /// cancellation from genuine failures with one predicate.
    pub fn is_canceled(&self) -> bool {
        #[cfg(windows)]
        {
            self.kind == ErrorKind::System
                && self.code == windows_sys::Win32::Foundation::ERROR_OPERATION_ABORTED
        }
        #[cfg(unix)]
        {
            if self.kind == ErrorKind::System && self.code == libc::ECANCELED {
                return true;
            }
            #[cfg(target_os = "macos")]
            if self.kind == ErrorKind::IoReturn && self.code == crate::sys::KIO_RETURN_ABORTED {
                return true;
            }
            false
        }
    }

    /// Whether this error should be handled as fatal. See [`is_fatal`].
    pub fn is_fatal(&self) -> bool {
        is_fatal(self.code)
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::System => "System",
            ErrorKind::AddrInfo => "getaddrinfo",
            ErrorKind::IoReturn => "IOReturn",
        };
        write!(f, "{} (type {}): {}", self.code, kind, describe(self.code, self.kind))
    }
}

impl fmt::Debug for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Checks if an error code should be handled as a fatal error.
///
/// Platform-specific "pending" codes indicate an async operation has not yet
/// finished, not a failure.
pub fn is_fatal(code: ErrorCode) -> bool {
    if code == 0 {
        return false;
    }

    #[cfg(windows)]
    if code == windows_sys::Win32::Networking::WinSock::WSA_IO_PENDING as u32 {
        return false;
    }

    #[cfg(unix)]
    if code == libc::EINPROGRESS {
        return false;
    }

    true
}

/// Renders the platform's message text for a code.
fn describe(code: ErrorCode, kind: ErrorKind) -> String {
    match kind {
        ErrorKind::System => std::io::Error::from_raw_os_error(code as i32).to_string(),
        ErrorKind::AddrInfo => gai_message(code),
        ErrorKind::IoReturn => format!("kernel return {code:#x}"),
    }
}

#[cfg(unix)]
fn gai_message(code: ErrorCode) -> String {
    // gai_strerror returns a pointer to a static string.
    unsafe {
        let msg = libc::gai_strerror(code);
        if msg.is_null() {
            format!("resolver error {code}")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

#[cfg(windows)]
fn gai_message(code: ErrorCode) -> String {
    // gai_strerror is not thread safe on Windows; the WSA codes share the
    // system message table.
    std::io::Error::from_raw_os_error(code as i32).to_string()
}

/// A failure reported by the TLS state machine, carrying its description.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct TlsError(pub String);

/// Any error surfaced by the core.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl Error {
    /// Whether this is a canceled system operation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::System(e) => e.is_canceled(),
            Error::Tls(_) => false,
        }
    }

    /// The system error inside, if this is one.
    pub fn as_system(&self) -> Option<&SystemError> {
        match self {
            Error::System(e) => Some(e),
            Error::Tls(_) => None,
        }
    }
}

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_fatal() {
        assert!(!is_fatal(0));
    }

    #[cfg(unix)]
    #[test]
    fn pending_codes_are_not_fatal() {
        assert!(!is_fatal(libc::EINPROGRESS));
        assert!(is_fatal(libc::ECONNREFUSED));
    }

    #[cfg(unix)]
    #[test]
    fn canceled_is_recognized_and_fatal() {
        let err = SystemError::new(libc::ECANCELED, ErrorKind::System);
        assert!(err.is_canceled());
        assert!(err.is_fatal());

        // The same number in the resolver code space is not a cancellation.
        let gai = SystemError::new(libc::ECANCELED, ErrorKind::AddrInfo);
        assert!(!gai.is_canceled());
    }

    #[test]
    fn tls_error_carries_description() {
        let err = Error::from(TlsError(
            "Certificate validation failure: Cannot establish trust".into(),
        ));
        assert!(!err.is_canceled());
        assert_eq!(
            err.to_string(),
            "Certificate validation failure: Cannot establish trust"
        );
    }
}
