//! Move-only ownership of platform socket handles.

use std::fmt;
use std::sync::Arc;

use crate::runtime::{self, Operation};
use crate::sys;

/// Compile-time tag selecting the platform handle flavor of a socket.
///
/// IP sockets are descriptors everywhere; Bluetooth sockets are descriptors
/// on Windows and Linux but IOBluetooth channel objects on macOS.
pub(crate) trait SocketTag: Send + Sized + 'static {
    type Raw: Clone + PartialEq + Send + Sync + fmt::Debug;

    const INVALID: Self::Raw;

    /// Shuts down and closes the raw handle (both fire-and-forget).
    fn close(raw: &Self::Raw, home: Option<usize>);

    /// Requests abort of all I/O outstanding on the raw handle.
    fn cancel(raw: &Self::Raw, home: Option<usize>);
}

/// Tag for Internet (TCP/UDP) sockets.
pub(crate) enum Ip {}

/// Tag for Bluetooth (RFCOMM/L2CAP) sockets.
pub(crate) enum Bt {}

impl SocketTag for Ip {
    type Raw = sys::RawSocket;

    const INVALID: sys::RawSocket = sys::INVALID_SOCKET;

    fn close(raw: &Self::Raw, home: Option<usize>) {
        runtime::submit_detached(home, Operation::Shutdown { handle: *raw });
        runtime::submit_detached(home, Operation::Close { handle: *raw });
    }

    fn cancel(raw: &Self::Raw, home: Option<usize>) {
        runtime::submit_detached(home, Operation::Cancel { handle: *raw });
    }
}

#[cfg(not(target_os = "macos"))]
impl SocketTag for Bt {
    type Raw = sys::RawSocket;

    const INVALID: sys::RawSocket = sys::INVALID_SOCKET;

    fn close(raw: &Self::Raw, home: Option<usize>) {
        <Ip as SocketTag>::close(raw, home);
    }

    fn cancel(raw: &Self::Raw, home: Option<usize>) {
        <Ip as SocketTag>::cancel(raw, home);
    }
}

#[cfg(target_os = "macos")]
impl SocketTag for Bt {
    type Raw = Option<sys::bt::Channel>;

    const INVALID: Self::Raw = None;

    fn close(raw: &Self::Raw, _home: Option<usize>) {
        if let Some(channel) = raw {
            channel.close();
        }
    }

    fn cancel(raw: &Self::Raw, _home: Option<usize>) {
        if let Some(channel) = raw {
            channel.abort_pending();
        }
    }
}

/// Move-only owner of an OS socket.
///
/// At most one handle owns a given OS resource; closing is idempotent and
/// the destructor closes if the handle was not already closed or released.
pub(crate) struct SocketHandle<T: SocketTag> {
    raw: T::Raw,
    /// Ordinal of the thread whose event loop owns this handle's I/O.
    home: Option<usize>,
    closed: bool,
}

impl<T: SocketTag> SocketHandle<T> {
    pub(crate) fn invalid() -> SocketHandle<T> {
        SocketHandle {
            raw: T::INVALID,
            home: None,
            closed: false,
        }
    }

    /// Takes ownership of a raw handle, pinning its I/O to the calling
    /// thread's event loop.
    pub(crate) fn from_raw(raw: T::Raw) -> SocketHandle<T> {
        SocketHandle {
            raw,
            home: Some(runtime::current_ordinal()),
            closed: false,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.raw != T::INVALID
    }

    /// Closes the handle. The first call on a valid handle submits the
    /// shutdown and close; subsequent calls are no-ops.
    pub(crate) fn close(&mut self) {
        if !self.closed && self.is_valid() {
            T::close(&self.raw, self.home);
            self.closed = true;
        }
    }

    /// Requests abort of every operation outstanding on the handle.
    pub(crate) fn cancel_io(&self) {
        if self.is_valid() && !self.closed {
            T::cancel(&self.raw, self.home);
        }
    }

    /// Closes the current handle and acquires a new one.
    pub(crate) fn reset(&mut self, raw: T::Raw) {
        self.close();
        self.raw = raw;
        self.home = Some(runtime::current_ordinal());
        self.closed = false;
    }

    /// Releases ownership of the managed handle, leaving this one invalid.
    #[allow(dead_code)]
    pub(crate) fn release(&mut self) -> T::Raw {
        std::mem::replace(&mut self.raw, T::INVALID)
    }

    pub(crate) fn raw(&self) -> T::Raw {
        self.raw.clone()
    }

    /// The event loop ordinal operations on this handle must target.
    pub(crate) fn home(&self) -> usize {
        match self.home {
            Some(home) => home,
            None => runtime::current_ordinal(),
        }
    }

    /// A detached handle that can cancel this socket's I/O from any thread.
    pub(crate) fn cancel_handle(&self) -> CancelHandle {
        let raw = self.raw.clone();
        let home = self.home;
        CancelHandle(Arc::new(move || T::cancel(&raw, home)))
    }
}

impl<T: SocketTag> Drop for SocketHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: SocketTag> fmt::Debug for SocketHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("raw", &self.raw)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Cancels a socket's pending I/O without borrowing the socket.
///
/// Cheap to clone and safe to invoke from any thread; the request is routed
/// to the event loop that owns the socket's in-flight operations.
#[derive(Clone)]
pub struct CancelHandle(Arc<dyn Fn() + Send + Sync>);

impl CancelHandle {
    /// Requests abort of every operation outstanding on the socket.
    pub fn cancel(&self) {
        (self.0)()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn dup_of_devnull() -> sys::RawSocket {
        let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) };
        assert!(fd >= 0);
        fd
    }

    fn fd_is_open(fd: sys::RawSocket) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    fn drain_close_queue() {
        // Close submits through the event loop; give it a few iterations.
        for _ in 0..10 {
            crate::runtime::handle_events(false);
        }
    }

    #[test]
    fn close_is_idempotent() {
        let fd = dup_of_devnull();
        let mut handle = SocketHandle::<Ip>::from_raw(fd);
        handle.close();
        handle.close();
        drain_close_queue();
        assert!(!fd_is_open(fd));
    }

    #[test]
    fn release_prevents_close_on_drop() {
        let fd = dup_of_devnull();
        let mut handle = SocketHandle::<Ip>::from_raw(fd);
        let released = handle.release();
        assert_eq!(released, fd);
        assert!(!handle.is_valid());
        drop(handle);
        drain_close_queue();
        assert!(fd_is_open(fd));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn invalid_handle_never_closes() {
        let mut handle = SocketHandle::<Ip>::invalid();
        assert!(!handle.is_valid());
        handle.close();
        handle.cancel_io();
    }
}
