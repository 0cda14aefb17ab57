//! Event loop over a per-thread kqueue (macOS).
//!
//! kqueue is readiness-based: operations register a one-shot filter on
//! their descriptor and the actual socket call runs when the kernel reports
//! the descriptor ready, using the buffer the operation owns. A kevent is
//! identified by the `(ident, filter)` pair, so one fd may have at most a
//! read and a write operation pending; the pair is folded into a single
//! 64-bit map key with the filter in bit 33.

use std::collections::HashMap;
use std::mem;
use std::time::Duration;

use log::warn;

use crate::runtime::op::{CompletionResult, OpRef, Operation, Payload};
use crate::sys::{RawSocket, SockAddr};

use super::syscall;

const FILTER_WRITE_BIT: u64 = 1 << 33;

fn map_id(fd: RawSocket, filter: i16) -> u64 {
    let filter_bit = if filter == libc::EVFILT_WRITE {
        FILTER_WRITE_BIT
    } else {
        0
    };
    fd as u64 | filter_bit
}

/// What to do once the descriptor is ready.
enum Ready {
    Connect,
    Accept,
    Send { data: Vec<u8> },
    SendTo { data: Vec<u8>, addr: SockAddr },
    Receive { capacity: usize },
    ReceiveFrom { capacity: usize },
}

impl Ready {
    fn filter(&self) -> i16 {
        match self {
            Ready::Connect | Ready::Send { .. } | Ready::SendTo { .. } => libc::EVFILT_WRITE,
            Ready::Accept | Ready::Receive { .. } | Ready::ReceiveFrom { .. } => libc::EVFILT_READ,
        }
    }
}

pub(crate) struct EventLoop {
    kq: RawSocket,
    pending: Vec<Operation>,
    events: HashMap<u64, (OpRef, Ready)>,
    outstanding: usize,
}

impl EventLoop {
    pub(crate) fn new(_entries: u32) -> std::io::Result<EventLoop> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))
            .map_err(|e| std::io::Error::from_raw_os_error(e.code))?;
        Ok(EventLoop {
            kq,
            pending: Vec::new(),
            events: HashMap::new(),
            outstanding: 0,
        })
    }

    pub(crate) fn push(&mut self, op: Operation) {
        self.pending.push(op);
    }

    pub(crate) fn size(&self) -> usize {
        self.outstanding + self.pending.len()
    }

    pub(crate) fn run_once(&mut self, wait: bool) {
        if !self.pending.is_empty() {
            let mut changes = Vec::new();
            for op in mem::take(&mut self.pending) {
                self.handle_operation(op, &mut changes);
            }
            self.apply_changes(&changes);
        } else if self.outstanding == 0 {
            return;
        }

        let timeout = if wait {
            Duration::from_millis(200)
        } else {
            Duration::ZERO
        };
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
        };

        // Wait for one event from kqueue.
        let mut event: libc::kevent = unsafe { mem::zeroed() };
        let n = unsafe { libc::kevent(self.kq, std::ptr::null(), 0, &mut event, 1, &timeout) };
        if n <= 0 {
            return;
        }

        let key = map_id(event.ident as RawSocket, event.filter);
        let Some((completion, ready)) = self.events.remove(&key) else {
            return;
        };
        self.outstanding -= 1;
        let result = perform(event.ident as RawSocket, ready);
        completion.complete(result);
    }

    /// Registers one-shot filters and performs inline operations.
    fn handle_operation(&mut self, op: Operation, changes: &mut Vec<libc::kevent>) {
        let (handle, ready, result) = match op {
            Operation::Connect { handle, addr, result } => {
                // Non-blocking connect; completion is writability.
                let rc = unsafe { libc::connect(handle, addr.as_ptr(), addr.len()) };
                if rc == -1 {
                    let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    if err != libc::EINPROGRESS {
                        result.complete(CompletionResult::err(err));
                        return;
                    }
                } else {
                    result.complete(CompletionResult::ok(0, Payload::None));
                    return;
                }
                (handle, Ready::Connect, result)
            }
            Operation::Accept { handle, result } => (handle, Ready::Accept, result),
            Operation::Send { handle, data, result } => (handle, Ready::Send { data }, result),
            Operation::SendTo {
                handle,
                data,
                addr,
                result,
            } => (handle, Ready::SendTo { data, addr }, result),
            Operation::Receive {
                handle,
                capacity,
                result,
            } => (handle, Ready::Receive { capacity }, result),
            Operation::ReceiveFrom {
                handle,
                capacity,
                result,
            } => (handle, Ready::ReceiveFrom { capacity }, result),
            Operation::Shutdown { handle } => {
                // Direct syscall on this platform.
                let _ = syscall!(shutdown(handle, libc::SHUT_RDWR));
                return;
            }
            Operation::Close { handle } => {
                let _ = syscall!(close(handle));
                return;
            }
            Operation::Cancel { handle } => {
                self.cancel(handle, changes);
                return;
            }
        };

        let filter = ready.filter();
        changes.push(libc::kevent {
            ident: handle as libc::uintptr_t,
            filter,
            flags: libc::EV_ADD | libc::EV_ONESHOT | libc::EV_RECEIPT,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        });
        self.events.insert(map_id(handle, filter), (result, ready));
        self.outstanding += 1;
    }

    /// Applies a changelist; EV_RECEIPT reports per-change errors which are
    /// returned to the waiting operations immediately.
    fn apply_changes(&mut self, changes: &[libc::kevent]) {
        if changes.is_empty() {
            return;
        }
        let mut receipts = vec![unsafe { mem::zeroed::<libc::kevent>() }; changes.len()];
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                receipts.as_mut_ptr(),
                receipts.len() as libc::c_int,
                &timeout,
            )
        };
        if n <= 0 {
            return;
        }

        for receipt in &receipts[..n as usize] {
            if receipt.flags & libc::EV_ERROR == 0 || receipt.data == 0 {
                continue;
            }
            let key = map_id(receipt.ident as RawSocket, receipt.filter);
            if let Some((completion, _)) = self.events.remove(&key) {
                self.outstanding -= 1;
                completion.complete(CompletionResult::err(receipt.data as i32));
            }
        }
    }

    /// Cancels both possible filters for a descriptor; each pending
    /// operation resumes with `ECANCELED`.
    fn cancel(&mut self, handle: RawSocket, changes: &mut Vec<libc::kevent>) {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let key = map_id(handle, filter);
            let Some((completion, _)) = self.events.remove(&key) else {
                continue;
            };
            changes.push(libc::kevent {
                ident: handle as libc::uintptr_t,
                filter,
                flags: libc::EV_DELETE,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            });
            self.outstanding -= 1;
            completion.complete(CompletionResult::err(libc::ECANCELED));
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(e) = syscall!(close(self.kq)) {
            warn!("failed to close kqueue: {e}");
        }
    }
}

/// Executes the socket call for a descriptor the kernel reported ready.
fn perform(fd: RawSocket, ready: Ready) -> CompletionResult {
    match ready {
        Ready::Connect => {
            // The connect outcome is carried by SO_ERROR once writable.
            match super::net::getsockopt::<libc::c_int>(fd, libc::SOL_SOCKET, libc::SO_ERROR) {
                Ok(0) => CompletionResult::ok(0, Payload::None),
                Ok(err) => CompletionResult::err(err),
                Err(e) => CompletionResult::err(e.code),
            }
        }
        Ready::Accept => {
            let mut addr = SockAddr::zeroed();
            match syscall!(accept(fd, addr.as_mut_ptr(), addr.len_mut())) {
                Ok(client) => {
                    if let Err(e) = super::net::prepare_socket(client) {
                        return CompletionResult::err(e.code);
                    }
                    CompletionResult::ok(client, Payload::Accepted {
                        socket: client,
                        addr,
                    })
                }
                Err(e) => CompletionResult::err(e.code),
            }
        }
        Ready::Send { data } => {
            match syscall!(send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0
            )) {
                Ok(sent) => CompletionResult::ok(sent as i32, Payload::Buffer(data)),
                Err(e) => CompletionResult::err(e.code),
            }
        }
        Ready::SendTo { data, addr } => {
            match syscall!(sendto(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                addr.as_ptr(),
                addr.len()
            )) {
                Ok(sent) => CompletionResult::ok(sent as i32, Payload::None),
                Err(e) => CompletionResult::err(e.code),
            }
        }
        Ready::Receive { capacity } => {
            let mut buf = vec![0u8; capacity];
            match syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, capacity, 0)) {
                Ok(received) => {
                    buf.truncate(received as usize);
                    CompletionResult::ok(received as i32, Payload::Buffer(buf))
                }
                Err(e) => CompletionResult::err(e.code),
            }
        }
        Ready::ReceiveFrom { capacity } => {
            let mut buf = vec![0u8; capacity];
            let mut from = SockAddr::zeroed();
            match syscall!(recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                capacity,
                0,
                from.as_mut_ptr(),
                from.len_mut()
            )) {
                Ok(received) => {
                    buf.truncate(received as usize);
                    CompletionResult::ok(received as i32, Payload::Datagram { data: buf, from })
                }
                Err(e) => CompletionResult::err(e.code),
            }
        }
    }
}
