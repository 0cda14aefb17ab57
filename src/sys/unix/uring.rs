//! Event loop over a per-thread io_uring.
//!
//! One ring per thread keeps submissions single-issuer and makes fd-wide
//! cancellation reliable: `IORING_ASYNC_CANCEL_ALL` only matches operations
//! submitted on the same ring, and the runtime routes every operation for a
//! handle to the loop of its home thread.

use std::collections::HashMap;
use std::mem;

use io_uring::{opcode, squeue, types, IoUring};
use log::{trace, warn};

use crate::runtime::op::{CompletionResult, OpRef, Operation, Payload};
use crate::sys::SockAddr;

/// Resources that must stay alive while the kernel works on an operation,
/// handed back through the completion payload.
enum InFlight {
    Connect {
        _addr: Box<SockAddr>,
    },
    Accept {
        addr: Box<SockAddr>,
    },
    Send {
        data: Vec<u8>,
    },
    SendTo {
        _data: Vec<u8>,
        _msg: Box<Msghdr>,
    },
    Receive {
        buf: Vec<u8>,
    },
    ReceiveFrom {
        buf: Vec<u8>,
        msg: Box<Msghdr>,
    },
}

/// Owned msghdr with its iovec and address storage at stable addresses.
struct Msghdr {
    hdr: libc::msghdr,
    iov: libc::iovec,
    addr: SockAddr,
}

impl Msghdr {
    fn new(buf_ptr: *mut u8, buf_len: usize, addr: Option<SockAddr>) -> Box<Msghdr> {
        let mut msg = Box::new(Msghdr {
            hdr: unsafe { mem::zeroed() },
            iov: libc::iovec {
                iov_base: buf_ptr as *mut libc::c_void,
                iov_len: buf_len,
            },
            addr: addr.unwrap_or_else(SockAddr::zeroed),
        });
        msg.hdr.msg_name = msg.addr.as_mut_ptr() as *mut libc::c_void;
        msg.hdr.msg_namelen = msg.addr.len();
        msg.hdr.msg_iov = &mut msg.iov;
        msg.hdr.msg_iovlen = 1;
        msg
    }
}

pub(crate) struct EventLoop {
    ring: IoUring,
    /// Operations queued by `push`, drained each iteration.
    pending: Vec<Operation>,
    /// Keyed by SQE user data. Key 0 is reserved for fire-and-forget.
    in_flight: HashMap<u64, (OpRef, InFlight)>,
    next_key: u64,
    /// Completions being waited on (not events in the queue).
    outstanding: usize,
}

impl EventLoop {
    pub(crate) fn new(entries: u32) -> std::io::Result<EventLoop> {
        // Single-issuer is an optimization only; kernels before 6.0 reject
        // the flag.
        let ring = match IoUring::builder().setup_single_issuer().build(entries) {
            Ok(ring) => ring,
            Err(_) => IoUring::new(entries)?,
        };

        Ok(EventLoop {
            ring,
            pending: Vec::new(),
            in_flight: HashMap::new(),
            next_key: 1,
            outstanding: 0,
        })
    }

    pub(crate) fn push(&mut self, op: Operation) {
        self.pending.push(op);
    }

    pub(crate) fn size(&self) -> usize {
        // Queued-but-unsubmitted operations count too; a worker must not
        // park while its loop still has work to issue.
        self.outstanding + self.pending.len()
    }

    /// Runs one iteration: submit queued operations, wait bounded for a
    /// completion, resume what finished.
    pub(crate) fn run_once(&mut self, wait: bool) {
        let had_pending = !self.pending.is_empty();
        for op in mem::take(&mut self.pending) {
            self.prepare(op);
        }

        // Only wait when something can still complete; completions already
        // posted (including fire-and-forget ones) are reaped regardless.
        if had_pending || self.outstanding > 0 {
            let timeout = types::Timespec::new().nsec(if wait { 200_000_000 } else { 0 });
            let args = types::SubmitArgs::new().timespec(&timeout);
            match self.ring.submitter().submit_with_args(1, &args) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::ETIME) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => {
                    warn!("io_uring submit failed: {e}");
                    return;
                }
            }
        }

        // Reap whatever has completed; each entry resumes one task.
        let completions: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (key, res) in completions {
            self.complete(key, res);
        }
    }

    /// Translates one operation into an SQE and records its kept resources.
    fn prepare(&mut self, op: Operation) {
        let entry = match op {
            Operation::Connect { handle, addr, result } => {
                let addr = Box::new(addr);
                let entry = opcode::Connect::new(types::Fd(handle), addr.as_ptr(), addr.len())
                    .build();
                self.track(result, InFlight::Connect { _addr: addr }, entry)
            }
            Operation::Accept { handle, result } => {
                let mut addr = Box::new(SockAddr::zeroed());
                let entry =
                    opcode::Accept::new(types::Fd(handle), addr.as_mut_ptr(), addr.len_mut())
                        .build();
                self.track(result, InFlight::Accept { addr }, entry)
            }
            Operation::Send { handle, data, result } => {
                let entry =
                    opcode::Send::new(types::Fd(handle), data.as_ptr(), data.len() as u32)
                        .flags(libc::MSG_NOSIGNAL)
                        .build();
                self.track(result, InFlight::Send { data }, entry)
            }
            Operation::SendTo {
                handle,
                data,
                addr,
                result,
            } => {
                let mut data = data;
                let msg = Msghdr::new(data.as_mut_ptr(), data.len(), Some(addr));
                let entry = opcode::SendMsg::new(types::Fd(handle), &msg.hdr as *const libc::msghdr)
                    .flags(libc::MSG_NOSIGNAL as u32)
                    .build();
                self.track(result, InFlight::SendTo { _data: data, _msg: msg }, entry)
            }
            Operation::Receive {
                handle,
                capacity,
                result,
            } => {
                let mut buf = vec![0u8; capacity];
                let entry =
                    opcode::Recv::new(types::Fd(handle), buf.as_mut_ptr(), capacity as u32)
                        .build();
                self.track(result, InFlight::Receive { buf }, entry)
            }
            Operation::ReceiveFrom {
                handle,
                capacity,
                result,
            } => {
                let mut buf = vec![0u8; capacity];
                let mut msg = Msghdr::new(buf.as_mut_ptr(), capacity, None);
                let entry =
                    opcode::RecvMsg::new(types::Fd(handle), &mut msg.hdr as *mut libc::msghdr)
                        .build();
                self.track(result, InFlight::ReceiveFrom { buf, msg }, entry)
            }
            Operation::Shutdown { handle } => {
                opcode::Shutdown::new(types::Fd(handle), libc::SHUT_RDWR).build()
            }
            Operation::Close { handle } => opcode::Close::new(types::Fd(handle)).build(),
            Operation::Cancel { handle } => {
                trace!("canceling all operations on fd {handle}");
                opcode::AsyncCancel2::new(types::CancelBuilder::fd(types::Fd(handle)).all())
                    .build()
            }
        };

        self.push_sqe(entry);
    }

    /// Registers a keyed in-flight operation and stamps the SQE with it.
    fn track(&mut self, result: OpRef, kept: InFlight, entry: squeue::Entry) -> squeue::Entry {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        self.in_flight.insert(key, (result, kept));
        self.outstanding += 1;
        entry.user_data(key)
    }

    fn push_sqe(&mut self, entry: squeue::Entry) {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Queue full; flush and retry once.
                let _ = self.ring.submitter().submit();
                self.ring.submission().sync();
                if self.ring.submission().push(&entry).is_err() {
                    warn!("io_uring submission queue overflow, dropping entry");
                }
            }
        }
    }

    /// Decodes one CQE and resumes the task that owns it.
    fn complete(&mut self, key: u64, res: i32) {
        if key == 0 {
            // Fire-and-forget (shutdown/close/cancel).
            return;
        }
        let Some((completion, kept)) = self.in_flight.remove(&key) else {
            return;
        };
        self.outstanding -= 1;

        // Negative CQE results are -errno.
        if res < 0 {
            completion.complete(CompletionResult::err(-res));
            return;
        }

        let payload = match kept {
            InFlight::Connect { .. } => Payload::None,
            InFlight::Accept { addr } => Payload::Accepted {
                socket: res,
                addr: *addr,
            },
            InFlight::Send { data } => Payload::Buffer(data),
            InFlight::SendTo { .. } => Payload::None,
            InFlight::Receive { mut buf } => {
                buf.truncate(res as usize);
                Payload::Buffer(buf)
            }
            InFlight::ReceiveFrom { mut buf, msg } => {
                buf.truncate(res as usize);
                let mut from = msg.addr.clone();
                from.set_len(msg.hdr.msg_namelen);
                Payload::Datagram { data: buf, from }
            }
        };

        completion.complete(CompletionResult::ok(res, payload));
    }
}
