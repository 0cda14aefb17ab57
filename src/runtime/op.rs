//! Operation descriptors and their completion plumbing.
//!
//! An [`Operation`] is a value object describing one I/O request. Delegates
//! create one, hand it to the event loop owning the target handle, and
//! suspend on the paired [`Completion`]. The event loop keeps the
//! operation's buffers alive while the OS works on it and hands them back
//! through the [`Payload`] when it delivers the single completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{is_fatal, ErrorCode, ErrorKind, SystemError};
use crate::sys;

/// Operation-specific data returned alongside the completion.
#[derive(Debug)]
pub(crate) enum Payload {
    None,
    /// The buffer an operation borrowed from the caller (received data for
    /// reads, the unconsumed buffer for sends).
    Buffer(Vec<u8>),
    /// A received datagram and its source address.
    Datagram { data: Vec<u8>, from: sys::SockAddr },
    /// An accepted connection and the peer's address.
    Accepted {
        socket: sys::RawSocket,
        addr: sys::SockAddr,
    },
}

/// The outcome of one asynchronous operation.
#[derive(Debug)]
pub(crate) struct CompletionResult {
    /// Result of the operation; exact meaning depends on the operation
    /// (bytes transferred, or a new descriptor for accepts).
    pub res: i32,
    /// The platform error code, zero when the operation succeeded.
    pub error: ErrorCode,
    /// Resources handed back by the event loop.
    pub payload: Payload,
}

impl CompletionResult {
    pub(crate) fn ok(res: i32, payload: Payload) -> CompletionResult {
        CompletionResult {
            res,
            error: 0,
            payload,
        }
    }

    pub(crate) fn err(error: ErrorCode) -> CompletionResult {
        CompletionResult {
            res: 0,
            error,
            payload: Payload::None,
        }
    }

    /// Surfaces a fatal error code under the given taxonomy kind.
    pub(crate) fn check(self, kind: ErrorKind) -> Result<CompletionResult, SystemError> {
        if is_fatal(self.error) {
            Err(SystemError::new(self.error, kind))
        } else {
            Ok(self)
        }
    }
}

enum Lifecycle {
    /// Submitted (or about to be); holds the waker of the suspended task.
    Waiting(Option<Waker>),
    /// The event loop delivered the result; nobody consumed it yet.
    Done(CompletionResult),
    /// The result was consumed.
    Taken,
}

/// The resumption token tied to one in-flight operation.
///
/// Exactly one completion delivery happens per submission; delivering wakes
/// the suspended task on the thread that owns it.
pub(crate) struct Completion {
    state: Mutex<Lifecycle>,
}

pub(crate) type OpRef = Arc<Completion>;

impl Completion {
    pub(crate) fn new() -> OpRef {
        Arc::new(Completion {
            state: Mutex::new(Lifecycle::Waiting(None)),
        })
    }

    /// Stores the result and wakes the suspended task, if any.
    pub(crate) fn complete(&self, result: CompletionResult) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, Lifecycle::Done(result)) {
                Lifecycle::Waiting(waker) => waker,
                // A second delivery would be an event loop bug.
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<CompletionResult> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            Lifecycle::Waiting(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Lifecycle::Done(_) => match std::mem::replace(&mut *state, Lifecycle::Taken) {
                Lifecycle::Done(result) => Poll::Ready(result),
                _ => unreachable!(),
            },
            Lifecycle::Taken => unreachable!("completion polled after it was consumed"),
        }
    }
}

/// An asynchronous operation descriptor.
///
/// Variants carrying no [`OpRef`] are fire-and-forget: the event loop
/// submits them and discards the outcome.
pub(crate) enum Operation {
    Connect {
        handle: sys::RawSocket,
        addr: sys::SockAddr,
        result: OpRef,
    },
    Accept {
        handle: sys::RawSocket,
        result: OpRef,
    },
    Send {
        handle: sys::RawSocket,
        data: Vec<u8>,
        result: OpRef,
    },
    SendTo {
        handle: sys::RawSocket,
        data: Vec<u8>,
        addr: sys::SockAddr,
        result: OpRef,
    },
    Receive {
        handle: sys::RawSocket,
        capacity: usize,
        result: OpRef,
    },
    ReceiveFrom {
        handle: sys::RawSocket,
        capacity: usize,
        result: OpRef,
    },
    Shutdown {
        handle: sys::RawSocket,
    },
    Close {
        handle: sys::RawSocket,
    },
    Cancel {
        handle: sys::RawSocket,
    },
}

impl Operation {
    /// The completion cell this operation reports to, when it has one.
    pub(crate) fn completion(&self) -> Option<&OpRef> {
        match self {
            Operation::Connect { result, .. }
            | Operation::Accept { result, .. }
            | Operation::Send { result, .. }
            | Operation::SendTo { result, .. }
            | Operation::Receive { result, .. }
            | Operation::ReceiveFrom { result, .. } => Some(result),
            Operation::Shutdown { .. } | Operation::Close { .. } | Operation::Cancel { .. } => None,
        }
    }
}

/// Future that submits one operation on first poll and resolves with its
/// completion. `home` is the ordinal of the thread whose event loop owns
/// the handle's in-flight I/O.
pub(crate) struct Submit {
    op: Option<Operation>,
    completion: OpRef,
    home: usize,
}

impl Submit {
    pub(crate) fn new(op: Operation, home: usize) -> Submit {
        let completion = op
            .completion()
            .expect("fire-and-forget operations are not awaitable")
            .clone();
        Submit {
            op: Some(op),
            completion,
            home,
        }
    }

    /// Waits on a completion that an external source (IOBluetooth
    /// callbacks) will fill in; nothing is submitted to an event loop.
    #[cfg(target_os = "macos")]
    pub(crate) fn new_noop(completion: OpRef, home: usize) -> Submit {
        Submit {
            op: None,
            completion,
            home,
        }
    }
}

impl Future for Submit {
    type Output = CompletionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Install the waker before the operation goes out, so a completion
        // racing in from another thread always finds it.
        let polled = self.completion.poll_result(cx);
        if let Some(op) = self.op.take() {
            super::submit_to(self.home, op);
        }
        polled
    }
}

/// Awaits one operation, surfacing fatal errors as system errors.
pub(crate) async fn run(op: Operation, home: usize) -> Result<CompletionResult, SystemError> {
    Submit::new(op, home).await.check(ErrorKind::System)
}
