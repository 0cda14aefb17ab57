//! Event loop over the shared I/O completion port.
//!
//! One port serves every thread; a completion may surface on any of them.
//! The completion cell is embedded behind an `OVERLAPPED` header at field
//! offset zero, so the pointer that comes back from
//! `GetQueuedCompletionStatus` is the operation's identity. Resuming goes
//! through the task's waker, which routes it onto the run queue of the
//! thread that owns it, so thread affinity survives foreign-thread
//! completions.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::warn;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::error::{ErrorKind, SystemError};
use crate::runtime::op::{CompletionResult, OpRef, Operation, Payload};
use crate::sys::{RawSocket, SockAddr};

/// Address buffer slot size for `AcceptEx` (local + remote each need a
/// sockaddr plus 16 bytes).
const ACCEPT_ADDR_SIZE: u32 = (mem::size_of::<ws::SOCKADDR_STORAGE>() + 16) as u32;

type ConnectExFn = unsafe extern "system" fn(
    ws::SOCKET,
    *const ws::SOCKADDR,
    i32,
    *const core::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

type AcceptExFn = unsafe extern "system" fn(
    ws::SOCKET,
    ws::SOCKET,
    *mut core::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

type GetAcceptExSockaddrsFn = unsafe extern "system" fn(
    *mut core::ffi::c_void,
    u32,
    u32,
    u32,
    *mut *mut ws::SOCKADDR,
    *mut i32,
    *mut *mut ws::SOCKADDR,
    *mut i32,
);

struct Globals {
    port: HANDLE,
    connect_ex: ConnectExFn,
    accept_ex: AcceptExFn,
    get_acceptex_sockaddrs: GetAcceptExSockaddrsFn,
    /// Completions being waited on across all threads (one port serves
    /// them all).
    outstanding: AtomicUsize,
}

unsafe impl Send for Globals {}
unsafe impl Sync for Globals {}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

unsafe fn load_extension<T: Copy>(socket: ws::SOCKET, guid: windows_sys::core::GUID) -> T {
    let mut func = mem::MaybeUninit::<T>::uninit();
    let mut bytes = 0u32;
    let rc = ws::WSAIoctl(
        socket,
        ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
        &guid as *const _ as *const core::ffi::c_void,
        mem::size_of_val(&guid) as u32,
        func.as_mut_ptr() as *mut core::ffi::c_void,
        mem::size_of::<T>() as u32,
        &mut bytes,
        std::ptr::null_mut(),
        None,
    );
    assert!(rc == 0, "failed to load Winsock extension function");
    func.assume_init()
}

fn globals() -> &'static Globals {
    GLOBALS.get_or_init(|| unsafe {
        crate::sys::startup();

        let port = CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0);
        assert!(!port.is_null(), "CreateIoCompletionPort failed");

        // Extension function pointers are loaded through a throwaway
        // socket.
        let probe = ws::socket(ws::AF_INET as i32, ws::SOCK_STREAM, 0);
        assert!(probe != ws::INVALID_SOCKET);
        let g = Globals {
            port,
            connect_ex: load_extension(probe, ws::WSAID_CONNECTEX),
            accept_ex: load_extension(probe, ws::WSAID_ACCEPTEX),
            get_acceptex_sockaddrs: load_extension(probe, ws::WSAID_GETACCEPTEXSOCKADDRS),
            outstanding: AtomicUsize::new(0),
        };
        ws::closesocket(probe);
        g
    })
}

/// Associates a socket with the shared completion port.
pub(crate) fn register(socket: RawSocket) -> Result<(), SystemError> {
    let g = globals();
    let assoc = unsafe { CreateIoCompletionPort(socket as HANDLE, g.port, 0, 0) };
    if assoc.is_null() {
        return Err(SystemError::new(
            unsafe { GetLastError() },
            ErrorKind::System,
        ));
    }
    Ok(())
}

/// Resources that must stay alive while the OS works on an operation.
enum InFlight {
    Connect {
        _addr: Box<SockAddr>,
    },
    Accept {
        client: RawSocket,
        listener: RawSocket,
        buf: Vec<u8>,
    },
    Send {
        data: Vec<u8>,
        _wsabuf: Box<ws::WSABUF>,
    },
    SendTo {
        _data: Vec<u8>,
        _wsabuf: Box<ws::WSABUF>,
        _addr: Box<SockAddr>,
    },
    Receive {
        buf: Vec<u8>,
        _wsabuf: Box<ws::WSABUF>,
    },
    ReceiveFrom {
        buf: Vec<u8>,
        _wsabuf: Box<ws::WSABUF>,
        from: Box<SockAddr>,
        from_len: Box<i32>,
    },
}

/// One in-flight operation. The `OVERLAPPED` header must stay the first
/// field: the kernel only requires field-offset-zero layout, and the
/// pointer doubles as the completion identity.
#[repr(C)]
struct OverlappedEntry {
    overlapped: OVERLAPPED,
    completion: OpRef,
    kept: InFlight,
}

impl OverlappedEntry {
    /// Boxes the entry and registers it as outstanding. The raw pointer
    /// travels through the completion port and is reconstructed in
    /// `run_once`.
    fn submit(completion: OpRef, kept: InFlight) -> *mut OVERLAPPED {
        globals().outstanding.fetch_add(1, Ordering::Relaxed);
        let entry = Box::new(OverlappedEntry {
            overlapped: unsafe { mem::zeroed() },
            completion,
            kept,
        });
        Box::into_raw(entry) as *mut OVERLAPPED
    }

    /// Reclaims an entry delivered by the port.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`OverlappedEntry::submit`].
    unsafe fn reclaim(ptr: *mut OVERLAPPED) -> Box<OverlappedEntry> {
        globals().outstanding.fetch_sub(1, Ordering::Relaxed);
        Box::from_raw(ptr as *mut OverlappedEntry)
    }
}

pub(crate) struct EventLoop {
    pending: Vec<Operation>,
}

impl EventLoop {
    pub(crate) fn new(_entries: u32) -> std::io::Result<EventLoop> {
        let _ = globals();
        Ok(EventLoop {
            pending: Vec::new(),
        })
    }

    pub(crate) fn push(&mut self, op: Operation) {
        self.pending.push(op);
    }

    pub(crate) fn size(&self) -> usize {
        globals().outstanding.load(Ordering::Relaxed) + self.pending.len()
    }

    pub(crate) fn run_once(&mut self, wait: bool) {
        for op in mem::take(&mut self.pending) {
            submit_operation(op);
        }

        let g = globals();
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

        // Shorter timeout than on other platforms: threads also handle
        // work that does not come from the port.
        let timeout = if wait { 10 } else { 0 };
        let ok = unsafe {
            GetQueuedCompletionStatus(g.port, &mut bytes, &mut key, &mut overlapped, timeout)
        };

        if overlapped.is_null() {
            return;
        }

        let entry = unsafe { OverlappedEntry::reclaim(overlapped) };
        let error = if ok == 0 { unsafe { GetLastError() } } else { 0 };
        complete(*entry, bytes, error);
    }
}

/// Decodes a dequeued entry into its completion result.
fn complete(entry: OverlappedEntry, bytes: u32, error: u32) {
    let OverlappedEntry {
        completion, kept, ..
    } = entry;

    if error != 0 {
        if let InFlight::Accept { client, .. } = kept {
            super::net::close_raw(client);
        }
        completion.complete(CompletionResult::err(error));
        return;
    }

    let res = bytes as i32;
    let payload = match kept {
        InFlight::Connect { .. } => Payload::None,
        InFlight::Accept {
            client,
            listener,
            mut buf,
        } => match finish_accept(client, listener, &mut buf) {
            Ok(addr) => Payload::Accepted {
                socket: client,
                addr,
            },
            Err(e) => {
                super::net::close_raw(client);
                completion.complete(CompletionResult::err(e.code));
                return;
            }
        },
        InFlight::Send { data, .. } => Payload::Buffer(data),
        InFlight::SendTo { .. } => Payload::None,
        InFlight::Receive { mut buf, .. } => {
            buf.truncate(res.max(0) as usize);
            Payload::Buffer(buf)
        }
        InFlight::ReceiveFrom {
            mut buf,
            from,
            from_len,
            ..
        } => {
            buf.truncate(res.max(0) as usize);
            let mut from = *from;
            from.set_len(*from_len);
            Payload::Datagram { data: buf, from }
        }
    };

    completion.complete(CompletionResult::ok(res, payload));
}

/// `SO_UPDATE_ACCEPT_CONTEXT` plus the peer address out of the AcceptEx
/// buffer.
fn finish_accept(
    client: RawSocket,
    listener: RawSocket,
    buf: &mut [u8],
) -> Result<SockAddr, SystemError> {
    super::net::setsockopt(
        client,
        ws::SOL_SOCKET as i32,
        ws::SO_UPDATE_ACCEPT_CONTEXT as i32,
        listener,
    )?;
    register(client)?;

    let g = globals();
    let mut local: *mut ws::SOCKADDR = std::ptr::null_mut();
    let mut local_len = 0i32;
    let mut remote: *mut ws::SOCKADDR = std::ptr::null_mut();
    let mut remote_len = 0i32;
    unsafe {
        (g.get_acceptex_sockaddrs)(
            buf.as_mut_ptr() as *mut core::ffi::c_void,
            0,
            ACCEPT_ADDR_SIZE,
            ACCEPT_ADDR_SIZE,
            &mut local,
            &mut local_len,
            &mut remote,
            &mut remote_len,
        );
        Ok(SockAddr::from_raw(remote, remote_len))
    }
}

fn wsa_error() -> u32 {
    unsafe { ws::WSAGetLastError() as u32 }
}

/// True when an overlapped call failed for a reason other than pending
/// completion; such calls queue no completion packet.
fn failed_immediately(rc: i32) -> Option<u32> {
    if rc == 0 {
        return None;
    }
    let code = wsa_error();
    if code == ERROR_IO_PENDING || code == ws::WSA_IO_PENDING as u32 {
        None
    } else {
        Some(code)
    }
}

fn submit_operation(op: Operation) {
    let g = globals();
    match op {
        Operation::Connect { handle, addr, result } => {
            // ConnectEx requires the socket to be bound first. The bind
            // address length must be spoofed for Bluetooth sockets, which
            // reject a full SOCKADDR_STORAGE.
            let mut bind_addr = SockAddr::zeroed();
            let family = addr.family();
            unsafe {
                (*(bind_addr.as_mut_ptr())).sa_family = family;
            }
            let bind_len = if i32::from(family) == ws::AF_BTH as i32 {
                mem::size_of::<windows_sys::Win32::Devices::Bluetooth::SOCKADDR_BTH>() as i32
            } else {
                bind_addr.len()
            };
            let rc = unsafe { ws::bind(handle, bind_addr.as_ptr(), bind_len) };
            if rc != 0 {
                result.complete(CompletionResult::err(wsa_error()));
                return;
            }

            // The box keeps the address at a stable heap location for the
            // duration of the call.
            let addr = Box::new(addr);
            let addr_ptr = addr.as_ptr();
            let addr_len = addr.len();
            let overlapped = OverlappedEntry::submit(result, InFlight::Connect { _addr: addr });
            let rc = unsafe {
                (g.connect_ex)(
                    handle,
                    addr_ptr,
                    addr_len,
                    std::ptr::null(),
                    0,
                    std::ptr::null_mut(),
                    overlapped,
                )
            };
            // ConnectEx returns TRUE on immediate success and FALSE with
            // ERROR_IO_PENDING when the completion is queued.
            if rc == 0 {
                let code = wsa_error();
                if code != ERROR_IO_PENDING && code != ws::WSA_IO_PENDING as u32 {
                    fail_submitted(overlapped, code);
                }
            }
        }
        Operation::Accept { handle, result } => {
            let family = match super::net::local_addr(handle) {
                Ok(addr) => i32::from(addr.family()),
                Err(e) => {
                    result.complete(CompletionResult::err(e.code));
                    return;
                }
            };
            let client = unsafe {
                ws::WSASocketW(
                    family,
                    ws::SOCK_STREAM,
                    0,
                    std::ptr::null(),
                    0,
                    ws::WSA_FLAG_OVERLAPPED,
                )
            };
            if client == ws::INVALID_SOCKET {
                result.complete(CompletionResult::err(wsa_error()));
                return;
            }

            let mut buf = vec![0u8; (ACCEPT_ADDR_SIZE * 2) as usize];
            let buf_ptr = buf.as_mut_ptr();
            let overlapped = OverlappedEntry::submit(
                result,
                InFlight::Accept {
                    client,
                    listener: handle,
                    buf,
                },
            );
            let rc = unsafe {
                (g.accept_ex)(
                    handle,
                    client,
                    buf_ptr as *mut core::ffi::c_void,
                    0,
                    ACCEPT_ADDR_SIZE,
                    ACCEPT_ADDR_SIZE,
                    std::ptr::null_mut(),
                    overlapped,
                )
            };
            if rc == 0 {
                let code = wsa_error();
                if code != ERROR_IO_PENDING && code != ws::WSA_IO_PENDING as u32 {
                    super::net::close_raw(client);
                    fail_submitted(overlapped, code);
                }
            }
        }
        Operation::Send { handle, data, result } => {
            let mut data = data;
            let wsabuf = Box::new(ws::WSABUF {
                len: data.len() as u32,
                buf: data.as_mut_ptr(),
            });
            let buf_ptr: *const ws::WSABUF = &*wsabuf;
            let overlapped =
                OverlappedEntry::submit(result, InFlight::Send { data, _wsabuf: wsabuf });
            let rc = unsafe {
                ws::WSASend(handle, buf_ptr, 1, std::ptr::null_mut(), 0, overlapped, None)
            };
            if let Some(code) = failed_immediately(rc) {
                fail_submitted(overlapped, code);
            }
        }
        Operation::SendTo {
            handle,
            data,
            addr,
            result,
        } => {
            let mut data = data;
            let wsabuf = Box::new(ws::WSABUF {
                len: data.len() as u32,
                buf: data.as_mut_ptr(),
            });
            let addr = Box::new(addr);
            let buf_ptr: *const ws::WSABUF = &*wsabuf;
            let addr_ptr = addr.as_ptr();
            let addr_len = addr.len();
            let overlapped = OverlappedEntry::submit(
                result,
                InFlight::SendTo {
                    _data: data,
                    _wsabuf: wsabuf,
                    _addr: addr,
                },
            );
            let rc = unsafe {
                ws::WSASendTo(
                    handle,
                    buf_ptr,
                    1,
                    std::ptr::null_mut(),
                    0,
                    addr_ptr,
                    addr_len,
                    overlapped,
                    None,
                )
            };
            if let Some(code) = failed_immediately(rc) {
                fail_submitted(overlapped, code);
            }
        }
        Operation::Receive {
            handle,
            capacity,
            result,
        } => {
            let mut buf = vec![0u8; capacity];
            let wsabuf = Box::new(ws::WSABUF {
                len: capacity as u32,
                buf: buf.as_mut_ptr(),
            });
            let buf_ptr: *const ws::WSABUF = &*wsabuf;
            let overlapped =
                OverlappedEntry::submit(result, InFlight::Receive { buf, _wsabuf: wsabuf });
            let mut flags = 0u32;
            let rc = unsafe {
                ws::WSARecv(
                    handle,
                    buf_ptr,
                    1,
                    std::ptr::null_mut(),
                    &mut flags,
                    overlapped,
                    None,
                )
            };
            if let Some(code) = failed_immediately(rc) {
                fail_submitted(overlapped, code);
            }
        }
        Operation::ReceiveFrom {
            handle,
            capacity,
            result,
        } => {
            let mut buf = vec![0u8; capacity];
            let wsabuf = Box::new(ws::WSABUF {
                len: capacity as u32,
                buf: buf.as_mut_ptr(),
            });
            let mut from = Box::new(SockAddr::zeroed());
            let mut from_len = Box::new(from.len());
            let buf_ptr: *const ws::WSABUF = &*wsabuf;
            let from_ptr = from.as_mut_ptr();
            let from_len_ptr: *mut i32 = &mut *from_len;
            let overlapped = OverlappedEntry::submit(
                result,
                InFlight::ReceiveFrom {
                    buf,
                    _wsabuf: wsabuf,
                    from,
                    from_len,
                },
            );
            let mut flags = 0u32;
            let rc = unsafe {
                ws::WSARecvFrom(
                    handle,
                    buf_ptr,
                    1,
                    std::ptr::null_mut(),
                    &mut flags,
                    from_ptr,
                    from_len_ptr,
                    overlapped,
                    None,
                )
            };
            if let Some(code) = failed_immediately(rc) {
                fail_submitted(overlapped, code);
            }
        }
        Operation::Shutdown { handle } => unsafe {
            ws::shutdown(handle, ws::SD_BOTH as i32);
        },
        Operation::Close { handle } => unsafe {
            ws::closesocket(handle);
        },
        Operation::Cancel { handle } => {
            // CancelIoEx reaches I/O issued from any thread.
            let rc = unsafe { CancelIoEx(handle as HANDLE, std::ptr::null()) };
            if rc == 0 {
                let code = unsafe { GetLastError() };
                if code != windows_sys::Win32::Foundation::ERROR_NOT_FOUND {
                    warn!("CancelIoEx failed: {code}");
                }
            }
        }
    }
}

/// An overlapped call failed synchronously: no completion packet will
/// arrive, so the entry is reclaimed and the error delivered here.
fn fail_submitted(overlapped: *mut OVERLAPPED, code: u32) {
    let entry = unsafe { OverlappedEntry::reclaim(overlapped) };
    entry.completion.complete(CompletionResult::err(code));
}
