//! Async networking core for an interactive terminal for network endpoints.
//!
//! The crate provides a uniform, operation-oriented [`Socket`] over three
//! platform I/O backends (Windows IOCP, macOS kqueue + IOBluetooth, Linux
//! io_uring), a cooperative multi-threaded task [`runtime`], address
//! resolution, Bluetooth device discovery with SDP record parsing
//! ([`btutils`]), and a TLS client integration.
//!
//! # Getting started
//!
//! Initialize the runtime once, then open sockets and drive them with
//! tasks:
//!
//! ```no_run
//! use netterm::{runtime, ConnectionType, Device, Socket};
//!
//! runtime::init(0, 128).unwrap();
//!
//! let response = runtime::block_on(async {
//!     let mut sock = Socket::ip_client();
//!     sock.connect(&Device::new(ConnectionType::Tcp, "127.0.0.1", 7)).await?;
//!     sock.send(b"hello").await?;
//!     sock.recv(1024).await
//! });
//!
//! runtime::cleanup();
//! # drop(response);
//! ```
//!
//! A UI embedding the core instead pumps [`runtime::handle_events`] once
//! per frame and starts work with [`runtime::spawn`].

#![deny(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod device;
mod error;
mod resolver;
mod sockets;
mod sys;
mod uuid;

pub mod btutils;
pub mod runtime;

pub use device::{ConnectionType, Device, IpVersion};
pub use error::{is_fatal, Error, ErrorCode, ErrorKind, Result, SystemError, TlsError};
pub use sockets::{
    AcceptResult, CancelHandle, DgramRecvResult, RecvResult, ServerAddress, Socket, TlsAlert,
};
pub use uuid::{uuid_from_base, Uuid128, L2CAP_PROTO_UUID, RFCOMM_PROTO_UUID};
