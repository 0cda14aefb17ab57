//! The socket facade: one object type for every connection shape.
//!
//! A [`Socket`] is a sum type with one variant per concrete shape (IP/BT/TLS
//! client, IP/BT server, accepted incoming connections). Every public
//! method dispatches to the delegate logic of the shape; calling an
//! operation on a shape it does not apply to (`accept` on a client,
//! `send_to` on a stream socket) is a protocol-level bug and hits an
//! `unreachable!` arm.

use crate::device::{ConnectionType, Device, IpVersion};
use crate::error::Result;

pub(crate) mod delegates;
pub(crate) mod handle;
mod tls;

pub use self::handle::CancelHandle;

use self::delegates::{bidirectional, client, server};
use self::handle::{Bt, Ip, SocketHandle};
use self::tls::TlsState;

/// A TLS alert raised by the peer, carried in the receive payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsAlert {
    /// Standard alert name, e.g. `close_notify` or `handshake_failure`.
    pub desc: String,
    /// Whether the alert terminated the session.
    pub is_fatal: bool,
}

/// The outcome of one receive operation.
#[derive(Clone, Debug, Default)]
pub struct RecvResult {
    /// Whether the operation produced a completed result.
    pub complete: bool,
    /// True when the peer closed its end in an orderly way.
    pub closed: bool,
    /// Received (for TLS: decrypted) bytes.
    pub data: Vec<u8>,
    /// TLS alert raised while processing, if any. Never populated by
    /// non-TLS sockets.
    pub alert: Option<TlsAlert>,
}

/// An accepted connection: who connected, and the socket to talk to them.
#[derive(Debug)]
pub struct AcceptResult {
    pub device: Device,
    pub socket: Socket,
}

/// A received datagram and its sender.
#[derive(Clone, Debug)]
pub struct DgramRecvResult {
    pub from: Device,
    pub data: Vec<u8>,
}

/// Where a started server ended up listening.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ServerAddress {
    pub port: u16,
    pub ip_version: IpVersion,
}

/// A socket of any shape.
#[derive(Debug)]
pub enum Socket {
    IpClient(IpClient),
    BtClient(BtClient),
    TlsClient(TlsClient),
    IpServer(IpServer),
    BtServer(BtServer),
    IpIncoming(IpIncoming),
    BtIncoming(BtIncoming),
}

/// An outgoing TCP or UDP connection.
#[derive(Debug)]
pub struct IpClient {
    handle: SocketHandle<Ip>,
}

/// An outgoing RFCOMM or L2CAP connection.
#[derive(Debug)]
pub struct BtClient {
    handle: SocketHandle<Bt>,
}

/// An outgoing connection secured by TLS.
#[derive(Debug)]
pub struct TlsClient {
    handle: SocketHandle<Ip>,
    tls: TlsState,
}

/// A listening TCP socket or a bound UDP socket.
#[derive(Debug)]
pub struct IpServer {
    handle: SocketHandle<Ip>,
    protocol: ConnectionType,
}

/// A listening Bluetooth socket.
#[derive(Debug)]
pub struct BtServer {
    handle: SocketHandle<Bt>,
    protocol: ConnectionType,
}

/// An incoming IP connection accepted from a server.
#[derive(Debug)]
pub struct IpIncoming {
    handle: SocketHandle<Ip>,
}

/// An incoming Bluetooth connection accepted from a server.
#[derive(Debug)]
pub struct BtIncoming {
    handle: SocketHandle<Bt>,
}

impl Socket {
    /// A client socket for TCP or UDP connections.
    pub fn ip_client() -> Socket {
        Socket::IpClient(IpClient {
            handle: SocketHandle::invalid(),
        })
    }

    /// A client socket for RFCOMM or L2CAP connections.
    pub fn bt_client() -> Socket {
        Socket::BtClient(BtClient {
            handle: SocketHandle::invalid(),
        })
    }

    /// A client socket for TLS-over-TCP connections.
    pub fn tls_client() -> Socket {
        Socket::TlsClient(TlsClient {
            handle: SocketHandle::invalid(),
            tls: TlsState::new(),
        })
    }

    /// A server socket for TCP or UDP.
    pub fn ip_server() -> Socket {
        Socket::IpServer(IpServer {
            handle: SocketHandle::invalid(),
            protocol: ConnectionType::None,
        })
    }

    /// A server socket for Bluetooth.
    pub fn bt_server() -> Socket {
        Socket::BtServer(BtServer {
            handle: SocketHandle::invalid(),
            protocol: ConnectionType::None,
        })
    }

    /// Closes the socket. Idempotent; never suspends.
    pub fn close(&mut self) {
        match self {
            Socket::IpClient(s) => s.handle.close(),
            Socket::BtClient(s) => s.handle.close(),
            Socket::TlsClient(s) => s.handle.close(),
            Socket::IpServer(s) => s.handle.close(),
            Socket::BtServer(s) => s.handle.close(),
            Socket::IpIncoming(s) => s.handle.close(),
            Socket::BtIncoming(s) => s.handle.close(),
        }
    }

    /// Whether the socket currently owns a live OS handle.
    pub fn is_valid(&self) -> bool {
        match self {
            Socket::IpClient(s) => s.handle.is_valid(),
            Socket::BtClient(s) => s.handle.is_valid(),
            Socket::TlsClient(s) => s.handle.is_valid(),
            Socket::IpServer(s) => s.handle.is_valid(),
            Socket::BtServer(s) => s.handle.is_valid(),
            Socket::IpIncoming(s) => s.handle.is_valid(),
            Socket::BtIncoming(s) => s.handle.is_valid(),
        }
    }

    /// Requests abort of all pending I/O on this socket. Aborted
    /// operations resume with an error recognized by
    /// [`SystemError::is_canceled`](crate::error::SystemError::is_canceled).
    pub fn cancel_io(&self) {
        match self {
            Socket::IpClient(s) => s.handle.cancel_io(),
            Socket::BtClient(s) => s.handle.cancel_io(),
            Socket::TlsClient(s) => s.handle.cancel_io(),
            Socket::IpServer(s) => s.handle.cancel_io(),
            Socket::BtServer(s) => s.handle.cancel_io(),
            Socket::IpIncoming(s) => s.handle.cancel_io(),
            Socket::BtIncoming(s) => s.handle.cancel_io(),
        }
    }

    /// A cheap handle for canceling this socket's I/O from another thread.
    ///
    /// The handle tracks the socket's current OS resource; obtain it after
    /// connecting or starting the server.
    pub fn cancel_handle(&self) -> CancelHandle {
        match self {
            Socket::IpClient(s) => s.handle.cancel_handle(),
            Socket::BtClient(s) => s.handle.cancel_handle(),
            Socket::TlsClient(s) => s.handle.cancel_handle(),
            Socket::IpServer(s) => s.handle.cancel_handle(),
            Socket::BtServer(s) => s.handle.cancel_handle(),
            Socket::IpIncoming(s) => s.handle.cancel_handle(),
            Socket::BtIncoming(s) => s.handle.cancel_handle(),
        }
    }

    /// Connects to a remote device. Client shapes only.
    pub async fn connect(&mut self, device: &Device) -> Result<()> {
        match self {
            Socket::IpClient(s) => client::connect_ip(&mut s.handle, device).await,
            Socket::BtClient(s) => client::connect_bt(&mut s.handle, device).await,
            Socket::TlsClient(s) => s.tls.connect(&mut s.handle, device).await,
            _ => unreachable!("connect on a non-client socket"),
        }
    }

    /// Sends data; completes when the OS has accepted every byte.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Socket::IpClient(s) => {
                bidirectional::send(s.handle.raw(), s.handle.home(), data.to_vec()).await
            }
            Socket::TlsClient(s) => s.tls.send(&s.handle, data).await,
            Socket::IpIncoming(s) => {
                bidirectional::send(s.handle.raw(), s.handle.home(), data.to_vec()).await
            }
            Socket::BtClient(s) => send_bt(&s.handle, data).await,
            Socket::BtIncoming(s) => send_bt(&s.handle, data).await,
            _ => unreachable!("send on a server socket"),
        }
    }

    /// Receives up to `size` bytes.
    pub async fn recv(&mut self, size: usize) -> Result<RecvResult> {
        match self {
            Socket::IpClient(s) => {
                bidirectional::recv(s.handle.raw(), s.handle.home(), size).await
            }
            Socket::TlsClient(s) => s.tls.recv(&s.handle, size).await,
            Socket::IpIncoming(s) => {
                bidirectional::recv(s.handle.raw(), s.handle.home(), size).await
            }
            Socket::BtClient(s) => recv_bt(&s.handle, size).await,
            Socket::BtIncoming(s) => recv_bt(&s.handle, size).await,
            _ => unreachable!("recv on a server socket"),
        }
    }

    /// Binds (and for connection-oriented protocols, listens). Server
    /// shapes only. Returns the actual port and IP family.
    pub fn start_server(&mut self, device: &Device) -> Result<ServerAddress> {
        match self {
            Socket::IpServer(s) => {
                let addr = server::start_ip(&mut s.handle, device)?;
                s.protocol = device.conn_type;
                Ok(addr)
            }
            Socket::BtServer(s) => {
                let addr = server::start_bt(&mut s.handle, device)?;
                s.protocol = device.conn_type;
                Ok(addr)
            }
            _ => unreachable!("start_server on a non-server socket"),
        }
    }

    /// Accepts one incoming connection. Connection-oriented servers only.
    pub async fn accept(&mut self) -> Result<AcceptResult> {
        match self {
            Socket::IpServer(s) => {
                assert!(
                    s.protocol == ConnectionType::Tcp,
                    "accept on a connectionless server"
                );
                let (device, handle) = server::accept_ip(&s.handle).await?;
                Ok(AcceptResult {
                    device,
                    socket: Socket::IpIncoming(IpIncoming { handle }),
                })
            }
            Socket::BtServer(s) => {
                let (device, handle) = server::accept_bt(&s.handle, s.protocol).await?;
                Ok(AcceptResult {
                    device,
                    socket: Socket::BtIncoming(BtIncoming { handle }),
                })
            }
            _ => unreachable!("accept on a non-server socket"),
        }
    }

    /// Receives one datagram with its sender. UDP servers only.
    pub async fn recv_from(&mut self, size: usize) -> Result<DgramRecvResult> {
        match self {
            Socket::IpServer(s) => {
                assert!(
                    s.protocol == ConnectionType::Udp,
                    "recv_from on a connection-oriented server"
                );
                server::recv_from(&s.handle, size).await
            }
            _ => unreachable!("recv_from on a non-datagram socket"),
        }
    }

    /// Sends one datagram to a device. UDP servers only.
    pub async fn send_to(&mut self, device: &Device, data: &[u8]) -> Result<()> {
        match self {
            Socket::IpServer(s) => {
                assert!(
                    s.protocol == ConnectionType::Udp,
                    "send_to on a connection-oriented server"
                );
                server::send_to(&s.handle, device, data.to_vec()).await
            }
            _ => unreachable!("send_to on a non-datagram socket"),
        }
    }
}

#[cfg(not(target_os = "macos"))]
async fn send_bt(handle: &SocketHandle<Bt>, data: &[u8]) -> Result<()> {
    bidirectional::send(handle.raw(), handle.home(), data.to_vec()).await
}

#[cfg(not(target_os = "macos"))]
async fn recv_bt(handle: &SocketHandle<Bt>, size: usize) -> Result<RecvResult> {
    bidirectional::recv(handle.raw(), handle.home(), size).await
}

#[cfg(target_os = "macos")]
async fn send_bt(handle: &SocketHandle<Bt>, data: &[u8]) -> Result<()> {
    let Some(channel) = handle.raw() else {
        unreachable!("send on an unopened Bluetooth channel");
    };
    bidirectional::channel::send(&channel, data.to_vec()).await
}

#[cfg(target_os = "macos")]
async fn recv_bt(handle: &SocketHandle<Bt>, size: usize) -> Result<RecvResult> {
    let Some(channel) = handle.raw() else {
        unreachable!("recv on an unopened Bluetooth channel");
    };
    bidirectional::channel::recv(&channel, size).await
}
