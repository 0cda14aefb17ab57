//! Server-side delegate logic: bind/listen, accept, and datagram I/O.

use crate::device::{ConnectionType, Device};
use crate::error::{Error, Result};
use crate::resolver;
use crate::runtime::op::{self, Completion, Operation, Payload};
use crate::sockets::handle::{Bt, Ip, SocketHandle};
use crate::sockets::{DgramRecvResult, ServerAddress};
use crate::sys;

/// Binds and (for TCP) listens; shared with [`resolver::start_server`].
pub(crate) fn start_ip(handle: &mut SocketHandle<Ip>, device: &Device) -> Result<ServerAddress> {
    resolver::start_server(device, handle)
}

/// Accepts one connection, returning the peer and the accepted handle.
pub(crate) async fn accept_ip(handle: &SocketHandle<Ip>) -> Result<(Device, SocketHandle<Ip>)> {
    let result = op::run(
        Operation::Accept {
            handle: handle.raw(),
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;

    let Payload::Accepted { socket, addr } = result.payload else {
        unreachable!("accept completed without a connection");
    };
    let incoming = SocketHandle::from_raw(socket);
    let device = resolver::from_addr(&addr, ConnectionType::Tcp)?;
    Ok((device, incoming))
}

/// Receives one datagram along with its sender.
pub(crate) async fn recv_from(
    handle: &SocketHandle<Ip>,
    size: usize,
) -> Result<DgramRecvResult> {
    let result = op::run(
        Operation::ReceiveFrom {
            handle: handle.raw(),
            capacity: size,
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;

    let Payload::Datagram { data, from } = result.payload else {
        unreachable!("datagram receive completed without an address");
    };
    let from = resolver::from_addr(&from, ConnectionType::Udp)?;
    Ok(DgramRecvResult { from, data })
}

/// Sends one datagram to a device, resolving its address numerically.
pub(crate) async fn send_to(
    handle: &SocketHandle<Ip>,
    device: &Device,
    data: Vec<u8>,
) -> Result<()> {
    let resolved = resolver::resolve(device, false)?;

    let mut last_err: Option<Error> = None;
    for entry in resolved {
        let result = op::run(
            Operation::SendTo {
                handle: handle.raw(),
                data: data.clone(),
                addr: entry.addr.clone(),
                result: Completion::new(),
            },
            handle.home(),
        )
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(e) => {
                let canceled = e.is_canceled();
                last_err = Some(e.into());
                if canceled {
                    break;
                }
            }
        }
    }

    Err(last_err.expect("resolver returned at least one address"))
}

/// Starts a Bluetooth RFCOMM/L2CAP server. Port 0 asks the stack for any
/// free channel/PSM; the assigned one is recovered from the bound address.
#[cfg(any(target_os = "linux", windows))]
pub(crate) fn start_bt(handle: &mut SocketHandle<Bt>, device: &Device) -> Result<ServerAddress> {
    let (socket, port) = sys::bt::start_server(device)?;
    handle.reset(socket);
    Ok(ServerAddress {
        port,
        ip_version: crate::device::IpVersion::None,
    })
}

#[cfg(target_os = "macos")]
pub(crate) fn start_bt(handle: &mut SocketHandle<Bt>, device: &Device) -> Result<ServerAddress> {
    let (channel, port) = sys::bt::Channel::listen(device)?;
    handle.reset(Some(channel));
    Ok(ServerAddress {
        port,
        ip_version: crate::device::IpVersion::None,
    })
}

/// Accepts one Bluetooth connection.
#[cfg(any(target_os = "linux", windows))]
pub(crate) async fn accept_bt(
    handle: &SocketHandle<Bt>,
    conn_type: ConnectionType,
) -> Result<(Device, SocketHandle<Bt>)> {
    let result = op::run(
        Operation::Accept {
            handle: handle.raw(),
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;

    let Payload::Accepted { socket, addr } = result.payload else {
        unreachable!("accept completed without a connection");
    };
    let incoming = SocketHandle::from_raw(socket);
    let device = sys::bt::device_from_addr(&addr, conn_type)?;
    Ok((device, incoming))
}

#[cfg(target_os = "macos")]
pub(crate) async fn accept_bt(
    handle: &SocketHandle<Bt>,
    conn_type: ConnectionType,
) -> Result<(Device, SocketHandle<Bt>)> {
    let Some(listener) = handle.raw() else {
        unreachable!("accept on a socket without a server channel");
    };
    let (channel, device) = listener.accept(conn_type).await?;
    Ok((device, SocketHandle::from_raw(Some(channel))))
}
