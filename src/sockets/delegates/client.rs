//! Outgoing connection establishment.

use crate::device::{ConnectionType, Device};
use crate::error::{Error, Result};
use crate::resolver::{self, ResolvedAddr};
use crate::runtime::op::{self, Completion, Operation};
use crate::sockets::handle::{Bt, Ip, SocketHandle};
use crate::sys;

/// Connects an IP socket, trying each resolved address in order.
///
/// The first success wins; all-but-the-last failure is swallowed and the
/// last propagates. Cancellation is never swallowed: it terminates the
/// loop immediately.
pub(crate) async fn connect_ip(handle: &mut SocketHandle<Ip>, device: &Device) -> Result<()> {
    let resolved = resolver::resolve(device, true)?;

    let mut last_err: Option<Error> = None;
    for entry in resolved {
        match connect_one(handle, &entry, device.conn_type).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let canceled = e.is_canceled();
                last_err = Some(e);
                if canceled {
                    break;
                }
            }
        }
    }

    Err(last_err.expect("resolver returned at least one address"))
}

async fn connect_one(
    handle: &mut SocketHandle<Ip>,
    entry: &ResolvedAddr,
    conn_type: ConnectionType,
) -> Result<()> {
    let fd = sys::new_socket(entry.family, entry.socktype, entry.protocol)?;
    handle.reset(fd);

    // Datagram sockets are connected directly; the OS queues no completion
    // for them.
    if conn_type == ConnectionType::Udp {
        sys::net::connect_sync(fd, &entry.addr)?;
        return Ok(());
    }

    op::run(
        Operation::Connect {
            handle: fd,
            addr: entry.addr.clone(),
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;

    // ConnectEx leaves the socket in a half-configured state.
    #[cfg(windows)]
    sys::net::finalize_connect(fd)?;

    Ok(())
}

/// Connects a Bluetooth socket: stream for RFCOMM, seqpacket for L2CAP.
#[cfg(target_os = "linux")]
pub(crate) async fn connect_bt(handle: &mut SocketHandle<Bt>, device: &Device) -> Result<()> {
    let (fd, addr) = match device.conn_type {
        ConnectionType::Rfcomm => sys::bt::rfcomm_endpoint(&device.address, device.port)?,
        ConnectionType::L2cap => sys::bt::l2cap_endpoint(&device.address, device.port)?,
        _ => unreachable!("Bluetooth connect with a non-Bluetooth device"),
    };
    handle.reset(fd);

    op::run(
        Operation::Connect {
            handle: fd,
            addr,
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;
    Ok(())
}

/// Only RFCOMM sockets are supported by the Microsoft Bluetooth stack.
#[cfg(windows)]
pub(crate) async fn connect_bt(handle: &mut SocketHandle<Bt>, device: &Device) -> Result<()> {
    use crate::error::{ErrorKind, SystemError};

    if device.conn_type != ConnectionType::Rfcomm {
        return Err(SystemError::new(
            windows_sys::Win32::Networking::WinSock::WSAEPROTONOSUPPORT as u32,
            ErrorKind::System,
        )
        .into());
    }

    let (socket, addr) = sys::bt::rfcomm_endpoint(&device.address, device.port)?;
    handle.reset(socket);

    op::run(
        Operation::Connect {
            handle: socket,
            addr,
            result: Completion::new(),
        },
        handle.home(),
    )
    .await?;
    sys::net::finalize_connect(socket)?;
    Ok(())
}

/// Opens an IOBluetooth channel; its completions are delivered by the
/// channel delegate callbacks rather than kqueue.
#[cfg(target_os = "macos")]
pub(crate) async fn connect_bt(handle: &mut SocketHandle<Bt>, device: &Device) -> Result<()> {
    let channel = sys::bt::Channel::open(&device.address, device.port, device.conn_type).await?;
    handle.reset(Some(channel));
    Ok(())
}
