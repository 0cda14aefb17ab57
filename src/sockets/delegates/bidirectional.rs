//! Send/receive over connected stream and datagram sockets.

use crate::error::Result;
use crate::runtime::op::{self, Completion, Operation, Payload};
use crate::sys;

use super::super::RecvResult;

/// Sends a buffer, resubmitting until the OS has accepted every byte.
pub(crate) async fn send(handle: sys::RawSocket, home: usize, data: Vec<u8>) -> Result<()> {
    let mut data = data;
    loop {
        let result = op::run(
            Operation::Send {
                handle,
                data,
                result: Completion::new(),
            },
            home,
        )
        .await?;

        let sent = result.res.max(0) as usize;
        let Payload::Buffer(buf) = result.payload else {
            return Ok(());
        };
        if sent >= buf.len() {
            return Ok(());
        }
        // Short write; push the rest.
        data = buf[sent..].to_vec();
    }
}

/// Receives up to `size` bytes. A zero-byte completion on a stream socket
/// means the peer closed its end in an orderly way.
pub(crate) async fn recv(handle: sys::RawSocket, home: usize, size: usize) -> Result<RecvResult> {
    let result = op::run(
        Operation::Receive {
            handle,
            capacity: size,
            result: Completion::new(),
        },
        home,
    )
    .await?;

    if result.res == 0 {
        return Ok(RecvResult {
            complete: true,
            closed: true,
            data: Vec::new(),
            alert: None,
        });
    }

    let data = match result.payload {
        Payload::Buffer(buf) => buf,
        _ => Vec::new(),
    };
    Ok(RecvResult {
        complete: true,
        closed: false,
        data,
        alert: None,
    })
}

/// Channel flavors for macOS Bluetooth, where the handle is not a
/// descriptor and I/O completions arrive from IOBluetooth callbacks.
#[cfg(target_os = "macos")]
pub(crate) mod channel {
    use crate::error::Result;
    use crate::sockets::RecvResult;
    use crate::sys;

    pub(crate) async fn send(channel: &sys::bt::Channel, data: Vec<u8>) -> Result<()> {
        channel.send(data).await
    }

    pub(crate) async fn recv(channel: &sys::bt::Channel, size: usize) -> Result<RecvResult> {
        let data = channel.recv(size).await?;
        Ok(RecvResult {
            complete: true,
            closed: data.is_empty(),
            data,
            alert: None,
        })
    }
}
